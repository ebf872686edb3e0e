// =============================================================================
// Average Directional Index — trend strength
// =============================================================================
//
//   +DM = H_t - H_{t-1} when it exceeds the down-move, else 0
//   -DM = L_{t-1} - L_t when it exceeds the up-move, else 0
//   +DI / -DI = 100 * smoothed(DM) / smoothed(TR)
//   DX  = 100 * |+DI - -DI| / (+DI + -DI)
//   ADX = Wilder-smoothed DX
//
// Convergence needs roughly 2 * period bars; earlier positions are NaN.

/// ADX series aligned with the input.
pub fn adx(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len().min(highs.len()).min(lows.len());
    let mut out = vec![f64::NAN; closes.len()];
    if period == 0 || n < 2 * period + 1 {
        return out;
    }

    let m = n - 1;
    let mut tr = vec![0.0; m];
    let mut plus_dm = vec![0.0; m];
    let mut minus_dm = vec![0.0; m];

    for i in 1..n {
        let up = highs[i] - highs[i - 1];
        let down = lows[i - 1] - lows[i];
        plus_dm[i - 1] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i - 1] = if down > up && down > 0.0 { down } else { 0.0 };

        let hl = highs[i] - lows[i];
        let hc = (highs[i] - closes[i - 1]).abs();
        let lc = (lows[i] - closes[i - 1]).abs();
        tr[i - 1] = hl.max(hc).max(lc);
    }

    let period_f = period as f64;
    let mut tr_s: f64 = tr[..period].iter().sum();
    let mut plus_s: f64 = plus_dm[..period].iter().sum();
    let mut minus_s: f64 = minus_dm[..period].iter().sum();

    let mut dx = vec![f64::NAN; m];
    for i in period..m {
        // Wilder smoothing of the running sums.
        tr_s = tr_s - tr_s / period_f + tr[i];
        plus_s = plus_s - plus_s / period_f + plus_dm[i];
        minus_s = minus_s - minus_s / period_f + minus_dm[i];

        if tr_s <= 0.0 {
            dx[i] = 0.0;
            continue;
        }
        let plus_di = 100.0 * plus_s / tr_s;
        let minus_di = 100.0 * minus_s / tr_s;
        let di_sum = plus_di + minus_di;
        dx[i] = if di_sum > 0.0 {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        };
    }

    // Seed ADX with the SMA of the first `period` DX values, then smooth.
    let first_dx = period;
    let seed_end = first_dx + period;
    if seed_end > m {
        return out;
    }
    let mut adx_val: f64 = dx[first_dx..seed_end].iter().sum::<f64>() / period_f;
    out[seed_end] = adx_val; // dx index i corresponds to bar i + 1

    for i in seed_end..m {
        adx_val = (adx_val * (period_f - 1.0) + dx[i]) / period_f;
        out[i + 1] = adx_val;
    }
    out
}
