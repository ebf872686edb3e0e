// =============================================================================
// Average True Range — Wilder's Smoothing Method
// =============================================================================
//
// True Range for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period

/// ATR series aligned with the input. Positions up to `period` are NaN
/// (the first TR value needs a previous close).
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len().min(highs.len()).min(lows.len());
    let mut out = vec![f64::NAN; closes.len()];
    if period == 0 || n < period + 1 {
        return out;
    }

    let mut tr = Vec::with_capacity(n - 1);
    for i in 1..n {
        let hl = highs[i] - lows[i];
        let hc = (highs[i] - closes[i - 1]).abs();
        let lc = (lows[i] - closes[i - 1]).abs();
        tr.push(hl.max(hc).max(lc));
    }

    let period_f = period as f64;
    let seed: f64 = tr[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return out;
    }
    out[period] = seed;

    let mut value = seed;
    for (j, &t) in tr.iter().enumerate().skip(period) {
        value = (value * (period_f - 1.0) + t) / period_f;
        out[j + 1] = value;
    }
    out
}

/// Most recent ATR as a fraction of the last close. NaN when unavailable.
pub fn atr_pct(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let series = atr(highs, lows, closes, period);
    let last_atr = series.last().copied().unwrap_or(f64::NAN);
    let last_close = closes.last().copied().unwrap_or(0.0);
    if !last_atr.is_finite() || last_close <= 0.0 {
        return f64::NAN;
    }
    last_atr / last_close
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(n: usize, spread: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + i as f64 * 0.1).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + spread).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - spread).collect();
        (highs, lows, closes)
    }

    #[test]
    fn atr_insufficient_data() {
        let (h, l, c) = series(10, 5.0);
        let out = atr(&h, &l, &c, 14);
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn atr_constant_range_converges() {
        let (h, l, c) = series(40, 5.0);
        let out = atr(&h, &l, &c, 14);
        let last = out[39];
        assert!((last - 10.0).abs() < 0.5, "expected ATR near 10, got {last}");
    }

    #[test]
    fn atr_gap_reflected_in_true_range() {
        // Gap up: |H - prevClose| dominates H - L.
        let highs = vec![105.0, 115.0, 118.0, 120.0, 121.0];
        let lows = vec![95.0, 108.0, 110.0, 113.0, 114.0];
        let closes = vec![95.0, 112.0, 115.0, 118.0, 119.0];
        let out = atr(&highs, &lows, &closes, 3);
        assert!(out[4] > 7.0, "ATR should reflect the gap, got {}", out[4]);
    }

    #[test]
    fn atr_period_zero() {
        let (h, l, c) = series(20, 2.0);
        assert!(atr(&h, &l, &c, 0).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn atr_pct_scale() {
        let (h, l, c) = series(40, 1.0);
        let pct = atr_pct(&h, &l, &c, 14);
        assert!(pct.is_finite());
        assert!(pct > 0.0 && pct < 0.1);
    }
}
