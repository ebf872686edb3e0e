// =============================================================================
// Ichimoku Kinko Hyo — Tenkan / Kijun / Senkou A+B / Chikou
// =============================================================================
//
//   Tenkan-Sen  = midpoint of the last `tenkan` highs/lows
//   Kijun-Sen   = midpoint of the last `kijun` highs/lows
//   Senkou A    = (Tenkan + Kijun) / 2
//   Senkou B    = midpoint of the last `senkou_b` highs/lows
//   Chikou[i]   = close[i + kijun]  (close shifted back by kijun bars)
//
// Senkou spans are evaluated at the current index (no forward displacement);
// strategies compare the latest price against the latest cloud values.

/// Output bundle for one Ichimoku computation.
pub struct IchimokuSeries {
    pub tenkan: Vec<f64>,
    pub kijun: Vec<f64>,
    pub senkou_a: Vec<f64>,
    pub senkou_b: Vec<f64>,
    pub chikou: Vec<f64>,
}

fn midpoint_series(highs: &[f64], lows: &[f64], period: usize) -> Vec<f64> {
    let n = highs.len().min(lows.len());
    let mut out = vec![f64::NAN; highs.len()];
    if period == 0 || n < period {
        return out;
    }
    for i in (period - 1)..n {
        let window = i + 1 - period..=i;
        let hh = highs[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
        let ll = lows[window].iter().cloned().fold(f64::MAX, f64::min);
        out[i] = (hh + ll) / 2.0;
    }
    out
}

pub fn ichimoku(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    tenkan_period: usize,
    kijun_period: usize,
    senkou_b_period: usize,
) -> IchimokuSeries {
    let n = closes.len();
    let tenkan = midpoint_series(highs, lows, tenkan_period);
    let kijun = midpoint_series(highs, lows, kijun_period);
    let senkou_b = midpoint_series(highs, lows, senkou_b_period);

    let mut senkou_a = vec![f64::NAN; n];
    for i in 0..n {
        if tenkan[i].is_finite() && kijun[i].is_finite() {
            senkou_a[i] = (tenkan[i] + kijun[i]) / 2.0;
        }
    }

    let mut chikou = vec![f64::NAN; n];
    for i in 0..n.saturating_sub(kijun_period) {
        chikou[i] = closes[i + kijun_period];
    }

    IchimokuSeries {
        tenkan,
        kijun,
        senkou_a,
        senkou_b,
        chikou,
    }
}
