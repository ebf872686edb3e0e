// =============================================================================
// Garman-Klass volatility estimator
// =============================================================================
//
// Per-bar variance estimate using the full OHLC range:
//   gk = 0.5 * ln(H/L)^2 - (2 ln 2 - 1) * ln(C/O)^2
//
// The series value is the square root of the rolling mean of gk over
// `window` bars, i.e. a per-bar volatility estimate.

use super::ma::sma;

pub fn garman_klass(
    opens: &[f64],
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    window: usize,
) -> Vec<f64> {
    let n = closes
        .len()
        .min(opens.len())
        .min(highs.len())
        .min(lows.len());
    let mut per_bar = vec![f64::NAN; closes.len()];

    const K: f64 = 2.0 * std::f64::consts::LN_2 - 1.0;
    for i in 0..n {
        if opens[i] <= 0.0 || lows[i] <= 0.0 {
            continue;
        }
        let hl = (highs[i] / lows[i]).ln();
        let co = (closes[i] / opens[i]).ln();
        let v = 0.5 * hl * hl - K * co * co;
        if v.is_finite() {
            per_bar[i] = v.max(0.0);
        }
    }

    // Rolling mean over the converged tail, then sqrt.
    let mut out = vec![f64::NAN; closes.len()];
    if let Some(start) = per_bar.iter().position(|v| v.is_finite()) {
        let smoothed = sma(&per_bar[start..], window.max(1));
        for (j, v) in smoothed.into_iter().enumerate() {
            if v.is_finite() {
                out[start + j] = v.max(0.0).sqrt();
            }
        }
    }
    out
}
