// =============================================================================
// Keltner Channels — EMA midline +/- multiplier * ATR
// =============================================================================

use super::atr::atr;
use super::ma::ema;

/// Returns (upper, middle, lower) channel series aligned with the input.
/// A position is NaN until both the EMA and the ATR have converged.
pub fn keltner_channels(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    ema_period: usize,
    atr_period: usize,
    multiplier: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = closes.len();
    let middle = ema(closes, ema_period);
    let atr_series = atr(highs, lows, closes, atr_period);

    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    for i in 0..n {
        if middle[i].is_finite() && atr_series[i].is_finite() {
            upper[i] = middle[i] + multiplier * atr_series[i];
            lower[i] = middle[i] - multiplier * atr_series[i];
        }
    }
    (upper, middle, lower)
}
