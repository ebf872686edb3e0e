// =============================================================================
// Stochastic Oscillator — %K / %D with smoothing
// =============================================================================
//
//   raw %K  = 100 * (close - lowest_low) / (highest_high - lowest_low)
//   %K      = SMA(raw %K, smooth)
//   %D      = SMA(%K, d_period)

use super::ma::sma;

/// Returns (%K, %D) series aligned with the input.
pub fn stochastic(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    k_period: usize,
    d_period: usize,
    smooth: usize,
) -> (Vec<f64>, Vec<f64>) {
    let n = closes.len().min(highs.len()).min(lows.len());
    let mut raw_k = vec![f64::NAN; closes.len()];
    if k_period == 0 || n < k_period {
        return (raw_k.clone(), raw_k);
    }

    for i in (k_period - 1)..n {
        let window = i + 1 - k_period..=i;
        let hh = highs[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
        let ll = lows[window].iter().cloned().fold(f64::MAX, f64::min);
        let range = hh - ll;
        raw_k[i] = if range > 0.0 {
            100.0 * (closes[i] - ll) / range
        } else {
            50.0
        };
    }

    let pct_k = smooth_tail(&raw_k, smooth.max(1));
    let pct_d = smooth_tail(&pct_k, d_period.max(1));
    (pct_k, pct_d)
}

/// SMA applied to the converged (finite) tail of a series, NaN elsewhere.
fn smooth_tail(series: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; series.len()];
    if let Some(start) = series.iter().position(|v| v.is_finite()) {
        let tail = &series[start..];
        let smoothed = sma(tail, period);
        for (j, v) in smoothed.into_iter().enumerate() {
            out[start + j] = v;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let closes: Vec<f64> = (0..n).map(|i| 100.0 + (i as f64 * 0.4).sin() * 5.0).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        (highs, lows, closes)
    }

    #[test]
    fn stochastic_bounded_0_100() {
        let (h, l, c) = fixture(80);
        let (k, d) = stochastic(&h, &l, &c, 14, 3, 3);
        for v in k.iter().chain(d.iter()).filter(|v| v.is_finite()) {
            assert!(*v >= 0.0 && *v <= 100.0);
        }
    }

    #[test]
    fn stochastic_top_of_range_near_100() {
        // Monotone rally closes at the high of every window.
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let highs = closes.clone();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.1).collect();
        let (k, _) = stochastic(&highs, &lows, &closes, 14, 3, 3);
        assert!(k[39] > 95.0);
    }

    #[test]
    fn stochastic_flat_range_is_50() {
        let closes = vec![100.0; 40];
        let highs = vec![100.0; 40];
        let lows = vec![100.0; 40];
        let (k, _) = stochastic(&highs, &lows, &closes, 14, 3, 3);
        assert!((k[39] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn stochastic_insufficient_data() {
        let (k, d) = stochastic(&[1.0; 5], &[1.0; 5], &[1.0; 5], 14, 3, 3);
        assert!(k.iter().all(|v| v.is_nan()));
        assert!(d.iter().all(|v| v.is_nan()));
    }
}
