// =============================================================================
// Bollinger Bands — SMA +/- k standard deviations
// =============================================================================

use super::ma::sma;

/// Returns (upper, middle, lower) band series aligned with the input.
/// Positions before `period - 1` are NaN. Standard deviation is population
/// (divide by n), matching the conventional band definition.
pub fn bollinger_bands(values: &[f64], period: usize, k: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = values.len();
    let middle = sma(values, period);
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    if period == 0 || n < period {
        return (upper, middle, lower);
    }

    for i in (period - 1)..n {
        let window = &values[i + 1 - period..=i];
        let mean = middle[i];
        let var = window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / period as f64;
        let sd = var.max(0.0).sqrt();
        upper[i] = mean + k * sd;
        lower[i] = mean - k * sd;
    }
    (upper, middle, lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_flat_series_collapse() {
        let vals = vec![50.0; 30];
        let (upper, middle, lower) = bollinger_bands(&vals, 20, 2.0);
        assert!((upper[29] - 50.0).abs() < 1e-9);
        assert!((middle[29] - 50.0).abs() < 1e-9);
        assert!((lower[29] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn bands_ordering() {
        let vals: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.9).sin() * 4.0).collect();
        let (upper, middle, lower) = bollinger_bands(&vals, 20, 2.0);
        for i in 19..60 {
            assert!(upper[i] >= middle[i]);
            assert!(middle[i] >= lower[i]);
        }
    }

    #[test]
    fn bands_widen_with_volatility() {
        let calm: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64).sin() * 0.5).collect();
        let wild: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64).sin() * 8.0).collect();
        let (cu, _, cl) = bollinger_bands(&calm, 20, 2.0);
        let (wu, _, wl) = bollinger_bands(&wild, 20, 2.0);
        assert!((wu[39] - wl[39]) > (cu[39] - cl[39]));
    }

    #[test]
    fn bands_insufficient_data() {
        let (u, m, l) = bollinger_bands(&[1.0, 2.0], 20, 2.0);
        assert!(u.iter().chain(m.iter()).chain(l.iter()).all(|v| v.is_nan()));
    }
}
