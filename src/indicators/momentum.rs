// =============================================================================
// Momentum and Volume Ratio
// =============================================================================

use super::ma::sma;

/// Price momentum: values[i] - values[i - period]. NaN for the first `period`
/// positions.
pub fn momentum(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 {
        return out;
    }
    for i in period..n {
        out[i] = values[i] - values[i - period];
    }
    out
}

/// Current volume relative to its rolling SMA. 1.0 means average volume,
/// 2.0 means twice the recent average. NaN until the SMA converges or when
/// the average is zero.
pub fn volume_ratio(volumes: &[f64], period: usize) -> Vec<f64> {
    let n = volumes.len();
    let avg = sma(volumes, period);
    let mut out = vec![f64::NAN; n];
    for i in 0..n {
        if avg[i].is_finite() && avg[i] > 0.0 {
            out[i] = volumes[i] / avg[i];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn momentum_uptrend_positive() {
        let vals: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let out = momentum(&vals, 12);
        assert!((out[29] - 12.0).abs() < 1e-12);
    }

    #[test]
    fn momentum_flat_zero() {
        let out = momentum(&[5.0; 20], 12);
        assert!(out[19].abs() < 1e-12);
        assert!(out[5].is_nan());
    }

    #[test]
    fn volume_ratio_spike() {
        let mut vols = vec![100.0; 30];
        vols[29] = 300.0;
        let out = volume_ratio(&vols, 20);
        // Spike bar reads well above average.
        assert!(out[29] > 2.0);
        assert!((out[28] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn volume_ratio_zero_average_is_nan() {
        let vols = vec![0.0; 30];
        let out = volume_ratio(&vols, 20);
        assert!(out.iter().all(|v| v.is_nan()));
    }
}
