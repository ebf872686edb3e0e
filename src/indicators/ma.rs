// =============================================================================
// Moving Averages — SMA and EMA
// =============================================================================

/// Simple moving average. Positions before `period - 1` are NaN.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }

    let mut window_sum: f64 = values[..period].iter().sum();
    out[period - 1] = window_sum / period as f64;
    for i in period..n {
        window_sum += values[i] - values[i - period];
        out[i] = window_sum / period as f64;
    }
    out
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values. Positions before `period - 1` are NaN.
///
/// Smoothing factor k = 2 / (period + 1).
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;

    let mut prev = seed;
    for i in period..n {
        prev = values[i] * k + prev * (1.0 - k);
        out[i] = prev;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_basic() {
        let vals = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let out = sma(&vals, 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert!((out[2] - 2.0).abs() < 1e-12);
        assert!((out[3] - 3.0).abs() < 1e-12);
        assert!((out[4] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn sma_insufficient_data() {
        let out = sma(&[1.0, 2.0], 5);
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn ema_converges_to_constant() {
        let vals = vec![10.0; 50];
        let out = ema(&vals, 9);
        assert!((out[49] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn ema_responds_to_trend() {
        let vals: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let fast = ema(&vals, 5);
        let slow = ema(&vals, 20);
        // In a steady uptrend the fast EMA sits above the slow one.
        assert!(fast[59] > slow[59]);
    }

    #[test]
    fn ema_period_zero_all_nan() {
        let out = ema(&[1.0, 2.0, 3.0], 0);
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn ema_deterministic() {
        let vals: Vec<f64> = (0..100).map(|i| (i as f64 * 0.37).sin() * 5.0 + 50.0).collect();
        let a = ema(&vals, 13);
        let b = ema(&vals, 13);
        assert_eq!(a, b);
    }
}
