// =============================================================================
// MACD — Moving Average Convergence / Divergence
// =============================================================================
//
//   macd      = EMA(fast) - EMA(slow)
//   signal    = EMA(macd, signal_period)
//   histogram = macd - signal

use super::ma::ema;

/// Returns (macd, signal, histogram) series aligned with the input.
pub fn macd(
    values: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = values.len();
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);

    let mut macd_line = vec![f64::NAN; n];
    for i in 0..n {
        if fast_ema[i].is_finite() && slow_ema[i].is_finite() {
            macd_line[i] = fast_ema[i] - slow_ema[i];
        }
    }

    // Signal line: EMA over the converged portion of the MACD line.
    let mut signal_line = vec![f64::NAN; n];
    let start = macd_line.iter().position(|v| v.is_finite());
    if let Some(start) = start {
        let converged = &macd_line[start..];
        let sig = ema(converged, signal_period);
        for (j, v) in sig.into_iter().enumerate() {
            signal_line[start + j] = v;
        }
    }

    let mut histogram = vec![f64::NAN; n];
    for i in 0..n {
        if macd_line[i].is_finite() && signal_line[i].is_finite() {
            histogram[i] = macd_line[i] - signal_line[i];
        }
    }
    (macd_line, signal_line, histogram)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_positive_in_uptrend() {
        let vals: Vec<f64> = (0..120).map(|i| 100.0 + i as f64 * 0.5).collect();
        let (line, signal, hist) = macd(&vals, 12, 26, 9);
        assert!(line[119] > 0.0);
        assert!(signal[119].is_finite());
        assert!(hist[119].is_finite());
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let vals: Vec<f64> = (0..120).map(|i| 200.0 - i as f64 * 0.5).collect();
        let (line, _, _) = macd(&vals, 12, 26, 9);
        assert!(line[119] < 0.0);
    }

    #[test]
    fn macd_flat_is_zero() {
        let vals = vec![100.0; 120];
        let (line, _, hist) = macd(&vals, 12, 26, 9);
        assert!(line[119].abs() < 1e-9);
        assert!(hist[119].abs() < 1e-9);
    }

    #[test]
    fn macd_insufficient_data() {
        let (line, signal, hist) = macd(&[1.0; 10], 12, 26, 9);
        assert!(line.iter().all(|v| v.is_nan()));
        assert!(signal.iter().all(|v| v.is_nan()));
        assert!(hist.iter().all(|v| v.is_nan()));
    }
}
