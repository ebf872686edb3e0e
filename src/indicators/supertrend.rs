// =============================================================================
// Supertrend — ATR-banded adaptive trend line with direction
// =============================================================================
//
//   basic_upper = (H + L) / 2 + mult * ATR
//   basic_lower = (H + L) / 2 - mult * ATR
//
// Final bands ratchet: the upper band only moves down while price stays below
// it, the lower band only moves up while price stays above it. Direction is
// +1 when price is tracking the lower band (bullish), -1 when tracking the
// upper band (bearish), 0 before convergence.

use super::atr::atr;

/// Returns (supertrend_line, direction) aligned with the input. Direction is
/// +1.0 / -1.0 / 0.0.
pub fn supertrend(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
    multiplier: f64,
) -> (Vec<f64>, Vec<f64>) {
    let n = closes.len();
    let mut line = vec![f64::NAN; n];
    let mut direction = vec![0.0; n];

    let atr_series = atr(highs, lows, closes, period);
    let Some(start) = atr_series.iter().position(|v| v.is_finite()) else {
        return (line, direction);
    };

    let mut final_upper = f64::NAN;
    let mut final_lower = f64::NAN;
    let mut dir = 1.0;

    for i in start..n {
        let mid = (highs[i] + lows[i]) / 2.0;
        let basic_upper = mid + multiplier * atr_series[i];
        let basic_lower = mid - multiplier * atr_series[i];

        if i == start {
            final_upper = basic_upper;
            final_lower = basic_lower;
        } else {
            final_upper = if basic_upper < final_upper || closes[i - 1] > final_upper {
                basic_upper
            } else {
                final_upper
            };
            final_lower = if basic_lower > final_lower || closes[i - 1] < final_lower {
                basic_lower
            } else {
                final_lower
            };
        }

        dir = if closes[i] > final_upper {
            1.0
        } else if closes[i] < final_lower {
            -1.0
        } else {
            dir
        };

        direction[i] = dir;
        line[i] = if dir > 0.0 { final_lower } else { final_upper };
    }
    (line, direction)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_closes(closes: &[f64], spread: f64) -> (Vec<f64>, Vec<f64>) {
        let highs: Vec<f64> = closes.iter().map(|c| c + spread).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - spread).collect();
        (highs, lows)
    }

    #[test]
    fn uptrend_reads_bullish() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 2.0).collect();
        let (h, l) = from_closes(&closes, 1.0);
        let (line, dir) = supertrend(&h, &l, &closes, 10, 3.0);
        assert_eq!(dir[59], 1.0);
        // Bullish line tracks below price.
        assert!(line[59] < closes[59]);
    }

    #[test]
    fn downtrend_reads_bearish() {
        let closes: Vec<f64> = (0..60).map(|i| 300.0 - i as f64 * 2.0).collect();
        let (h, l) = from_closes(&closes, 1.0);
        let (line, dir) = supertrend(&h, &l, &closes, 10, 3.0);
        assert_eq!(dir[59], -1.0);
        assert!(line[59] > closes[59]);
    }

    #[test]
    fn reversal_flips_direction() {
        let mut closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 2.0).collect();
        closes.extend((0..40).map(|i| 178.0 - i as f64 * 2.5));
        let (h, l) = from_closes(&closes, 1.0);
        let (_, dir) = supertrend(&h, &l, &closes, 10, 3.0);
        assert_eq!(dir[39], 1.0);
        assert_eq!(dir[79], -1.0);
        // The flip bar exists somewhere in the back half.
        assert!(dir[40..].windows(2).any(|w| w[0] > 0.0 && w[1] < 0.0));
    }

    #[test]
    fn insufficient_data() {
        let closes = vec![100.0; 5];
        let (h, l) = from_closes(&closes, 1.0);
        let (line, dir) = supertrend(&h, &l, &closes, 10, 3.0);
        assert!(line.iter().all(|v| v.is_nan()));
        assert!(dir.iter().all(|v| *v == 0.0));
    }
}
