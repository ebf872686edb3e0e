// =============================================================================
// Relative Strength Index — Wilder's smoothing
// =============================================================================
//
//   RS  = avg_gain / avg_loss
//   RSI = 100 - 100 / (1 + RS)
//
// Seed averages are the SMA of the first `period` gains/losses; subsequent
// values use Wilder smoothing: avg = (avg * (period - 1) + current) / period.

/// RSI over `values`. Positions up to and including `period - 1` are NaN.
/// A flat series (zero losses) reports 100.
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for i in 1..=period {
        let delta = values[i] - values[i - 1];
        if delta >= 0.0 {
            gain_sum += delta;
        } else {
            loss_sum += -delta;
        }
    }

    let period_f = period as f64;
    let mut avg_gain = gain_sum / period_f;
    let mut avg_loss = loss_sum / period_f;
    out[period] = rsi_from_averages(avg_gain, avg_loss);

    for i in (period + 1)..n {
        let delta = values[i] - values[i - 1];
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        out[i] = rsi_from_averages(avg_gain, avg_loss);
    }
    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if !avg_gain.is_finite() || !avg_loss.is_finite() {
        return f64::NAN;
    }
    if avg_loss <= 0.0 {
        return if avg_gain > 0.0 { 100.0 } else { 50.0 };
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
