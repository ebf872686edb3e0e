// =============================================================================
// Reversal Strategy — RSI extreme plus multi-bar confirmation
// =============================================================================
//
// Waits for an RSI washout and then demands actual price confirmation before
// fading the move: the last `confirmation_candles` bars must already be
// turning. This is deliberately late relative to mean reversion; it trades
// fewer, cleaner reversals.
//
// LONG entry:
//   1. RSI touched <= rsi_extreme_low within the confirmation window
//   2. The last `confirmation_candles` closes are strictly rising
//
// SHORT entry: mirror image at the overbought extreme.
//
// SL: 2.0x ATR, TP: 3.0x ATR

use async_trait::async_trait;
use serde_json::json;

use super::{AnalysisContext, Strategy, StrategySignal};
use crate::indicators::{atr, compute_sl_tp, last, rsi, volume_ratio};
use crate::types::SignalDirection;

pub struct ReversalStrategy {
    pub rsi_period: usize,
    pub rsi_extreme_low: f64,
    pub rsi_extreme_high: f64,
    pub confirmation_candles: usize,
    pub atr_period: usize,
    pub weight: f64,
}

impl Default for ReversalStrategy {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_extreme_low: 20.0,
            rsi_extreme_high: 80.0,
            confirmation_candles: 3,
            atr_period: 14,
            weight: 0.10,
        }
    }
}

#[async_trait]
impl Strategy for ReversalStrategy {
    fn name(&self) -> &'static str {
        "reversal"
    }

    fn base_weight(&self) -> f64 {
        self.weight
    }

    fn min_bars_required(&self) -> usize {
        self.rsi_period + self.confirmation_candles + 20
    }

    async fn analyze(&self, ctx: &AnalysisContext<'_>) -> StrategySignal {
        if ctx.bar_count() < self.min_bars_required() {
            return StrategySignal::neutral(self.name(), ctx.pair, "Insufficient data");
        }

        let rsi_series = rsi(ctx.closes, self.rsi_period);
        let atr_series = atr(ctx.highs, ctx.lows, ctx.closes, self.atr_period);
        let vol_ratio = volume_ratio(ctx.volumes, 20);

        let n = ctx.bar_count();
        let price = ctx.price();
        let curr_rsi = rsi_series[n - 1];
        let curr_atr = last(&atr_series);

        if !curr_rsi.is_finite() {
            return StrategySignal::neutral(self.name(), ctx.pair, "Indicators not converged");
        }
        if !curr_atr.is_finite() || curr_atr <= 0.0 {
            return StrategySignal::neutral(self.name(), ctx.pair, "ATR is zero");
        }

        // Extreme check over the confirmation window plus one bar: the
        // washout happened, the confirmation candles follow it.
        let window = self.confirmation_candles + 1;
        let rsi_window = &rsi_series[n - window..];
        let rsi_low = rsi_window
            .iter()
            .cloned()
            .filter(|v| v.is_finite())
            .fold(f64::MAX, f64::min);
        let rsi_high = rsi_window
            .iter()
            .cloned()
            .filter(|v| v.is_finite())
            .fold(f64::MIN, f64::max);

        let tail = &ctx.closes[n - self.confirmation_candles..];
        let closes_rising = tail.windows(2).all(|w| w[1] > w[0]);
        let closes_falling = tail.windows(2).all(|w| w[1] < w[0]);

        let mut direction = SignalDirection::Neutral;
        let mut strength = 0.0;
        let mut confidence = 0.0;

        if rsi_low <= self.rsi_extreme_low && closes_rising {
            direction = SignalDirection::Long;
            strength = 0.45;
            confidence = 0.40;

            if rsi_low <= self.rsi_extreme_low - 10.0 {
                strength += 0.15;
                confidence += 0.10;
            }
            // RSI already recovering off the extreme.
            if curr_rsi > rsi_low + 5.0 {
                confidence += 0.08;
            }
            // Volume behind the turn.
            let curr_vr = last(&vol_ratio);
            if curr_vr.is_finite() && curr_vr > 1.2 {
                strength += 0.08;
                confidence += 0.05;
            }
        } else if rsi_high >= self.rsi_extreme_high && closes_falling {
            direction = SignalDirection::Short;
            strength = 0.45;
            confidence = 0.40;

            if rsi_high >= self.rsi_extreme_high + 10.0 {
                strength += 0.15;
                confidence += 0.10;
            }
            if curr_rsi < rsi_high - 5.0 {
                confidence += 0.08;
            }
            let curr_vr = last(&vol_ratio);
            if curr_vr.is_finite() && curr_vr > 1.2 {
                strength += 0.08;
                confidence += 0.05;
            }
        }

        let (stop_loss, take_profit) = if direction != SignalDirection::Neutral {
            compute_sl_tp(price, curr_atr, direction, 2.0, 3.0, ctx.round_trip_fee_pct)
        } else {
            (0.0, 0.0)
        };

        StrategySignal::new(
            self.name(),
            ctx.pair,
            direction,
            strength,
            confidence,
            price,
            stop_loss,
            take_profit,
            json!({
                "rsi": curr_rsi,
                "rsi_window_low": rsi_low,
                "rsi_window_high": rsi_high,
                "closes_rising": closes_rising,
                "closes_falling": closes_falling,
                "atr": curr_atr,
            }),
        )
    }
}
