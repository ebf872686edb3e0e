// =============================================================================
// Trend Strategy — EMA cross with ADX trend-strength filter
// =============================================================================
//
// LONG entry:  fast EMA crosses above slow EMA on this bar + ADX >= threshold
// SHORT entry: fast EMA crosses below slow EMA + ADX >= threshold
//
// SL: 2.0x ATR, TP: 3.0x ATR

use async_trait::async_trait;
use serde_json::json;

use super::{AnalysisContext, Strategy, StrategySignal};
use crate::indicators::{adx, atr, compute_sl_tp, ema, last};
use crate::types::SignalDirection;

pub struct TrendStrategy {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub adx_threshold: f64,
    pub atr_period: usize,
    pub weight: f64,
}

impl Default for TrendStrategy {
    fn default() -> Self {
        Self {
            ema_fast: 5,
            ema_slow: 13,
            adx_threshold: 25.0,
            atr_period: 14,
            weight: 0.15,
        }
    }
}

#[async_trait]
impl Strategy for TrendStrategy {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn base_weight(&self) -> f64 {
        self.weight
    }

    fn min_bars_required(&self) -> usize {
        self.ema_slow.max(2 * self.atr_period) + 20
    }

    async fn analyze(&self, ctx: &AnalysisContext<'_>) -> StrategySignal {
        if ctx.bar_count() < self.min_bars_required() {
            return StrategySignal::neutral(self.name(), ctx.pair, "Insufficient data");
        }

        let fast = ema(ctx.closes, self.ema_fast);
        let slow = ema(ctx.closes, self.ema_slow);
        let adx_series = adx(ctx.highs, ctx.lows, ctx.closes, self.atr_period);
        let atr_series = atr(ctx.highs, ctx.lows, ctx.closes, self.atr_period);

        let n = ctx.bar_count();
        let (curr_fast, prev_fast) = (fast[n - 1], fast[n - 2]);
        let (curr_slow, prev_slow) = (slow[n - 1], slow[n - 2]);
        let curr_adx = last(&adx_series);
        let curr_atr = last(&atr_series);
        let price = ctx.price();

        for v in [curr_fast, prev_fast, curr_slow, prev_slow, curr_adx] {
            if !v.is_finite() {
                return StrategySignal::neutral(self.name(), ctx.pair, "Indicators not converged");
            }
        }
        if !curr_atr.is_finite() || curr_atr <= 0.0 {
            return StrategySignal::neutral(self.name(), ctx.pair, "ATR is zero");
        }

        let bullish_cross = prev_fast <= prev_slow && curr_fast > curr_slow;
        let bearish_cross = prev_fast >= prev_slow && curr_fast < curr_slow;
        let trending = curr_adx >= self.adx_threshold;

        let mut direction = SignalDirection::Neutral;
        let mut strength = 0.0;
        let mut confidence = 0.0;

        if bullish_cross && trending {
            direction = SignalDirection::Long;
            strength = 0.50;
            confidence = 0.45;

            // Strong trend bonus.
            if curr_adx >= self.adx_threshold + 10.0 {
                strength += 0.15;
                confidence += 0.10;
            }
            // Price riding the fast EMA confirms momentum.
            if price > curr_fast {
                confidence += 0.08;
            }
            // Cross separation: a decisive cross scores better than a graze.
            let sep_pct = (curr_fast - curr_slow) / price;
            if sep_pct > 0.001 {
                strength += 0.10;
                confidence += 0.05;
            }
        } else if bearish_cross && trending {
            direction = SignalDirection::Short;
            strength = 0.50;
            confidence = 0.45;

            if curr_adx >= self.adx_threshold + 10.0 {
                strength += 0.15;
                confidence += 0.10;
            }
            if price < curr_fast {
                confidence += 0.08;
            }
            let sep_pct = (curr_slow - curr_fast) / price;
            if sep_pct > 0.001 {
                strength += 0.10;
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
                "ema_fast": curr_fast,
                "ema_slow": curr_slow,
                "adx": curr_adx,
                "bullish_cross": bullish_cross,
                "bearish_cross": bearish_cross,
                "atr": curr_atr,
            }),
        )
    }
}
