// =============================================================================
// Keltner Strategy — channel envelope break with MACD + RSI confirmation
// =============================================================================
//
// Buys dislocations below the lower Keltner Channel when momentum is already
// turning: MACD histogram rising off a low and RSI depressed but not broken.
// Shorts the mirror image above the upper channel.
//
// LONG entry:  close < KC lower + MACD histogram rising + RSI <= rsi_long_max
// SHORT entry: close > KC upper + MACD histogram falling + RSI >= rsi_short_min
//
// SL: 2.0x ATR, TP: 3.0x ATR

use async_trait::async_trait;
use serde_json::json;

use super::{AnalysisContext, Strategy, StrategySignal};
use crate::indicators::{atr, compute_sl_tp, keltner_channels, last, macd, rsi};
use crate::types::SignalDirection;

pub struct KeltnerStrategy {
    pub ema_period: usize,
    pub atr_period: usize,
    pub kc_multiplier: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub rsi_period: usize,
    pub rsi_long_max: f64,
    pub rsi_short_min: f64,
    pub weight: f64,
}

impl Default for KeltnerStrategy {
    fn default() -> Self {
        Self {
            ema_period: 20,
            atr_period: 14,
            kc_multiplier: 1.5,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            rsi_period: 14,
            rsi_long_max: 40.0,
            rsi_short_min: 60.0,
            weight: 0.30,
        }
    }
}

#[async_trait]
impl Strategy for KeltnerStrategy {
    fn name(&self) -> &'static str {
        "keltner"
    }

    fn base_weight(&self) -> f64 {
        self.weight
    }

    fn min_bars_required(&self) -> usize {
        self.macd_slow + self.macd_signal + 20
    }

    async fn analyze(&self, ctx: &AnalysisContext<'_>) -> StrategySignal {
        if ctx.bar_count() < self.min_bars_required() {
            return StrategySignal::neutral(self.name(), ctx.pair, "Insufficient data");
        }

        let (kc_upper, kc_mid, kc_lower) = keltner_channels(
            ctx.highs,
            ctx.lows,
            ctx.closes,
            self.ema_period,
            self.atr_period,
            self.kc_multiplier,
        );
        let (_, _, histogram) = macd(ctx.closes, self.macd_fast, self.macd_slow, self.macd_signal);
        let rsi_series = rsi(ctx.closes, self.rsi_period);
        let atr_series = atr(ctx.highs, ctx.lows, ctx.closes, self.atr_period);

        let n = ctx.bar_count();
        let price = ctx.price();
        let upper = last(&kc_upper);
        let mid = last(&kc_mid);
        let lower = last(&kc_lower);
        let curr_hist = histogram[n - 1];
        let prev_hist = histogram[n - 2];
        let curr_rsi = last(&rsi_series);
        let curr_atr = last(&atr_series);

        for v in [upper, mid, lower, curr_hist, prev_hist, curr_rsi] {
            if !v.is_finite() {
                return StrategySignal::neutral(self.name(), ctx.pair, "Indicators not converged");
            }
        }
        if !curr_atr.is_finite() || curr_atr <= 0.0 {
            return StrategySignal::neutral(self.name(), ctx.pair, "ATR is zero");
        }

        let hist_rising = curr_hist > prev_hist;
        let hist_falling = curr_hist < prev_hist;

        let mut direction = SignalDirection::Neutral;
        let mut strength = 0.0;
        let mut confidence = 0.0;

        if price < lower && hist_rising && curr_rsi <= self.rsi_long_max {
            direction = SignalDirection::Long;
            strength = 0.55;
            confidence = 0.50;

            // Deeper channel overshoot carries more edge.
            let overshoot = (lower - price) / price.max(1e-12);
            if overshoot > 0.003 {
                strength += 0.15;
                confidence += 0.08;
            }
            // Histogram already back above zero: reversal underway.
            if curr_hist > 0.0 {
                confidence += 0.08;
            }
            if curr_rsi <= self.rsi_long_max - 10.0 {
                strength += 0.05;
                confidence += 0.05;
            }
        } else if price > upper && hist_falling && curr_rsi >= self.rsi_short_min {
            direction = SignalDirection::Short;
            strength = 0.55;
            confidence = 0.50;

            let overshoot = (price - upper) / price.max(1e-12);
            if overshoot > 0.003 {
                strength += 0.15;
                confidence += 0.08;
            }
            if curr_hist < 0.0 {
                confidence += 0.08;
            }
            if curr_rsi >= self.rsi_short_min + 10.0 {
                strength += 0.05;
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
                "kc_upper": upper,
                "kc_middle": mid,
                "kc_lower": lower,
                "macd_histogram": curr_hist,
                "hist_rising": hist_rising,
                "rsi": curr_rsi,
                "atr": curr_atr,
            }),
        )
    }
}
