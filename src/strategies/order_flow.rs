// =============================================================================
// Order Flow Strategy — microstructure pressure from the order book
// =============================================================================
//
// The only strategy consuming order-book microstructure. Book imbalance is a
// leading indicator: it shows where size is positioned before price moves.
//
// LONG entry:
//   1. book_score > threshold (strong bid-side imbalance)
//   2. Spread compression (tight spread = about to move)
//   3. Price making higher lows (bid absorption)
//
// SHORT entry: mirror image with lower highs.
//
// Degrades to NEUTRAL when book data is missing or stale.
//
// SL: 2.0x ATR, TP: 3.0x ATR

use async_trait::async_trait;
use serde_json::json;

use super::{AnalysisContext, Strategy, StrategySignal};
use crate::indicators::{atr, compute_sl_tp, last};
use crate::types::SignalDirection;

pub struct OrderFlowStrategy {
    pub book_score_threshold: f64,
    pub spread_tight_pct: f64,
    pub hl_lookback: usize,
    pub max_book_age_seconds: f64,
    pub atr_period: usize,
    pub weight: f64,
}

impl Default for OrderFlowStrategy {
    fn default() -> Self {
        Self {
            book_score_threshold: 0.3,
            spread_tight_pct: 0.0010,
            hl_lookback: 5,
            max_book_age_seconds: 5.0,
            atr_period: 14,
            weight: 0.15,
        }
    }
}

#[async_trait]
impl Strategy for OrderFlowStrategy {
    fn name(&self) -> &'static str {
        "order_flow"
    }

    fn base_weight(&self) -> f64 {
        self.weight
    }

    fn min_bars_required(&self) -> usize {
        (self.hl_lookback + 5).max(30)
    }

    async fn analyze(&self, ctx: &AnalysisContext<'_>) -> StrategySignal {
        if ctx.bar_count() < self.min_bars_required() {
            return StrategySignal::neutral(self.name(), ctx.pair, "Insufficient data");
        }

        let Some(book) = ctx.book else {
            return StrategySignal::neutral(self.name(), ctx.pair, "No order book analysis");
        };
        if let Some(age) = ctx.book_age_seconds {
            if age > self.max_book_age_seconds {
                return StrategySignal::neutral(self.name(), ctx.pair, "Book data stale");
            }
        }

        let atr_series = atr(ctx.highs, ctx.lows, ctx.closes, self.atr_period);
        let price = ctx.price();
        let curr_atr = last(&atr_series);
        if !curr_atr.is_finite() || curr_atr <= 0.0 {
            return StrategySignal::neutral(self.name(), ctx.pair, "ATR is zero");
        }

        let book_score = book.book_score;
        let spread_pct = book.spread_pct;
        let obi = book.obi;
        let whale_bias = book.whale_bias;

        // Price action: higher lows (accumulation) / lower highs (distribution).
        let n = ctx.bar_count();
        let lb = self.hl_lookback;
        let recent_lows = &ctx.lows[n - lb..];
        let recent_highs = &ctx.highs[n - lb..];
        let higher_lows = recent_lows.windows(2).all(|w| w[1] >= w[0]);
        let lower_highs = recent_highs.windows(2).all(|w| w[1] <= w[0]);
        let spread_tight = spread_pct < self.spread_tight_pct;

        let mut direction = SignalDirection::Neutral;
        let mut strength = 0.0;
        let mut confidence = 0.0;

        if book_score > self.book_score_threshold {
            direction = SignalDirection::Long;
            strength = 0.40;
            confidence = 0.35;

            let score_excess = book_score - self.book_score_threshold;
            strength += (score_excess * 0.5).min(0.25);
            confidence += (score_excess * 0.4).min(0.20);

            if spread_tight {
                strength += 0.10;
                confidence += 0.08;
            }
            if higher_lows {
                strength += 0.10;
                confidence += 0.10;
            }
            if whale_bias > 0.1 {
                confidence += 0.08;
            }
            if obi > 0.15 {
                confidence += 0.05;
            }
        } else if book_score < -self.book_score_threshold {
            direction = SignalDirection::Short;
            strength = 0.40;
            confidence = 0.35;

            let score_excess = book_score.abs() - self.book_score_threshold;
            strength += (score_excess * 0.5).min(0.25);
            confidence += (score_excess * 0.4).min(0.20);

            if spread_tight {
                strength += 0.10;
                confidence += 0.08;
            }
            if lower_highs {
                strength += 0.10;
                confidence += 0.10;
            }
            if whale_bias < -0.1 {
                confidence += 0.08;
            }
            if obi < -0.15 {
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
                "book_score": book_score,
                "obi": obi,
                "whale_bias": whale_bias,
                "spread_pct": spread_pct,
                "spread_tight": spread_tight,
                "higher_lows": higher_lows,
                "lower_highs": lower_highs,
                "atr": curr_atr,
            }),
        )
    }
}
