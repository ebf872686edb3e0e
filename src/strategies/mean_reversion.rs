// =============================================================================
// Mean Reversion Strategy — Bollinger Band touch at an RSI extreme
// =============================================================================
//
// LONG entry:  close at/below the lower band + RSI <= oversold
// SHORT entry: close at/above the upper band + RSI >= overbought
//
// SL: 2.0x ATR, TP: 3.0x ATR

use async_trait::async_trait;
use serde_json::json;

use super::{AnalysisContext, Strategy, StrategySignal};
use crate::indicators::{atr, bollinger_bands, compute_sl_tp, last, rsi};
use crate::types::SignalDirection;

pub struct MeanReversionStrategy {
    pub bb_period: usize,
    pub bb_std: f64,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub atr_period: usize,
    pub weight: f64,
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self {
            bb_period: 20,
            bb_std: 2.0,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            atr_period: 14,
            weight: 0.25,
        }
    }
}

#[async_trait]
impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn base_weight(&self) -> f64 {
        self.weight
    }

    fn min_bars_required(&self) -> usize {
        self.bb_period.max(self.rsi_period) + 20
    }

    async fn analyze(&self, ctx: &AnalysisContext<'_>) -> StrategySignal {
        if ctx.bar_count() < self.min_bars_required() {
            return StrategySignal::neutral(self.name(), ctx.pair, "Insufficient data");
        }

        let (upper, middle, lower) = bollinger_bands(ctx.closes, self.bb_period, self.bb_std);
        let rsi_series = rsi(ctx.closes, self.rsi_period);
        let atr_series = atr(ctx.highs, ctx.lows, ctx.closes, self.atr_period);

        let price = ctx.price();
        let bb_upper = last(&upper);
        let bb_mid = last(&middle);
        let bb_lower = last(&lower);
        let curr_rsi = last(&rsi_series);
        let curr_atr = last(&atr_series);

        for v in [bb_upper, bb_mid, bb_lower, curr_rsi] {
            if !v.is_finite() {
                return StrategySignal::neutral(self.name(), ctx.pair, "Indicators not converged");
            }
        }
        if !curr_atr.is_finite() || curr_atr <= 0.0 {
            return StrategySignal::neutral(self.name(), ctx.pair, "ATR is zero");
        }

        let mut direction = SignalDirection::Neutral;
        let mut strength = 0.0;
        let mut confidence = 0.0;

        if price <= bb_lower && curr_rsi <= self.rsi_oversold {
            direction = SignalDirection::Long;
            strength = 0.50;
            confidence = 0.45;

            // Deep oversold reads stronger.
            if curr_rsi <= self.rsi_oversold - 10.0 {
                strength += 0.15;
                confidence += 0.10;
            }
            // Distance below the band scales the edge.
            let band_overshoot = (bb_lower - price) / price.max(1e-12);
            if band_overshoot > 0.002 {
                strength += 0.10;
                confidence += 0.05;
            }
            // Wide bands mean a real dislocation rather than noise.
            if bb_mid > 0.0 && (bb_upper - bb_lower) / bb_mid > 0.01 {
                confidence += 0.05;
            }
        } else if price >= bb_upper && curr_rsi >= self.rsi_overbought {
            direction = SignalDirection::Short;
            strength = 0.50;
            confidence = 0.45;

            if curr_rsi >= self.rsi_overbought + 10.0 {
                strength += 0.15;
                confidence += 0.10;
            }
            let band_overshoot = (price - bb_upper) / price.max(1e-12);
            if band_overshoot > 0.002 {
                strength += 0.10;
                confidence += 0.05;
            }
            if bb_mid > 0.0 && (bb_upper - bb_lower) / bb_mid > 0.01 {
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
                "bb_upper": bb_upper,
                "bb_middle": bb_mid,
                "bb_lower": bb_lower,
                "rsi": curr_rsi,
                "atr": curr_atr,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::SyntheticSeries;

    fn ctx_from<'a>(
        opens: &'a [f64],
        highs: &'a [f64],
        lows: &'a [f64],
        closes: &'a [f64],
        volumes: &'a [f64],
    ) -> AnalysisContext<'a> {
        AnalysisContext {
            pair: "BTC/USD",
            opens,
            highs,
            lows,
            closes,
            volumes,
            book: None,
            book_age_seconds: None,
            trend_regime: "range",
            vol_regime: "mid_vol",
            round_trip_fee_pct: 0.0052,
        }
    }

    #[tokio::test]
    async fn insufficient_data_is_neutral() {
        let series = SyntheticSeries::seeded(3, 10);
        let ctx = series.context("BTC/USD");
        let sig = MeanReversionStrategy::default().analyze(&ctx).await;
        assert_eq!(sig.direction, SignalDirection::Neutral);
    }

    #[tokio::test]
    async fn capitulation_flush_goes_long() {
        // Stable range then a waterfall: price punches the lower band with a
        // collapsed RSI.
        let mut closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.8).sin() * 0.3)
            .collect();
        closes.extend((0..8).map(|i| 99.0 - i as f64 * 1.2));
        let opens = closes.clone();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.3).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.3).collect();
        let volumes = vec![100.0; closes.len()];

        let ctx = ctx_from(&opens, &highs, &lows, &closes, &volumes);
        let sig = MeanReversionStrategy::default().analyze(&ctx).await;
        assert_eq!(sig.direction, SignalDirection::Long);
        assert!(sig.is_actionable());
        assert!(sig.stop_loss < sig.entry_price);
        assert!(sig.take_profit > sig.entry_price);
    }

    #[tokio::test]
    async fn blowoff_top_goes_short() {
        let mut closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.8).sin() * 0.3)
            .collect();
        closes.extend((0..8).map(|i| 101.0 + i as f64 * 1.2));
        let opens = closes.clone();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.3).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.3).collect();
        let volumes = vec![100.0; closes.len()];

        let ctx = ctx_from(&opens, &highs, &lows, &closes, &volumes);
        let sig = MeanReversionStrategy::default().analyze(&ctx).await;
        assert_eq!(sig.direction, SignalDirection::Short);
        assert!(sig.stop_loss > sig.entry_price);
        assert!(sig.take_profit < sig.entry_price);
    }

    #[tokio::test]
    async fn mid_band_is_neutral() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.5).sin() * 0.5)
            .collect();
        let opens = closes.clone();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.3).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.3).collect();
        let volumes = vec![100.0; closes.len()];
        let ctx = ctx_from(&opens, &highs, &lows, &closes, &volumes);
        let sig = MeanReversionStrategy::default().analyze(&ctx).await;
        assert_eq!(sig.direction, SignalDirection::Neutral);
    }
}
