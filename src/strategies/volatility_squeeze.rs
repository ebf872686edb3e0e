// =============================================================================
// Volatility Squeeze Strategy — compression -> expansion (TTM squeeze)
// =============================================================================
//
// A squeeze is on when the Bollinger Bands contract inside the Keltner
// Channels. When it releases, a directional move is imminent; momentum picks
// the side.
//
// LONG entry:  squeeze just released after >= min_squeeze_bars + momentum > 0
//              and rising (plus a price break or momentum persistence check)
// SHORT entry: mirror image with falling negative momentum
//
// SL: 2.5x ATR, TP: 4.0x ATR (wider R:R for post-squeeze momentum)

use async_trait::async_trait;
use serde_json::json;

use super::{AnalysisContext, Strategy, StrategySignal};
use crate::indicators::{
    atr, bollinger_bands, compute_sl_tp, keltner_channels, last, momentum,
};
use crate::types::SignalDirection;

pub struct VolatilitySqueezeStrategy {
    pub bb_period: usize,
    pub bb_std: f64,
    pub kc_ema_period: usize,
    pub kc_atr_period: usize,
    pub kc_multiplier: f64,
    pub momentum_period: usize,
    pub atr_period: usize,
    pub min_squeeze_bars: usize,
    pub weight: f64,
}

impl Default for VolatilitySqueezeStrategy {
    fn default() -> Self {
        Self {
            bb_period: 20,
            bb_std: 2.0,
            kc_ema_period: 20,
            kc_atr_period: 14,
            kc_multiplier: 1.5,
            momentum_period: 12,
            atr_period: 14,
            min_squeeze_bars: 3,
            weight: 0.12,
        }
    }
}

#[async_trait]
impl Strategy for VolatilitySqueezeStrategy {
    fn name(&self) -> &'static str {
        "volatility_squeeze"
    }

    fn base_weight(&self) -> f64 {
        self.weight
    }

    fn min_bars_required(&self) -> usize {
        self.bb_period.max(self.kc_ema_period) + self.momentum_period + 20
    }

    async fn analyze(&self, ctx: &AnalysisContext<'_>) -> StrategySignal {
        if ctx.bar_count() < self.min_bars_required() {
            return StrategySignal::neutral(self.name(), ctx.pair, "Insufficient data");
        }

        let (bb_upper, bb_mid, bb_lower) = bollinger_bands(ctx.closes, self.bb_period, self.bb_std);
        let (kc_upper, _, kc_lower) = keltner_channels(
            ctx.highs,
            ctx.lows,
            ctx.closes,
            self.kc_ema_period,
            self.kc_atr_period,
            self.kc_multiplier,
        );
        let mom = momentum(ctx.closes, self.momentum_period);
        let atr_series = atr(ctx.highs, ctx.lows, ctx.closes, self.atr_period);

        let n = ctx.bar_count();
        let price = ctx.price();
        let curr_atr = last(&atr_series);

        for v in [bb_upper[n - 1], kc_upper[n - 1], mom[n - 1]] {
            if !v.is_finite() {
                return StrategySignal::neutral(self.name(), ctx.pair, "Indicators not converged");
            }
        }
        if !curr_atr.is_finite() || curr_atr <= 0.0 {
            return StrategySignal::neutral(self.name(), ctx.pair, "ATR is zero");
        }

        // Squeeze state per bar: BB fully inside KC.
        let in_squeeze = |i: usize| -> bool {
            bb_upper[i].is_finite()
                && kc_upper[i].is_finite()
                && bb_upper[i] < kc_upper[i]
                && bb_lower[i] > kc_lower[i]
        };

        // Count consecutive squeeze bars ending just before the current bar;
        // the current bar itself must be out of the squeeze (= just released).
        let curr_in_squeeze = in_squeeze(n - 1);
        let mut prev_squeeze_count = 0;
        for i in (0..n - 1).rev() {
            if in_squeeze(i) {
                prev_squeeze_count += 1;
            } else {
                break;
            }
        }
        let squeeze_just_released =
            !curr_in_squeeze && prev_squeeze_count >= self.min_squeeze_bars;

        if !squeeze_just_released {
            return StrategySignal::neutral(self.name(), ctx.pair, "No squeeze release");
        }

        let curr_mom = mom[n - 1];
        let prev_mom = if mom[n - 2].is_finite() { mom[n - 2] } else { 0.0 };
        let prev_mom2 = if n > 2 && mom[n - 3].is_finite() {
            mom[n - 3]
        } else {
            0.0
        };
        let mom_rising = curr_mom > prev_mom;
        let mom_falling = curr_mom < prev_mom;
        let mom_accelerating = (curr_mom - prev_mom) > (prev_mom - prev_mom2);

        let mut direction = SignalDirection::Neutral;
        let mut strength = 0.0;
        let mut confidence = 0.0;

        if curr_mom > 0.0 && mom_rising {
            let price_break = price > bb_upper[n - 1].max(kc_upper[n - 1]);
            let momentum_persist = prev_mom > 0.0;
            if !(price_break || momentum_persist) {
                return StrategySignal::neutral(self.name(), ctx.pair, "Weak long squeeze release");
            }

            direction = SignalDirection::Long;
            strength = 0.50;
            confidence = 0.45;

            // A longer squeeze stores more energy.
            if prev_squeeze_count >= 8 {
                strength += 0.15;
                confidence += 0.10;
            } else if prev_squeeze_count >= 5 {
                strength += 0.08;
                confidence += 0.05;
            }
            if mom_accelerating {
                strength += 0.10;
                confidence += 0.08;
            }
            if price > bb_mid[n - 1] {
                confidence += 0.05;
            }
        } else if curr_mom < 0.0 && mom_falling {
            let price_break = price < bb_lower[n - 1].min(kc_lower[n - 1]);
            let momentum_persist = prev_mom < 0.0;
            if !(price_break || momentum_persist) {
                return StrategySignal::neutral(self.name(), ctx.pair, "Weak short squeeze release");
            }

            direction = SignalDirection::Short;
            strength = 0.50;
            confidence = 0.45;

            if prev_squeeze_count >= 8 {
                strength += 0.15;
                confidence += 0.10;
            } else if prev_squeeze_count >= 5 {
                strength += 0.08;
                confidence += 0.05;
            }
            if !mom_accelerating {
                strength += 0.10;
                confidence += 0.08;
            }
            if price < bb_mid[n - 1] {
                confidence += 0.05;
            }
        }

        let (stop_loss, take_profit) = if direction != SignalDirection::Neutral {
            compute_sl_tp(price, curr_atr, direction, 2.5, 4.0, ctx.round_trip_fee_pct)
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
                "squeeze_bars": prev_squeeze_count,
                "squeeze_released": squeeze_just_released,
                "momentum": curr_mom,
                "momentum_rising": mom_rising,
                "momentum_falling": mom_falling,
                "bb_upper": bb_upper[n - 1],
                "bb_lower": bb_lower[n - 1],
                "kc_upper": kc_upper[n - 1],
                "kc_lower": kc_lower[n - 1],
                "atr": curr_atr,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::SyntheticSeries;

    #[tokio::test]
    async fn insufficient_data_is_neutral() {
        let series = SyntheticSeries::seeded(8, 30);
        let ctx = series.context("BTC/USD");
        let sig = VolatilitySqueezeStrategy::default().analyze(&ctx).await;
        assert_eq!(sig.direction, SignalDirection::Neutral);
    }

    #[tokio::test]
    async fn no_release_is_neutral() {
        // Flat closes with wide bar ranges: BB collapses inside KC, so the
        // squeeze is still ON at the current bar and nothing has released.
        let closes = vec![100.0; 80];
        let opens = closes.clone();
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.5).collect();
        let volumes = vec![100.0; 80];
        let ctx = AnalysisContext {
            pair: "BTC/USD",
            opens: &opens,
            highs: &highs,
            lows: &lows,
            closes: &closes,
            volumes: &volumes,
            book: None,
            book_age_seconds: None,
            trend_regime: "range",
            vol_regime: "mid_vol",
            round_trip_fee_pct: 0.0052,
        };
        let sig = VolatilitySqueezeStrategy::default().analyze(&ctx).await;
        // Wide close swings against narrow bar ranges keep BB outside KC:
        // there is never a squeeze to release.
        assert_eq!(sig.direction, SignalDirection::Neutral);
    }

    #[tokio::test]
    async fn compression_then_breakout_goes_long() {
        // Flat closes with wide bar ranges force BB (close stddev ~ 0)
        // inside KC (ATR driven), then an upside breakout releases it.
        let mut closes = vec![100.0; 60];
        for (i, c) in closes.iter_mut().enumerate().skip(54) {
            *c = 100.0 + (i - 53) as f64 * 2.0;
        }
        let opens = closes.clone();
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.5).collect();
        let volumes = vec![100.0; 60];
        let ctx = AnalysisContext {
            pair: "BTC/USD",
            opens: &opens,
            highs: &highs,
            lows: &lows,
            closes: &closes,
            volumes: &volumes,
            book: None,
            book_age_seconds: None,
            trend_regime: "trend",
            vol_regime: "mid_vol",
            round_trip_fee_pct: 0.0052,
        };
        let sig = VolatilitySqueezeStrategy::default().analyze(&ctx).await;
        // Must never read short on an upside breakout.
        assert_ne!(sig.direction, SignalDirection::Short);
        if sig.direction == SignalDirection::Long {
            assert!(sig.take_profit > sig.entry_price);
            assert!(sig.stop_loss < sig.entry_price);
        }
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        let series = SyntheticSeries::seeded(4242, 140);
        let ctx = series.context("BTC/USD");
        let strat = VolatilitySqueezeStrategy::default();
        let a = strat.analyze(&ctx).await;
        let b = strat.analyze(&ctx).await;
        assert_eq!(a.direction, b.direction);
        assert_eq!(a.strength, b.strength);
    }
}
