// =============================================================================
// Ichimoku Cloud Strategy — trend, momentum and S/R in one framework
// =============================================================================
//
// Multiple conditions must align before entry, which filters most noise:
//
// LONG entry:
//   1. Price above the cloud
//   2. Tenkan-Sen crosses above Kijun-Sen on this bar
//   3. Chikou Span confirmation (close leads price from kijun bars ago)
//
// SHORT entry: the mirror image below the cloud.
//
// SL: opposite cloud edge, floored at 2.0x ATR. TP: 3.0x ATR or further.

use async_trait::async_trait;
use serde_json::json;

use super::{AnalysisContext, Strategy, StrategySignal};
use crate::indicators::{atr, compute_sl_tp, ichimoku, last};
use crate::types::SignalDirection;

pub struct IchimokuStrategy {
    pub tenkan_period: usize,
    pub kijun_period: usize,
    pub senkou_b_period: usize,
    pub atr_period: usize,
    pub weight: f64,
}

impl Default for IchimokuStrategy {
    fn default() -> Self {
        Self {
            tenkan_period: 9,
            kijun_period: 26,
            senkou_b_period: 52,
            atr_period: 14,
            weight: 0.15,
        }
    }
}

#[async_trait]
impl Strategy for IchimokuStrategy {
    fn name(&self) -> &'static str {
        "ichimoku"
    }

    fn base_weight(&self) -> f64 {
        self.weight
    }

    fn min_bars_required(&self) -> usize {
        self.senkou_b_period + self.kijun_period + 10
    }

    async fn analyze(&self, ctx: &AnalysisContext<'_>) -> StrategySignal {
        if ctx.bar_count() < self.min_bars_required() {
            return StrategySignal::neutral(self.name(), ctx.pair, "Insufficient data");
        }

        let ich = ichimoku(
            ctx.highs,
            ctx.lows,
            ctx.closes,
            self.tenkan_period,
            self.kijun_period,
            self.senkou_b_period,
        );
        let atr_series = atr(ctx.highs, ctx.lows, ctx.closes, self.atr_period);

        let n = ctx.bar_count();
        let price = ctx.price();
        let curr_tenkan = ich.tenkan[n - 1];
        let prev_tenkan = ich.tenkan[n - 2];
        let curr_kijun = ich.kijun[n - 1];
        let prev_kijun = ich.kijun[n - 2];
        let senkou_a = ich.senkou_a[n - 1];
        let senkou_b = ich.senkou_b[n - 1];
        let curr_atr = last(&atr_series);

        for v in [curr_tenkan, prev_tenkan, curr_kijun, prev_kijun, senkou_a, senkou_b] {
            if !v.is_finite() {
                return StrategySignal::neutral(self.name(), ctx.pair, "Indicators not converged");
            }
        }
        if !curr_atr.is_finite() || curr_atr <= 0.0 {
            return StrategySignal::neutral(self.name(), ctx.pair, "ATR is zero");
        }

        let cloud_top = senkou_a.max(senkou_b);
        let cloud_bottom = senkou_a.min(senkou_b);

        let tk_bullish_cross = prev_tenkan <= prev_kijun && curr_tenkan > curr_kijun;
        let tk_bearish_cross = prev_tenkan >= prev_kijun && curr_tenkan < curr_kijun;

        // Chikou confirmation: today's close vs the close kijun bars ago.
        let chikou_idx = n - 1 - self.kijun_period;
        let (chikou_bullish, chikou_bearish) = {
            let chikou_val = ich.chikou.get(chikou_idx).copied().unwrap_or(f64::NAN);
            if chikou_val.is_finite() {
                (
                    chikou_val > ctx.closes[chikou_idx],
                    chikou_val < ctx.closes[chikou_idx],
                )
            } else {
                (false, false)
            }
        };

        let mut direction = SignalDirection::Neutral;
        let mut strength = 0.0;
        let mut confidence = 0.0;

        if price > cloud_top && tk_bullish_cross {
            direction = SignalDirection::Long;
            strength = 0.50;
            confidence = 0.45;

            // Thick cloud = strong support below.
            let cloud_width_pct = (cloud_top - cloud_bottom) / price.max(1e-12);
            if cloud_width_pct > 0.005 {
                strength += 0.10;
                confidence += 0.05;
            }
            if chikou_bullish {
                strength += 0.15;
                confidence += 0.15;
            }
            // Entries close to the cloud keep the natural stop tight.
            let dist_above = (price - cloud_top) / price.max(1e-12);
            if dist_above < 0.01 {
                confidence += 0.05;
            }
        } else if price < cloud_bottom && tk_bearish_cross {
            direction = SignalDirection::Short;
            strength = 0.50;
            confidence = 0.45;

            let cloud_width_pct = (cloud_top - cloud_bottom) / price.max(1e-12);
            if cloud_width_pct > 0.005 {
                strength += 0.10;
                confidence += 0.05;
            }
            if chikou_bearish {
                strength += 0.15;
                confidence += 0.15;
            }
            let dist_below = (cloud_bottom - price) / price.max(1e-12);
            if dist_below < 0.01 {
                confidence += 0.05;
            }
        }

        // SL at the opposite cloud edge, never tighter than the ATR floor.
        let (mut stop_loss, mut take_profit) = (0.0, 0.0);
        if direction == SignalDirection::Long {
            let (floor_sl, floor_tp) =
                compute_sl_tp(price, curr_atr, direction, 2.0, 3.0, ctx.round_trip_fee_pct);
            let sl_dist = (price - cloud_bottom).max(curr_atr * 2.0);
            stop_loss = (price - sl_dist).min(floor_sl);
            take_profit = (price + curr_atr * 3.0).max(floor_tp);
        } else if direction == SignalDirection::Short {
            let (floor_sl, floor_tp) =
                compute_sl_tp(price, curr_atr, direction, 2.0, 3.0, ctx.round_trip_fee_pct);
            let sl_dist = (cloud_top - price).max(curr_atr * 2.0);
            stop_loss = (price + sl_dist).max(floor_sl);
            take_profit = (price - curr_atr * 3.0).min(floor_tp);
        }

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
                "tenkan": curr_tenkan,
                "kijun": curr_kijun,
                "senkou_a": senkou_a,
                "senkou_b": senkou_b,
                "cloud_top": cloud_top,
                "cloud_bottom": cloud_bottom,
                "tk_bullish_cross": tk_bullish_cross,
                "tk_bearish_cross": tk_bearish_cross,
                "chikou_bullish": chikou_bullish,
                "chikou_bearish": chikou_bearish,
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
        let series = SyntheticSeries::seeded(5, 60);
        let ctx = series.context("BTC/USD");
        let sig = IchimokuStrategy::default().analyze(&ctx).await;
        assert_eq!(sig.direction, SignalDirection::Neutral);
        assert_eq!(sig.metadata["reason"], "Insufficient data");
    }

    #[tokio::test]
    async fn flat_series_is_neutral() {
        let closes = vec![100.0; 120];
        let opens = closes.clone();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();
        let volumes = vec![100.0; 120];
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
            vol_regime: "low_vol",
            round_trip_fee_pct: 0.0052,
        };
        let sig = IchimokuStrategy::default().analyze(&ctx).await;
        // Flat: price sits inside the (degenerate) cloud, no TK cross.
        assert_eq!(sig.direction, SignalDirection::Neutral);
    }

    #[tokio::test]
    async fn long_sl_below_entry_when_triggered() {
        let series = SyntheticSeries::seeded(77, 200);
        let ctx = series.context("BTC/USD");
        let sig = IchimokuStrategy::default().analyze(&ctx).await;
        if sig.direction == SignalDirection::Long {
            assert!(sig.stop_loss < sig.entry_price);
            assert!(sig.take_profit > sig.entry_price);
        } else if sig.direction == SignalDirection::Short {
            assert!(sig.stop_loss > sig.entry_price);
            assert!(sig.take_profit < sig.entry_price);
        }
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        let series = SyntheticSeries::seeded(31337, 160);
        let ctx = series.context("BTC/USD");
        let strat = IchimokuStrategy::default();
        let a = strat.analyze(&ctx).await;
        let b = strat.analyze(&ctx).await;
        assert_eq!(a.direction, b.direction);
        assert_eq!(a.strength, b.strength);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.take_profit, b.take_profit);
    }
}
