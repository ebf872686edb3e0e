// =============================================================================
// Stochastic Divergence Strategy — price/oscillator divergence at extremes
// =============================================================================
//
// Divergence means momentum is shifting BEFORE price reverses.
//
// LONG entry:
//   1. %K below the oversold line
//   2. Bullish K/D crossover on this bar
//   3. Bonus: bullish divergence (price lower low, stochastic higher low)
//
// SHORT entry: the mirror image in the overbought zone.
//
// SL: 2.0x ATR, TP: 3.0x ATR

use async_trait::async_trait;
use serde_json::json;

use super::{AnalysisContext, Strategy, StrategySignal};
use crate::indicators::{atr, compute_sl_tp, last, stochastic};
use crate::types::SignalDirection;

pub struct StochasticDivergenceStrategy {
    pub k_period: usize,
    pub d_period: usize,
    pub smooth: usize,
    pub oversold: f64,
    pub overbought: f64,
    pub divergence_lookback: usize,
    pub atr_period: usize,
    pub weight: f64,
}

impl Default for StochasticDivergenceStrategy {
    fn default() -> Self {
        Self {
            k_period: 14,
            d_period: 3,
            smooth: 3,
            oversold: 20.0,
            overbought: 80.0,
            divergence_lookback: 20,
            atr_period: 14,
            weight: 0.12,
        }
    }
}

impl StochasticDivergenceStrategy {
    /// Price made a lower low while %K made a higher low.
    fn bullish_divergence(lows: &[f64], pct_k: &[f64], lookback: usize) -> bool {
        let n = lows.len();
        if n < lookback + 2 {
            return false;
        }
        let window_lows = &lows[n - lookback..];
        let window_k = &pct_k[n - lookback..];

        let troughs = local_extrema(window_lows, |a, b| a <= b);
        if troughs.len() < 2 {
            return false;
        }
        let recent = troughs[troughs.len() - 1];
        let prior = troughs[troughs.len() - 2];

        let price_lower = window_lows[recent] < window_lows[prior];
        let (k_recent, k_prior) = (window_k[recent], window_k[prior]);
        if !k_recent.is_finite() || !k_prior.is_finite() {
            return false;
        }
        price_lower && k_recent > k_prior
    }

    /// Price made a higher high while %K made a lower high.
    fn bearish_divergence(highs: &[f64], pct_k: &[f64], lookback: usize) -> bool {
        let n = highs.len();
        if n < lookback + 2 {
            return false;
        }
        let window_highs = &highs[n - lookback..];
        let window_k = &pct_k[n - lookback..];

        let peaks = local_extrema(window_highs, |a, b| a >= b);
        if peaks.len() < 2 {
            return false;
        }
        let recent = peaks[peaks.len() - 1];
        let prior = peaks[peaks.len() - 2];

        let price_higher = window_highs[recent] > window_highs[prior];
        let (k_recent, k_prior) = (window_k[recent], window_k[prior]);
        if !k_recent.is_finite() || !k_prior.is_finite() {
            return false;
        }
        price_higher && k_recent < k_prior
    }
}

/// Indices of interior local extrema under `cmp` (<= for troughs, >= for
/// peaks vs both neighbours).
fn local_extrema(window: &[f64], cmp: fn(f64, f64) -> bool) -> Vec<usize> {
    let mut out = Vec::new();
    for i in 1..window.len().saturating_sub(1) {
        if cmp(window[i], window[i - 1]) && cmp(window[i], window[i + 1]) {
            out.push(i);
        }
    }
    out
}

#[async_trait]
impl Strategy for StochasticDivergenceStrategy {
    fn name(&self) -> &'static str {
        "stochastic_divergence"
    }

    fn base_weight(&self) -> f64 {
        self.weight
    }

    fn min_bars_required(&self) -> usize {
        self.k_period + self.smooth + self.d_period + self.divergence_lookback + 10
    }

    async fn analyze(&self, ctx: &AnalysisContext<'_>) -> StrategySignal {
        if ctx.bar_count() < self.min_bars_required() {
            return StrategySignal::neutral(self.name(), ctx.pair, "Insufficient data");
        }

        let (pct_k, pct_d) = stochastic(
            ctx.highs,
            ctx.lows,
            ctx.closes,
            self.k_period,
            self.d_period,
            self.smooth,
        );
        let atr_series = atr(ctx.highs, ctx.lows, ctx.closes, self.atr_period);

        let n = ctx.bar_count();
        let price = ctx.price();
        let curr_k = pct_k[n - 1];
        let curr_d = pct_d[n - 1];
        let prev_k = pct_k[n - 2];
        let prev_d = pct_d[n - 2];
        let curr_atr = last(&atr_series);

        for v in [curr_k, curr_d, prev_k, prev_d] {
            if !v.is_finite() {
                return StrategySignal::neutral(self.name(), ctx.pair, "Indicators not converged");
            }
        }
        if !curr_atr.is_finite() || curr_atr <= 0.0 {
            return StrategySignal::neutral(self.name(), ctx.pair, "ATR is zero");
        }

        let bullish_cross = prev_k <= prev_d && curr_k > curr_d;
        let bearish_cross = prev_k >= prev_d && curr_k < curr_d;
        let bull_div = Self::bullish_divergence(ctx.lows, &pct_k, self.divergence_lookback);
        let bear_div = Self::bearish_divergence(ctx.highs, &pct_k, self.divergence_lookback);

        let mut direction = SignalDirection::Neutral;
        let mut strength = 0.0;
        let mut confidence = 0.0;

        if curr_k < self.oversold && bullish_cross {
            direction = SignalDirection::Long;
            strength = 0.45;
            confidence = 0.40;

            if curr_k < 10.0 {
                strength += 0.10;
                confidence += 0.08;
            }
            if bull_div {
                // Divergence is the key signal.
                strength += 0.20;
                confidence += 0.20;
            } else {
                confidence -= 0.05;
            }
            if curr_k - curr_d > 3.0 {
                confidence += 0.05;
            }
        } else if curr_k > self.overbought && bearish_cross {
            direction = SignalDirection::Short;
            strength = 0.45;
            confidence = 0.40;

            if curr_k > 90.0 {
                strength += 0.10;
                confidence += 0.08;
            }
            if bear_div {
                strength += 0.20;
                confidence += 0.20;
            } else {
                confidence -= 0.05;
            }
            if curr_d - curr_k > 3.0 {
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
                "k": curr_k,
                "d": curr_d,
                "bullish_cross": bullish_cross,
                "bearish_cross": bearish_cross,
                "bull_divergence": bull_div,
                "bear_divergence": bear_div,
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
        let series = SyntheticSeries::seeded(11, 30);
        let ctx = series.context("BTC/USD");
        let sig = StochasticDivergenceStrategy::default().analyze(&ctx).await;
        assert_eq!(sig.direction, SignalDirection::Neutral);
    }

    #[tokio::test]
    async fn mid_range_oscillator_is_neutral() {
        let closes: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 0.5)
            .collect();
        let opens = closes.clone();
        let highs: Vec<f64> = closes.iter().map(|c| c + 2.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 2.0).collect();
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
            vol_regime: "low_vol",
            round_trip_fee_pct: 0.0052,
        };
        // Wide high/low bands pin %K near 50: never in an extreme zone.
        let sig = StochasticDivergenceStrategy::default().analyze(&ctx).await;
        assert_eq!(sig.direction, SignalDirection::Neutral);
    }

    #[test]
    fn bullish_divergence_detection() {
        // Rising baseline keeps the two injected dips as the only local
        // lows. Price: second trough lower. %K: second trough higher.
        let mut lows: Vec<f64> = (0..30).map(|i| 10.0 + i as f64 * 0.01).collect();
        lows[20] = 8.0;
        lows[25] = 7.5; // lower low in price
        let mut k = vec![50.0; 30];
        k[20] = 15.0;
        k[25] = 25.0; // higher low in oscillator
        assert!(StochasticDivergenceStrategy::bullish_divergence(&lows, &k, 20));
    }

    #[test]
    fn no_divergence_when_oscillator_confirms() {
        let mut lows: Vec<f64> = (0..30).map(|i| 10.0 + i as f64 * 0.01).collect();
        lows[20] = 8.0;
        lows[25] = 7.5;
        let mut k = vec![50.0; 30];
        k[20] = 25.0;
        k[25] = 15.0; // oscillator confirms the lower low
        assert!(!StochasticDivergenceStrategy::bullish_divergence(&lows, &k, 20));
    }

    #[test]
    fn bearish_divergence_detection() {
        // Falling baseline keeps the two injected spikes as the only local
        // highs.
        let mut highs: Vec<f64> = (0..30).map(|i| 11.0 - i as f64 * 0.01).collect();
        highs[20] = 12.0;
        highs[25] = 12.5; // higher high in price
        let mut k = vec![50.0; 30];
        k[20] = 90.0;
        k[25] = 80.0; // lower high in oscillator
        assert!(StochasticDivergenceStrategy::bearish_divergence(&highs, &k, 20));
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        let series = SyntheticSeries::seeded(555, 120);
        let ctx = series.context("BTC/USD");
        let strat = StochasticDivergenceStrategy::default();
        let a = strat.analyze(&ctx).await;
        let b = strat.analyze(&ctx).await;
        assert_eq!(a.direction, b.direction);
        assert_eq!(a.confidence, b.confidence);
    }
}
