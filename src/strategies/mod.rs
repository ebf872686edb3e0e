// =============================================================================
// Strategy Interface — signal contract, analysis context, performance tracking
// =============================================================================
//
// Every strategy consumes the same column-oriented market view and emits a
// StrategySignal. Strategies fail CLOSED: insufficient bars, unconverged
// indicators, or a zero ATR all produce a NEUTRAL signal instead of an error.

pub mod ichimoku;
pub mod keltner;
pub mod mean_reversion;
pub mod order_flow;
pub mod reversal;
pub mod stochastic_divergence;
pub mod supertrend;
pub mod trend;
pub mod volatility_squeeze;

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::market_data::BookAnalysis;
use crate::types::SignalDirection;

// -----------------------------------------------------------------------------
// Signal
// -----------------------------------------------------------------------------

/// Output of one strategy's analysis of one pair on one timeframe.
#[derive(Debug, Clone, Serialize)]
pub struct StrategySignal {
    pub strategy_name: String,
    pub pair: String,
    pub direction: SignalDirection,
    pub strength: f64,
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub timestamp: String,
    pub metadata: serde_json::Value,
}

impl StrategySignal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy_name: &str,
        pair: &str,
        direction: SignalDirection,
        strength: f64,
        confidence: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            strategy_name: strategy_name.to_string(),
            pair: pair.to_string(),
            direction,
            strength: strength.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            entry_price,
            stop_loss,
            take_profit,
            timestamp: Utc::now().to_rfc3339(),
            metadata,
        }
    }

    /// A no-trade signal carrying the reason for diagnostics.
    pub fn neutral(strategy_name: &str, pair: &str, reason: &str) -> Self {
        Self::new(
            strategy_name,
            pair,
            SignalDirection::Neutral,
            0.0,
            0.0,
            0.0,
            0.0,
            0.0,
            json!({ "reason": reason }),
        )
    }

    /// Whether this signal warrants potential trade action.
    pub fn is_actionable(&self) -> bool {
        self.direction != SignalDirection::Neutral && self.strength >= 0.3 && self.confidence >= 0.3
    }
}

// -----------------------------------------------------------------------------
// Analysis context
// -----------------------------------------------------------------------------

/// Everything a strategy may look at for one analysis call.
pub struct AnalysisContext<'a> {
    pub pair: &'a str,
    pub opens: &'a [f64],
    pub highs: &'a [f64],
    pub lows: &'a [f64],
    pub closes: &'a [f64],
    pub volumes: &'a [f64],
    /// Latest microstructure analysis, if any.
    pub book: Option<&'a BookAnalysis>,
    /// Age of the book analysis in seconds, if known.
    pub book_age_seconds: Option<f64>,
    pub trend_regime: &'a str,
    pub vol_regime: &'a str,
    pub round_trip_fee_pct: f64,
}

impl AnalysisContext<'_> {
    pub fn bar_count(&self) -> usize {
        self.closes.len()
    }

    /// Last close, 0.0 when empty.
    pub fn price(&self) -> f64 {
        self.closes.last().copied().unwrap_or(0.0)
    }
}

// -----------------------------------------------------------------------------
// Strategy trait
// -----------------------------------------------------------------------------

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Static ensemble weight before performance / regime adjustment.
    fn base_weight(&self) -> f64;

    /// Minimum bars needed before the strategy can produce anything.
    fn min_bars_required(&self) -> usize;

    async fn analyze(&self, ctx: &AnalysisContext<'_>) -> StrategySignal;
}

// -----------------------------------------------------------------------------
// Per-strategy performance tracking
// -----------------------------------------------------------------------------

/// Bounded window of recent trade outcomes feeding adaptive weighting.
const RECENT_TRADES_CAP: usize = 50;
/// Below this many recorded trades the adaptive factor stays neutral.
const MIN_TRADES_FOR_FACTOR: usize = 10;

#[derive(Debug, Clone)]
pub struct TradeSample {
    pub pnl: f64,
    pub trend_regime: String,
    pub vol_regime: String,
    pub recorded_at: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub name: String,
    pub weight: f64,
    pub trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub adaptive_factor: f64,
    pub recent_trades: usize,
}

struct TrackerInner {
    recent: VecDeque<TradeSample>,
    trade_count: usize,
    win_count: usize,
    total_pnl: f64,
}

/// Thread-safe recent-performance tracker, one per registered strategy.
pub struct PerformanceTracker {
    inner: Mutex<TrackerInner>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                recent: VecDeque::with_capacity(RECENT_TRADES_CAP),
                trade_count: 0,
                win_count: 0,
                total_pnl: 0.0,
            }),
        }
    }

    pub fn record(&self, pnl: f64, trend_regime: &str, vol_regime: &str, recorded_at: f64) {
        let mut inner = self.inner.lock();
        inner.trade_count += 1;
        if pnl > 0.0 {
            inner.win_count += 1;
        }
        inner.total_pnl += pnl;
        inner.recent.push_back(TradeSample {
            pnl,
            trend_regime: trend_regime.to_string(),
            vol_regime: vol_regime.to_string(),
            recorded_at,
        });
        while inner.recent.len() > RECENT_TRADES_CAP {
            inner.recent.pop_front();
        }
    }

    /// PnLs of the most recent `window` trades, oldest first.
    pub fn recent_pnls(&self, window: usize) -> Vec<f64> {
        let inner = self.inner.lock();
        let skip = inner.recent.len().saturating_sub(window);
        inner.recent.iter().skip(skip).map(|s| s.pnl).collect()
    }

    /// Adaptive multiplier in [0.4, 2.0] from a rolling Sharpe-like edge
    /// score and regime-specific win rate. Neutral 1.0 under
    /// [`MIN_TRADES_FOR_FACTOR`] recorded trades.
    pub fn adaptive_performance_factor(&self, trend_regime: &str, vol_regime: &str) -> f64 {
        let inner = self.inner.lock();
        let trades: Vec<&TradeSample> = inner.recent.iter().collect();
        if trades.len() < MIN_TRADES_FOR_FACTOR {
            return 1.0;
        }

        let n = trades.len() as f64;
        let mean = trades.iter().map(|t| t.pnl).sum::<f64>() / n;
        let var = trades.iter().map(|t| (t.pnl - mean) * (t.pnl - mean)).sum::<f64>() / n;
        let std = var.sqrt();

        let sharpe_raw = if std > 0.0 {
            mean / std
        } else if mean > 0.0 {
            1.0
        } else {
            -1.0
        };
        let sharpe_score = 1.0 / (1.0 + (-sharpe_raw).exp());
        let sharpe_factor = 0.4 + sharpe_score * 1.2;

        let regime_trades: Vec<&&TradeSample> = trades
            .iter()
            .filter(|t| {
                (trend_regime.is_empty() || t.trend_regime == trend_regime)
                    && (vol_regime.is_empty() || t.vol_regime == vol_regime)
            })
            .collect();
        let regime_factor = if regime_trades.len() >= 5 {
            let wins = regime_trades.iter().filter(|t| t.pnl > 0.0).count() as f64;
            let wr = wins / regime_trades.len() as f64;
            0.6 + wr * 0.8
        } else {
            1.0
        };

        (sharpe_factor * regime_factor).clamp(0.4, 2.0)
    }

    pub fn stats(&self, name: &str, weight: f64) -> StrategyStats {
        let factor = self.adaptive_performance_factor("", "");
        let inner = self.inner.lock();
        let trades = inner.trade_count;
        StrategyStats {
            name: name.to_string(),
            weight,
            trades,
            win_rate: if trades > 0 {
                inner.win_count as f64 / trades as f64
            } else {
                0.0
            },
            total_pnl: inner.total_pnl,
            avg_pnl: if trades > 0 {
                inner.total_pnl / trades as f64
            } else {
                0.0
            },
            adaptive_factor: factor,
            recent_trades: inner.recent.len(),
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::AnalysisContext;

    /// Deterministic synthetic OHLCV generator for strategy tests.
    /// A linear-congruential walk keeps runs reproducible without any
    /// external randomness.
    pub struct SyntheticSeries {
        pub opens: Vec<f64>,
        pub highs: Vec<f64>,
        pub lows: Vec<f64>,
        pub closes: Vec<f64>,
        pub volumes: Vec<f64>,
    }

    impl SyntheticSeries {
        pub fn seeded(seed: u64, n: usize) -> Self {
            let mut state = seed.max(1);
            let mut price = 100.0;
            let mut opens = Vec::with_capacity(n);
            let mut highs = Vec::with_capacity(n);
            let mut lows = Vec::with_capacity(n);
            let mut closes = Vec::with_capacity(n);
            let mut volumes = Vec::with_capacity(n);
            for _ in 0..n {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let r = ((state >> 33) as f64 / (1u64 << 31) as f64) - 1.0; // [-1, 1)
                let open = price;
                price = (price * (1.0 + r * 0.004)).max(1.0);
                let close = price;
                opens.push(open);
                highs.push(open.max(close) * 1.001);
                lows.push(open.min(close) * 0.999);
                closes.push(close);
                volumes.push(100.0 + (r.abs() * 50.0));
            }
            Self {
                opens,
                highs,
                lows,
                closes,
                volumes,
            }
        }

        pub fn context<'a>(&'a self, pair: &'a str) -> AnalysisContext<'a> {
            AnalysisContext {
                pair,
                opens: &self.opens,
                highs: &self.highs,
                lows: &self.lows,
                closes: &self.closes,
                volumes: &self.volumes,
                book: None,
                book_age_seconds: None,
                trend_regime: "range",
                vol_regime: "mid_vol",
                round_trip_fee_pct: 0.0052,
            }
        }
    }
}
