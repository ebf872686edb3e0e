// =============================================================================
// Confluence Detector — the decision brain
// =============================================================================
//
// Runs every enabled strategy per timeframe, counts directional agreement,
// weights votes by recent performance and market regime, checks order-book
// agreement, and combines timeframes into one ConfluenceSignal per pair.
//
// A "sure fire" setup is detected when confluence_threshold+ strategies
// align AND the order book confirms the direction at sufficient confidence.

pub mod regime;
pub mod session;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Timelike, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::indicators::order_book_imbalance;
use crate::market_data::{MarketDataCache, OhlcvArrays};
use crate::strategies::{
    ichimoku::IchimokuStrategy, keltner::KeltnerStrategy, mean_reversion::MeanReversionStrategy,
    order_flow::OrderFlowStrategy, reversal::ReversalStrategy,
    stochastic_divergence::StochasticDivergenceStrategy, supertrend::SupertrendStrategy,
    trend::TrendStrategy, volatility_squeeze::VolatilitySqueezeStrategy,
};
use crate::strategies::{AnalysisContext, PerformanceTracker, Strategy, StrategySignal};
use crate::types::SignalDirection;
use regime::{detect_regime, RegimeReading};
use session::SessionAnalyzer;

/// Synthetic order-book vote carries this strategy name; it is excluded from
/// "real vote" counts everywhere.
pub const ORDER_BOOK_STRATEGY: &str = "order_book";

/// Per-strategy analysis deadline. A slower strategy is treated as NEUTRAL
/// for the cycle.
const STRATEGY_TIMEOUT: Duration = Duration::from_secs(5);

/// A pair with no bar update for this long is refused outright.
const MAX_DATA_AGE_SECONDS: u64 = 180;

/// Minimum bars a resampled timeframe needs to participate.
const MIN_TIMEFRAME_BARS: usize = 50;

/// Higher timeframes carry more weight in cross-timeframe agreement.
fn timeframe_weight(tf: u32) -> f64 {
    match tf {
        1 => 1.0,
        5 => 1.3,
        15 => 1.5,
        30 => 1.7,
        60 => 2.0,
        _ => 1.0,
    }
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// -----------------------------------------------------------------------------
// ConfluenceSignal
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ConfluenceSignal {
    pub pair: String,
    pub direction: SignalDirection,
    pub strength: f64,
    pub confidence: f64,
    pub confluence_count: usize,
    pub signals: Vec<StrategySignal>,
    pub obi: f64,
    pub book_score: f64,
    pub obi_agrees: bool,
    pub is_sure_fire: bool,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub regime: String,
    pub volatility_regime: String,
    pub vol_level: f64,
    pub vol_expanding: bool,
    pub timeframe_agreement: usize,
    pub timeframes: BTreeMap<String, String>,
    pub timestamp: String,
}

impl ConfluenceSignal {
    pub fn neutral(pair: &str) -> Self {
        Self {
            pair: pair.to_string(),
            direction: SignalDirection::Neutral,
            strength: 0.0,
            confidence: 0.0,
            confluence_count: 0,
            signals: Vec::new(),
            obi: 0.0,
            book_score: 0.0,
            obi_agrees: false,
            is_sure_fire: false,
            entry_price: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            regime: String::new(),
            volatility_regime: String::new(),
            vol_level: 0.5,
            vol_expanding: false,
            timeframe_agreement: 0,
            timeframes: BTreeMap::new(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Directional strategy votes excluding the synthetic order-book vote.
    pub fn real_directional_votes(&self) -> usize {
        self.signals
            .iter()
            .filter(|s| s.direction == self.direction && s.strategy_name != ORDER_BOOK_STRATEGY)
            .count()
    }
}

// -----------------------------------------------------------------------------
// Detector
// -----------------------------------------------------------------------------

/// Predicate injected by the risk layer: (pair, strategy, side) -> on cooldown.
pub type CooldownChecker = Arc<dyn Fn(&str, &str, &str) -> bool + Send + Sync>;

struct RegisteredStrategy {
    strategy: Arc<dyn Strategy>,
    tracker: PerformanceTracker,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStrategyStats {
    #[serde(flatten)]
    pub stats: crate::strategies::StrategyStats,
    pub runtime_disabled: bool,
    pub runtime_disable_reason: Option<String>,
}

pub struct ConfluenceDetector {
    market_data: Arc<MarketDataCache>,
    config: BotConfig,
    timeframes: Vec<u32>,
    primary_timeframe: u32,
    min_agreement: usize,
    strategies: Vec<RegisteredStrategy>,
    cooldown_checker: RwLock<Option<CooldownChecker>>,
    session: Option<Arc<SessionAnalyzer>>,
    runtime_disabled_until: Mutex<HashMap<String, f64>>,
    runtime_disable_reason: Mutex<HashMap<String, String>>,
    last_confluence: Mutex<HashMap<String, ConfluenceSignal>>,
}

impl ConfluenceDetector {
    pub fn new(
        market_data: Arc<MarketDataCache>,
        config: &BotConfig,
        session: Option<Arc<SessionAnalyzer>>,
    ) -> Self {
        let mut timeframes: Vec<u32> = config.trading.timeframes.clone();
        if timeframes.is_empty() {
            timeframes.push(1);
        }
        if !timeframes.contains(&1) {
            timeframes.insert(0, 1);
        }
        timeframes.sort_unstable();
        timeframes.dedup();

        let primary = config.ai.primary_timeframe;
        let primary_timeframe = if timeframes.contains(&primary) { primary } else { 1 };

        let strategies = build_strategies(config.trading.single_strategy_mode.as_deref());
        info!(
            count = strategies.len(),
            timeframes = ?timeframes,
            primary = primary_timeframe,
            "confluence detector initialized"
        );

        Self {
            market_data,
            config: config.clone(),
            timeframes,
            primary_timeframe,
            min_agreement: config.ai.multi_timeframe_min_agreement.max(1) as usize,
            strategies,
            cooldown_checker: RwLock::new(None),
            session,
            runtime_disabled_until: Mutex::new(HashMap::new()),
            runtime_disable_reason: Mutex::new(HashMap::new()),
            last_confluence: Mutex::new(HashMap::new()),
        }
    }

    /// Inject a cooldown predicate: fn(pair, strategy_name, side) -> bool.
    pub fn set_cooldown_checker(&self, checker: CooldownChecker) {
        *self.cooldown_checker.write() = Some(checker);
    }

    // -------------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------------

    /// Run all strategies on a single pair across timeframes and detect
    /// confluence. Refuses pairs that are cold or stale.
    pub async fn analyze_pair(&self, pair: &str) -> ConfluenceSignal {
        if !self.market_data.is_warmed_up(pair)
            || self.market_data.is_stale(pair, MAX_DATA_AGE_SECONDS)
        {
            return ConfluenceSignal::neutral(pair);
        }

        let Some(mut base) = self.market_data.arrays(pair) else {
            return ConfluenceSignal::neutral(pair);
        };
        if self.config.trading.use_closed_candles_only && base.len() > 1 {
            base.drop_last();
        }

        let mut timeframe_results: BTreeMap<u32, ConfluenceSignal> = BTreeMap::new();
        for &tf in &self.timeframes {
            let arrays = crate::market_data::resample_ohlcv(&base, tf);
            if arrays.len() < MIN_TIMEFRAME_BARS {
                continue;
            }
            let reading = detect_regime(&arrays, &self.config.regime);
            let signals = self.run_strategies(pair, &arrays, &reading).await;
            let result = self.compute_confluence(pair, signals, &reading);
            timeframe_results.insert(tf, result);
        }

        self.combine_timeframes(pair, timeframe_results)
    }

    /// Scan a batch of pairs, strongest signal first.
    pub async fn scan_pairs(&self, pairs: &[String]) -> Vec<ConfluenceSignal> {
        let mut results = Vec::with_capacity(pairs.len());
        for pair in pairs {
            results.push(self.analyze_pair(pair).await);
        }
        results.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }

    /// Run enabled strategies concurrently with the per-strategy timeout.
    async fn run_strategies(
        &self,
        pair: &str,
        arrays: &OhlcvArrays,
        reading: &RegimeReading,
    ) -> Vec<StrategySignal> {
        let book = self.market_data.book_analysis(pair);
        let book_age = book.as_ref().map(|b| (now_unix() - b.updated_at).max(0.0));

        let ctx = AnalysisContext {
            pair,
            opens: &arrays.opens,
            highs: &arrays.highs,
            lows: &arrays.lows,
            closes: &arrays.closes,
            volumes: &arrays.volumes,
            book: book.as_ref(),
            book_age_seconds: book_age,
            trend_regime: &reading.trend_regime,
            vol_regime: &reading.vol_regime,
            round_trip_fee_pct: self.config.exchange.round_trip_fee_pct(),
        };

        let ctx_ref = &ctx;
        let futures = self
            .strategies
            .iter()
            .filter(|r| !self.is_runtime_disabled(r.strategy.name()))
            .map(|r| {
                let strategy = &r.strategy;
                async move {
                    match tokio::time::timeout(STRATEGY_TIMEOUT, strategy.analyze(ctx_ref)).await {
                        Ok(signal) => Some(signal),
                        Err(_) => {
                            warn!(strategy = strategy.name(), pair, "strategy timed out");
                            None
                        }
                    }
                }
            });

        let mut signals: Vec<StrategySignal> =
            join_all(futures).await.into_iter().flatten().collect();

        // Cooldown coercion: a pair/strategy/side on cooldown votes NEUTRAL.
        if let Some(checker) = self.cooldown_checker.read().clone() {
            for signal in signals.iter_mut() {
                if let Some(side) = signal.direction.side() {
                    if checker(pair, &signal.strategy_name, side.as_str()) {
                        debug!(
                            pair,
                            strategy = %signal.strategy_name,
                            "signal coerced to neutral by cooldown"
                        );
                        let name = signal.strategy_name.clone();
                        *signal = StrategySignal::neutral(&name, pair, "strategy_cooldown");
                    }
                }
            }
        }

        signals
    }

    // -------------------------------------------------------------------------
    // Per-timeframe confluence
    // -------------------------------------------------------------------------

    pub(crate) fn compute_confluence(
        &self,
        pair: &str,
        signals: Vec<StrategySignal>,
        reading: &RegimeReading,
    ) -> ConfluenceSignal {
        if signals.is_empty() {
            return ConfluenceSignal::neutral(pair);
        }

        let ai = &self.config.ai;
        let mut long_signals: Vec<StrategySignal> = signals
            .iter()
            .filter(|s| s.direction == SignalDirection::Long && s.is_actionable())
            .cloned()
            .collect();
        let mut short_signals: Vec<StrategySignal> = signals
            .iter()
            .filter(|s| s.direction == SignalDirection::Short && s.is_actionable())
            .cloned()
            .collect();

        // Raw OBI from the latest fresh order book.
        let now = now_unix();
        let mut obi = 0.0;
        if let Some(book) = self.market_data.order_book(pair) {
            if (now - book.updated_at) <= ai.book_score_max_age_seconds {
                let bid_vol: f64 = book.bids.iter().take(10).map(|(_, s)| *s).sum();
                let ask_vol: f64 = book.asks.iter().take(10).map(|(_, s)| *s).sum();
                obi = order_book_imbalance(bid_vol, ask_vol);
            }
        }

        // Microstructure score, preferred over raw OBI when fresh.
        let mut book_score = 0.0;
        let mut use_book_score = false;
        if let Some(analysis) = self.market_data.book_analysis(pair) {
            if (now - analysis.updated_at) <= ai.book_score_max_age_seconds {
                book_score = analysis.book_score;
                use_book_score = true;
            }
        }

        let score_for_agreement = if use_book_score { book_score } else { obi };
        let threshold = if use_book_score {
            ai.book_score_threshold
        } else {
            ai.obi_threshold
        };
        let obi_agrees_long = score_for_agreement > threshold;
        let obi_agrees_short = score_for_agreement < -threshold;

        // Synthetic order-book vote: OBI + one strategy can reach two votes.
        if ai.obi_counts_as_confluence {
            let entry_price = self.market_data.latest_price(pair).unwrap_or(0.0);
            let synthetic = (0.4 + score_for_agreement.abs() * 0.6).min(1.0);
            if obi_agrees_long {
                long_signals.push(StrategySignal::new(
                    ORDER_BOOK_STRATEGY,
                    pair,
                    SignalDirection::Long,
                    synthetic,
                    synthetic,
                    entry_price,
                    0.0,
                    0.0,
                    serde_json::json!({}),
                ));
            }
            if obi_agrees_short {
                short_signals.push(StrategySignal::new(
                    ORDER_BOOK_STRATEGY,
                    pair,
                    SignalDirection::Short,
                    synthetic,
                    synthetic,
                    entry_price,
                    0.0,
                    0.0,
                    serde_json::json!({}),
                ));
            }
        }

        let long_count = long_signals.len();
        let short_count = short_signals.len();

        let (direction, directional, confluence_count, obi_agrees) =
            if long_count > short_count && long_count >= 1 {
                (SignalDirection::Long, &long_signals, long_count, obi_agrees_long)
            } else if short_count > long_count && short_count >= 1 {
                (SignalDirection::Short, &short_signals, short_count, obi_agrees_short)
            } else {
                let mut neutral = ConfluenceSignal::neutral(pair);
                neutral.signals = signals;
                neutral.regime = reading.trend_regime.clone();
                neutral.volatility_regime = reading.vol_regime.clone();
                return neutral;
            };

        // Performance- and regime-weighted averages.
        let weight_of = |s: &StrategySignal| {
            self.strategy_weight(&s.strategy_name, &reading.trend_regime, &reading.vol_regime)
        };
        let total_weight: f64 = directional.iter().map(weight_of).sum();
        let (mut weighted_strength, mut weighted_confidence) = if total_weight > 0.0 {
            (
                directional.iter().map(|s| s.strength * weight_of(s)).sum::<f64>() / total_weight,
                directional.iter().map(|s| s.confidence * weight_of(s)).sum::<f64>() / total_weight,
            )
        } else {
            let n = directional.len() as f64;
            (
                directional.iter().map(|s| s.strength).sum::<f64>() / n,
                directional.iter().map(|s| s.confidence).sum::<f64>() / n,
            )
        };

        // Confluence bonus.
        let confluence_bonus = ((confluence_count - 1) as f64 * 0.1).min(0.3);
        weighted_confidence = (weighted_confidence + confluence_bonus).min(1.0);

        // Opposing penalty: real strategies actively disagreeing.
        let opposing = if direction == SignalDirection::Long {
            &short_signals
        } else {
            &long_signals
        };
        let opposing_count = opposing
            .iter()
            .filter(|s| s.strategy_name != ORDER_BOOK_STRATEGY)
            .count();
        if opposing_count > 0 {
            let penalty = (opposing_count as f64 * 0.04).min(0.12);
            weighted_confidence = (weighted_confidence - penalty).max(0.0);
        }

        // Legacy bump when OBI is not itself a vote but agrees.
        if !ai.obi_counts_as_confluence && obi_agrees {
            weighted_confidence = (weighted_confidence + 0.05).min(1.0);
        }

        // Regime alignment bonus.
        if regime_aligned(&reading.trend_regime, directional) {
            weighted_confidence = (weighted_confidence + 0.03).min(1.0);
        }

        // Session-aware multiplier.
        if let Some(session) = &self.session {
            let mult = session.multiplier(Utc::now().hour());
            weighted_confidence = (weighted_confidence * mult).clamp(0.0, 1.0);
        }

        // Sure-fire detection.
        let is_sure_fire = confluence_count >= ai.confluence_threshold
            && obi_agrees
            && weighted_confidence >= ai.min_confidence;
        if is_sure_fire {
            weighted_strength = (weighted_strength + 0.15).min(1.0);
            weighted_confidence = (weighted_confidence + 0.10).min(1.0);
        }

        // SL/TP: strongest signal when complete, else widest stop + furthest
        // target across directional signals.
        let primary = directional.iter().max_by(|a, b| {
            a.strength
                .partial_cmp(&b.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let entry_price = primary.map(|s| s.entry_price).unwrap_or(0.0);
        let (stop_loss, take_profit) = match primary {
            Some(p) if p.stop_loss > 0.0 && p.take_profit > 0.0 => (p.stop_loss, p.take_profit),
            _ => {
                let sls: Vec<f64> = directional
                    .iter()
                    .map(|s| s.stop_loss)
                    .filter(|v| *v > 0.0)
                    .collect();
                let tps: Vec<f64> = directional
                    .iter()
                    .map(|s| s.take_profit)
                    .filter(|v| *v > 0.0)
                    .collect();
                if direction == SignalDirection::Long {
                    (
                        sls.iter().cloned().fold(f64::MAX, f64::min).min(f64::MAX),
                        tps.iter().cloned().fold(0.0, f64::max),
                    )
                } else {
                    (
                        sls.iter().cloned().fold(0.0, f64::max),
                        tps.iter().cloned().fold(f64::MAX, f64::min),
                    )
                }
            }
        };
        let stop_loss = if stop_loss == f64::MAX { 0.0 } else { stop_loss };
        let take_profit = if take_profit == f64::MAX { 0.0 } else { take_profit };

        let result = ConfluenceSignal {
            pair: pair.to_string(),
            direction,
            strength: weighted_strength.clamp(0.0, 1.0),
            confidence: weighted_confidence.clamp(0.0, 1.0),
            confluence_count,
            signals: {
                let mut all = signals;
                // Synthetic votes are part of the audit trail too.
                for s in directional.iter().filter(|s| s.strategy_name == ORDER_BOOK_STRATEGY) {
                    all.push(s.clone());
                }
                all
            },
            obi,
            book_score,
            obi_agrees,
            is_sure_fire,
            entry_price,
            stop_loss,
            take_profit,
            regime: reading.trend_regime.clone(),
            volatility_regime: reading.vol_regime.clone(),
            vol_level: reading.vol_level,
            vol_expanding: reading.vol_expanding,
            timeframe_agreement: 0,
            timeframes: BTreeMap::new(),
            timestamp: Utc::now().to_rfc3339(),
        };

        self.last_confluence.lock().insert(pair.to_string(), result.clone());
        result
    }

    // -------------------------------------------------------------------------
    // Cross-timeframe combination
    // -------------------------------------------------------------------------

    pub(crate) fn combine_timeframes(
        &self,
        pair: &str,
        results: BTreeMap<u32, ConfluenceSignal>,
    ) -> ConfluenceSignal {
        if results.is_empty() {
            return ConfluenceSignal::neutral(pair);
        }

        let mut primary_tf = if results.contains_key(&self.primary_timeframe) {
            self.primary_timeframe
        } else {
            *results.keys().min().unwrap()
        };
        let mut base = results[&primary_tf].clone();

        // Primary neutral: promote the highest non-primary timeframe whose
        // direction has enough agreement among the others.
        if base.direction == SignalDirection::Neutral {
            let mut by_direction: HashMap<SignalDirection, Vec<u32>> = HashMap::new();
            for (&tf, sig) in results.iter() {
                if tf != primary_tf && sig.direction != SignalDirection::Neutral {
                    by_direction.entry(sig.direction).or_default().push(tf);
                }
            }
            for (_, tfs) in by_direction {
                if tfs.len() >= self.min_agreement {
                    let best_tf = *tfs.iter().max().unwrap();
                    base = results[&best_tf].clone();
                    primary_tf = best_tf;
                    break;
                }
            }
        }
        let _ = primary_tf;

        if base.direction == SignalDirection::Neutral {
            return base;
        }

        let agreement: Vec<u32> = results
            .iter()
            .filter(|(_, sig)| sig.direction == base.direction)
            .map(|(tf, _)| *tf)
            .collect();
        let total_tfs = results.len();

        if agreement.len() < self.min_agreement {
            let mut neutral = ConfluenceSignal::neutral(pair);
            neutral.timeframe_agreement = agreement.len();
            neutral.timeframes = results
                .iter()
                .map(|(tf, sig)| (tf.to_string(), sig.direction.to_string()))
                .collect();
            return neutral;
        }

        // Agreement bonus scaled by timeframe weights and unanimity.
        let tf_weight_sum: f64 = agreement.iter().map(|tf| timeframe_weight(*tf)).sum();
        let max_weight: f64 = results.keys().map(|tf| timeframe_weight(*tf)).sum();
        let weighted_agreement = if max_weight > 0.0 {
            tf_weight_sum / max_weight
        } else {
            0.0
        };
        let bonus = if agreement.len() == total_tfs && total_tfs >= 3 {
            0.15
        } else if agreement.len() == total_tfs && total_tfs == 2 {
            0.10
        } else {
            (weighted_agreement * 0.12).min(0.10)
        };

        base.strength = (base.strength + bonus).min(1.0);
        base.confidence = (base.confidence + bonus).min(1.0);
        base.timeframe_agreement = agreement.len();
        base.timeframes = results
            .iter()
            .map(|(tf, sig)| (tf.to_string(), sig.direction.to_string()))
            .collect();

        // SL/TP from the numerically largest agreeing timeframe: wider stops
        // survive noise better.
        let highest_tf = *agreement.iter().max().unwrap();
        let highest = &results[&highest_tf];
        if highest.stop_loss > 0.0 && highest.take_profit > 0.0 {
            base.stop_loss = highest.stop_loss;
            base.take_profit = highest.take_profit;
        }

        base
    }

    // -------------------------------------------------------------------------
    // Weights
    // -------------------------------------------------------------------------

    fn strategy_weight(&self, name: &str, trend_regime: &str, vol_regime: &str) -> f64 {
        if name == ORDER_BOOK_STRATEGY {
            return self.config.ai.obi_weight;
        }
        for r in &self.strategies {
            if r.strategy.name() == name {
                let perf = r.tracker.adaptive_performance_factor(trend_regime, vol_regime);
                return r.strategy.base_weight()
                    * perf
                    * self.regime_multiplier(name, trend_regime, vol_regime);
            }
        }
        0.1
    }

    fn regime_multiplier(&self, name: &str, trend_regime: &str, vol_regime: &str) -> f64 {
        let cfg = &self.config.regime;
        let mut mult = 1.0;
        match trend_regime {
            "trend" => mult *= cfg.trend_weight_multipliers.get(name).copied().unwrap_or(1.0),
            "range" => mult *= cfg.range_weight_multipliers.get(name).copied().unwrap_or(1.0),
            _ => {}
        }
        match vol_regime {
            "high_vol" => mult *= cfg.high_vol_weight_multipliers.get(name).copied().unwrap_or(1.0),
            "low_vol" => mult *= cfg.low_vol_weight_multipliers.get(name).copied().unwrap_or(1.0),
            _ => {}
        }
        mult
    }

    // -------------------------------------------------------------------------
    // Performance recording + runtime guardrail
    // -------------------------------------------------------------------------

    /// Record a closed trade's PnL against the strategy that produced it,
    /// then re-evaluate the runtime guardrail for that strategy.
    pub fn record_trade_result(&self, strategy_name: &str, pnl: f64, trend: &str, vol: &str) {
        self.record_trade_result_at(strategy_name, pnl, trend, vol, now_unix());
    }

    pub fn record_trade_result_at(
        &self,
        strategy_name: &str,
        pnl: f64,
        trend: &str,
        vol: &str,
        now: f64,
    ) {
        for r in &self.strategies {
            if r.strategy.name() == strategy_name {
                r.tracker.record(pnl, trend, vol, now);
                self.evaluate_guardrail(r, now);
                return;
            }
        }
    }

    fn evaluate_guardrail(&self, r: &RegisteredStrategy, now: f64) {
        let ai = &self.config.ai;
        if !ai.strategy_guardrails_enabled {
            return;
        }
        let min_trades = ai.strategy_guardrails_min_trades.max(5);
        let window_size = ai.strategy_guardrails_window_trades.max(min_trades);

        let window = r.tracker.recent_pnls(window_size);
        if window.len() < min_trades {
            return;
        }

        let wins = window.iter().filter(|p| **p > 0.0).count();
        let win_rate = wins as f64 / window.len() as f64;
        let gross_profit: f64 = window.iter().filter(|p| **p > 0.0).sum();
        let gross_loss: f64 = window.iter().filter(|p| **p < 0.0).map(|p| p.abs()).sum();
        let profit_factor = if gross_loss == 0.0 {
            if gross_profit > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            gross_profit / gross_loss
        };

        let degraded = win_rate < ai.strategy_guardrails_min_win_rate
            && profit_factor < ai.strategy_guardrails_min_profit_factor;
        if !degraded {
            return;
        }

        let name = r.strategy.name().to_string();
        let disable_secs = ai.strategy_guardrails_disable_minutes.max(1) as f64 * 60.0;
        let mut until_map = self.runtime_disabled_until.lock();
        let existing = until_map.get(&name).copied().unwrap_or(0.0);
        let disabled_until = (now + disable_secs).max(existing);
        until_map.insert(name.clone(), disabled_until);
        drop(until_map);

        let reason = format!(
            "guardrail: wr={win_rate:.2} pf={profit_factor:.2} window={}",
            window.len()
        );
        self.runtime_disable_reason.lock().insert(name.clone(), reason);
        warn!(
            strategy = %name,
            win_rate = format!("{win_rate:.4}"),
            profit_factor = format!("{profit_factor:.4}"),
            window = window.len(),
            disabled_minutes = ai.strategy_guardrails_disable_minutes,
            "strategy auto-disabled by runtime guardrail"
        );
    }

    pub fn is_runtime_disabled(&self, strategy_name: &str) -> bool {
        self.is_runtime_disabled_at(strategy_name, now_unix())
    }

    pub fn is_runtime_disabled_at(&self, strategy_name: &str, now: f64) -> bool {
        let mut until_map = self.runtime_disabled_until.lock();
        match until_map.get(strategy_name).copied() {
            Some(until) if until > now => true,
            Some(_) => {
                until_map.remove(strategy_name);
                self.runtime_disable_reason.lock().remove(strategy_name);
                false
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn strategy_stats(&self) -> Vec<DetectorStrategyStats> {
        self.strategies
            .iter()
            .map(|r| {
                let name = r.strategy.name();
                DetectorStrategyStats {
                    stats: r.tracker.stats(name, r.strategy.base_weight()),
                    runtime_disabled: self.is_runtime_disabled(name),
                    runtime_disable_reason: self.runtime_disable_reason.lock().get(name).cloned(),
                }
            })
            .collect()
    }

    pub fn last_confluence(&self, pair: &str) -> Option<ConfluenceSignal> {
        self.last_confluence.lock().get(pair).cloned()
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|r| r.strategy.name()).collect()
    }
}

/// True when the dominant strategy family matches the trend regime.
fn regime_aligned(trend_regime: &str, directional: &[StrategySignal]) -> bool {
    const TREND_SET: &[&str] = &["trend", "ichimoku", "supertrend", "volatility_squeeze"];
    const RANGE_SET: &[&str] = &["mean_reversion", "stochastic_divergence", "reversal", "keltner"];
    let set = match trend_regime {
        "trend" => TREND_SET,
        "range" => RANGE_SET,
        _ => return false,
    };
    directional
        .iter()
        .any(|s| set.contains(&s.strategy_name.as_str()))
}

fn build_strategies(single_strategy_mode: Option<&str>) -> Vec<RegisteredStrategy> {
    let all: Vec<Arc<dyn Strategy>> = vec![
        Arc::new(KeltnerStrategy::default()),
        Arc::new(MeanReversionStrategy::default()),
        Arc::new(IchimokuStrategy::default()),
        Arc::new(OrderFlowStrategy::default()),
        Arc::new(TrendStrategy::default()),
        Arc::new(StochasticDivergenceStrategy::default()),
        Arc::new(VolatilitySqueezeStrategy::default()),
        Arc::new(SupertrendStrategy::default()),
        Arc::new(ReversalStrategy::default()),
    ];

    all.into_iter()
        .filter(|s| single_strategy_mode.map_or(true, |only| s.name() == only))
        .map(|strategy| RegisteredStrategy {
            strategy,
            tracker: PerformanceTracker::new(),
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Bar;
    use serde_json::json;

    fn detector_with(config_mut: impl FnOnce(&mut BotConfig)) -> ConfluenceDetector {
        let mut config = BotConfig::default();
        config_mut(&mut config);
        let cache = Arc::new(MarketDataCache::new(600, 100));
        ConfluenceDetector::new(cache, &config, None)
    }

    fn signal(name: &str, direction: SignalDirection, strength: f64, confidence: f64) -> StrategySignal {
        StrategySignal::new(
            name,
            "BTC/USD",
            direction,
            strength,
            confidence,
            100.0,
            if direction == SignalDirection::Long { 98.0 } else { 102.0 },
            if direction == SignalDirection::Long { 103.0 } else { 97.0 },
            json!({}),
        )
    }

    fn reading() -> RegimeReading {
        RegimeReading::default()
    }

    #[test]
    fn detector_registers_nine_strategies() {
        let det = detector_with(|_| {});
        assert_eq!(det.strategy_names().len(), 9);
    }

    #[test]
    fn single_strategy_mode_filters() {
        let det = detector_with(|c| {
            c.trading.single_strategy_mode = Some("keltner".to_string());
        });
        assert_eq!(det.strategy_names(), vec!["keltner"]);
    }

    #[test]
    fn plurality_picks_direction() {
        let det = detector_with(|_| {});
        let sigs = vec![
            signal("keltner", SignalDirection::Long, 0.6, 0.6),
            signal("trend", SignalDirection::Long, 0.5, 0.5),
            signal("reversal", SignalDirection::Short, 0.5, 0.5),
        ];
        let out = det.compute_confluence("BTC/USD", sigs, &reading());
        assert_eq!(out.direction, SignalDirection::Long);
        assert_eq!(out.confluence_count, 2);
    }

    #[test]
    fn tie_is_neutral() {
        let det = detector_with(|_| {});
        let sigs = vec![
            signal("keltner", SignalDirection::Long, 0.6, 0.6),
            signal("trend", SignalDirection::Short, 0.6, 0.6),
        ];
        let out = det.compute_confluence("BTC/USD", sigs, &reading());
        assert_eq!(out.direction, SignalDirection::Neutral);
    }

    #[test]
    fn opposing_votes_cut_confidence() {
        let det = detector_with(|_| {});
        let agreeing = vec![
            signal("keltner", SignalDirection::Long, 0.6, 0.6),
            signal("trend", SignalDirection::Long, 0.6, 0.6),
        ];
        let with_opposition = vec![
            signal("keltner", SignalDirection::Long, 0.6, 0.6),
            signal("trend", SignalDirection::Long, 0.6, 0.6),
            signal("reversal", SignalDirection::Short, 0.5, 0.5),
            signal("mean_reversion", SignalDirection::Short, 0.5, 0.5),
        ];
        let base = det.compute_confluence("BTC/USD", agreeing, &reading());
        let opposed = det.compute_confluence("BTC/USD", with_opposition, &reading());
        // Same direction, two opposers: 0.08 lower confidence (before other
        // adjustments, which are identical here).
        assert_eq!(opposed.direction, SignalDirection::Long);
        assert!(opposed.confidence < base.confidence);
    }

    #[test]
    fn confluence_bonus_scales_with_count() {
        let det = detector_with(|_| {});
        let two = vec![
            signal("keltner", SignalDirection::Long, 0.5, 0.5),
            signal("trend", SignalDirection::Long, 0.5, 0.5),
        ];
        let four = vec![
            signal("keltner", SignalDirection::Long, 0.5, 0.5),
            signal("trend", SignalDirection::Long, 0.5, 0.5),
            signal("ichimoku", SignalDirection::Long, 0.5, 0.5),
            signal("supertrend", SignalDirection::Long, 0.5, 0.5),
        ];
        let a = det.compute_confluence("BTC/USD", two, &reading());
        let b = det.compute_confluence("BTC/USD", four, &reading());
        assert!(b.confidence > a.confidence);
    }

    #[test]
    fn non_actionable_signals_do_not_vote() {
        let det = detector_with(|_| {});
        let sigs = vec![
            signal("keltner", SignalDirection::Long, 0.2, 0.2), // below floors
            signal("trend", SignalDirection::Short, 0.6, 0.6),
        ];
        let out = det.compute_confluence("BTC/USD", sigs, &reading());
        assert_eq!(out.direction, SignalDirection::Short);
        assert_eq!(out.confluence_count, 1);
    }

    #[test]
    fn synthetic_obi_vote_respects_toggle() {
        // With obi_counts_as_confluence=false the synthetic vote must never
        // contribute to confluence_count even when the book agrees hard.
        let det = detector_with(|c| {
            c.ai.obi_counts_as_confluence = false;
        });
        let book = crate::market_data::OrderBookSnapshot {
            bids: vec![(100.0, 500.0)],
            asks: vec![(100.1, 10.0)],
            updated_at: now_unix(),
        };
        det.market_data.update_order_book("BTC/USD", book.clone());
        det.market_data.update_order_book_analysis(
            "BTC/USD",
            crate::market_data::analyze_order_book(&book, 1_000.0),
        );

        let sigs = vec![signal("keltner", SignalDirection::Long, 0.6, 0.6)];
        let out = det.compute_confluence("BTC/USD", sigs.clone(), &reading());
        assert_eq!(out.confluence_count, 1);
        assert!(out.obi_agrees);

        // With the toggle on the synthetic vote joins the count.
        let det2 = detector_with(|c| {
            c.ai.obi_counts_as_confluence = true;
        });
        det2.market_data.update_order_book("BTC/USD", book.clone());
        det2.market_data.update_order_book_analysis(
            "BTC/USD",
            crate::market_data::analyze_order_book(&book, 1_000.0),
        );
        det2.market_data.update_ticker("BTC/USD", 100.0);
        let out2 = det2.compute_confluence("BTC/USD", sigs, &reading());
        assert_eq!(out2.confluence_count, 2);
    }

    #[test]
    fn sure_fire_requires_count_agreement_and_confidence() {
        let det = detector_with(|c| {
            c.ai.obi_counts_as_confluence = true;
            c.ai.confluence_threshold = 3;
            c.ai.min_confidence = 0.5;
        });
        let book = crate::market_data::OrderBookSnapshot {
            bids: vec![(100.0, 500.0)],
            asks: vec![(100.1, 10.0)],
            updated_at: now_unix(),
        };
        det.market_data.update_order_book("BTC/USD", book.clone());
        det.market_data.update_order_book_analysis(
            "BTC/USD",
            crate::market_data::analyze_order_book(&book, 1_000.0),
        );
        det.market_data.update_ticker("BTC/USD", 100.0);

        let sigs = vec![
            signal("keltner", SignalDirection::Long, 0.7, 0.7),
            signal("trend", SignalDirection::Long, 0.7, 0.7),
            signal("ichimoku", SignalDirection::Long, 0.7, 0.7),
        ];
        let out = det.compute_confluence("BTC/USD", sigs, &reading());
        assert!(out.is_sure_fire, "3 votes + obi + synthetic should be sure fire");
        assert!(out.confluence_count >= 3);
    }

    #[test]
    fn sl_tp_from_strongest_signal() {
        let det = detector_with(|_| {});
        let mut strong = signal("keltner", SignalDirection::Long, 0.9, 0.8);
        strong.stop_loss = 95.0;
        strong.take_profit = 110.0;
        let weak = signal("trend", SignalDirection::Long, 0.4, 0.5);
        let out = det.compute_confluence("BTC/USD", vec![strong, weak], &reading());
        assert_eq!(out.stop_loss, 95.0);
        assert_eq!(out.take_profit, 110.0);
    }

    // ---------------------------------------------------------------------
    // Cross-timeframe combination
    // ---------------------------------------------------------------------

    fn tf_signal(direction: SignalDirection, strength: f64, sl: f64, tp: f64) -> ConfluenceSignal {
        let mut sig = ConfluenceSignal::neutral("BTC/USD");
        sig.direction = direction;
        sig.strength = strength;
        sig.confidence = strength;
        sig.stop_loss = sl;
        sig.take_profit = tp;
        sig.entry_price = 100.0;
        sig.confluence_count = 2;
        sig
    }

    #[test]
    fn unanimous_timeframes_get_bonus() {
        let det = detector_with(|c| {
            c.trading.timeframes = vec![1, 5, 15];
        });
        let mut results = BTreeMap::new();
        results.insert(1, tf_signal(SignalDirection::Long, 0.5, 98.0, 103.0));
        results.insert(5, tf_signal(SignalDirection::Long, 0.5, 97.0, 104.0));
        results.insert(15, tf_signal(SignalDirection::Long, 0.5, 96.0, 105.0));
        let out = det.combine_timeframes("BTC/USD", results);
        assert_eq!(out.direction, SignalDirection::Long);
        assert!((out.strength - 0.65).abs() < 1e-9, "0.5 + 0.15 unanimity bonus");
        assert_eq!(out.timeframe_agreement, 3);
        // SL/TP from the largest agreeing timeframe.
        assert_eq!(out.stop_loss, 96.0);
        assert_eq!(out.take_profit, 105.0);
    }

    #[test]
    fn insufficient_agreement_is_neutral() {
        let det = detector_with(|c| {
            c.trading.timeframes = vec![1, 5, 15];
            c.ai.multi_timeframe_min_agreement = 2;
        });
        let mut results = BTreeMap::new();
        results.insert(1, tf_signal(SignalDirection::Long, 0.5, 98.0, 103.0));
        results.insert(5, tf_signal(SignalDirection::Short, 0.5, 102.0, 97.0));
        results.insert(15, tf_signal(SignalDirection::Neutral, 0.0, 0.0, 0.0));
        let out = det.combine_timeframes("BTC/USD", results);
        assert_eq!(out.direction, SignalDirection::Neutral);
        assert_eq!(out.timeframe_agreement, 1);
    }

    #[test]
    fn neutral_primary_promotes_agreeing_higher_timeframe() {
        let det = detector_with(|c| {
            c.trading.timeframes = vec![1, 5, 15];
            c.ai.multi_timeframe_min_agreement = 2;
        });
        let mut results = BTreeMap::new();
        results.insert(1, tf_signal(SignalDirection::Neutral, 0.0, 0.0, 0.0));
        results.insert(5, tf_signal(SignalDirection::Long, 0.5, 97.0, 104.0));
        results.insert(15, tf_signal(SignalDirection::Long, 0.6, 96.0, 105.0));
        let out = det.combine_timeframes("BTC/USD", results);
        assert_eq!(out.direction, SignalDirection::Long);
        // Promoted base is the highest agreeing timeframe (15).
        assert_eq!(out.stop_loss, 96.0);
    }

    #[test]
    fn two_timeframe_unanimity_bonus_is_010() {
        let det = detector_with(|c| {
            c.trading.timeframes = vec![1, 5];
        });
        let mut results = BTreeMap::new();
        results.insert(1, tf_signal(SignalDirection::Short, 0.5, 102.0, 97.0));
        results.insert(5, tf_signal(SignalDirection::Short, 0.5, 103.0, 96.0));
        let out = det.combine_timeframes("BTC/USD", results);
        assert!((out.strength - 0.60).abs() < 1e-9);
    }

    // ---------------------------------------------------------------------
    // Runtime guardrail
    // ---------------------------------------------------------------------

    #[test]
    fn guardrail_disables_and_expires() {
        let det = detector_with(|c| {
            c.ai.strategy_guardrails_min_trades = 5;
            c.ai.strategy_guardrails_window_trades = 5;
            c.ai.strategy_guardrails_min_win_rate = 0.60;
            c.ai.strategy_guardrails_min_profit_factor = 1.20;
            c.ai.strategy_guardrails_disable_minutes = 30;
        });

        let t0 = 1_700_000_000.0;
        for _ in 0..5 {
            det.record_trade_result_at("keltner", -12.0, "range", "mid_vol", t0);
        }
        assert!(det.is_runtime_disabled_at("keltner", t0 + 60.0));
        // Guardrail only hits the offending strategy.
        assert!(!det.is_runtime_disabled_at("trend", t0 + 60.0));
        // 31 minutes later it re-enables.
        assert!(!det.is_runtime_disabled_at("keltner", t0 + 31.0 * 60.0));
    }

    #[test]
    fn guardrail_needs_both_conditions() {
        // Low win rate but a big winner keeps the profit factor healthy:
        // the strategy must stay enabled.
        let det = detector_with(|c| {
            c.ai.strategy_guardrails_min_trades = 5;
            c.ai.strategy_guardrails_window_trades = 5;
            c.ai.strategy_guardrails_min_win_rate = 0.60;
            c.ai.strategy_guardrails_min_profit_factor = 1.20;
        });
        let t0 = 1_700_000_000.0;
        det.record_trade_result_at("trend", 100.0, "", "", t0);
        for _ in 0..4 {
            det.record_trade_result_at("trend", -5.0, "", "", t0);
        }
        assert!(!det.is_runtime_disabled_at("trend", t0 + 1.0));
    }

    #[test]
    fn guardrail_waits_for_min_trades() {
        let det = detector_with(|c| {
            c.ai.strategy_guardrails_min_trades = 5;
            c.ai.strategy_guardrails_window_trades = 5;
        });
        let t0 = 1_700_000_000.0;
        for _ in 0..4 {
            det.record_trade_result_at("reversal", -10.0, "", "", t0);
        }
        assert!(!det.is_runtime_disabled_at("reversal", t0 + 1.0));
    }

    #[test]
    fn stats_expose_runtime_disabled_flag() {
        let det = detector_with(|c| {
            c.ai.strategy_guardrails_min_trades = 5;
            c.ai.strategy_guardrails_window_trades = 5;
        });
        for _ in 0..5 {
            det.record_trade_result("keltner", -12.0, "", "");
        }
        let stats = det.strategy_stats();
        let keltner = stats.iter().find(|s| s.stats.name == "keltner").unwrap();
        assert!(keltner.runtime_disabled);
        assert!(keltner.runtime_disable_reason.is_some());
    }

    // ---------------------------------------------------------------------
    // Full analyze path
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn cold_pair_is_neutral() {
        let det = detector_with(|_| {});
        let out = det.analyze_pair("BTC/USD").await;
        assert_eq!(out.direction, SignalDirection::Neutral);
    }

    #[tokio::test]
    async fn warmed_quiet_pair_scans_without_signal() {
        let det = detector_with(|_| {});
        let bars: Vec<Bar> = (0..200)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.7).sin() * 0.2;
                Bar {
                    time: i as f64 * 60.0,
                    open: close,
                    high: close + 0.1,
                    low: close - 0.1,
                    close,
                    volume: 50.0,
                    vwap: close,
                }
            })
            .collect();
        det.market_data.warmup("BTC/USD", bars);
        let out = det.analyze_pair("BTC/USD").await;
        // A flat, freshly-warmed pair analyzes cleanly; no direction demanded.
        assert_eq!(out.pair, "BTC/USD");
    }

    #[test]
    fn regime_weighting_favors_family() {
        let det = detector_with(|_| {});
        let trending = det.strategy_weight("trend", "trend", "mid_vol");
        let ranging = det.strategy_weight("trend", "range", "mid_vol");
        assert!(trending > ranging);

        let mr_range = det.strategy_weight("mean_reversion", "range", "mid_vol");
        let mr_trend = det.strategy_weight("mean_reversion", "trend", "mid_vol");
        assert!(mr_range > mr_trend);
    }

    #[test]
    fn unknown_strategy_gets_default_weight() {
        let det = detector_with(|_| {});
        assert_eq!(det.strategy_weight("mystery", "trend", "mid_vol"), 0.1);
    }
}
