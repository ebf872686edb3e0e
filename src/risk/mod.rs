// =============================================================================
// Risk Manager — pre-trade gates, Kelly sizing, exposure and cooldowns
// =============================================================================
//
// Approves or denies each trade intent and sizes approved positions. Gates
// are evaluated in a fixed order; the first rejection short-circuits. Daily
// counters reset automatically when the UTC date rolls over.

pub mod stop_loss;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{RiskConfig, TradingConfig};
use crate::types::TradeSide;
use stop_loss::{StopLossParams, StopLossState};

// -----------------------------------------------------------------------------
// Public types
// -----------------------------------------------------------------------------

/// One trade intent presented for approval.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub pair: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub win_rate: f64,
    pub avg_win_loss_ratio: f64,
    pub confidence: f64,
}

/// Decision returned to the executor.
#[derive(Debug, Clone, Serialize)]
pub struct RiskDecision {
    pub allowed: bool,
    pub size_usd: f64,
    pub reason: String,
    pub risk_reward_ratio: f64,
}

impl RiskDecision {
    fn deny(reason: impl Into<String>, rr: f64) -> Self {
        Self {
            allowed: false,
            size_usd: 0.0,
            reason: reason.into(),
            risk_reward_ratio: rr,
        }
    }
}

/// Snapshot for the dashboard / control surface.
#[derive(Debug, Clone, Serialize)]
pub struct RiskReport {
    pub bankroll: f64,
    pub initial_bankroll: f64,
    pub peak_bankroll: f64,
    pub current_drawdown_pct: f64,
    pub max_drawdown_pct: f64,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub open_positions: usize,
    pub total_exposure_usd: f64,
    pub remaining_capacity_usd: f64,
    pub risk_of_ruin: f64,
    pub drawdown_factor: f64,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    pair: String,
    size_usd: f64,
    sl_state: StopLossState,
}

struct Inner {
    bankroll: f64,
    peak_bankroll: f64,
    max_drawdown_pct: f64,
    daily_pnl: f64,
    daily_trades: u32,
    current_date: String,
    consecutive_wins: u32,
    consecutive_losses: u32,
    last_loss_at: Option<f64>,
    /// Last close (win or loss) per pair, unix seconds.
    pair_last_close: HashMap<String, f64>,
    /// Last close per (pair, strategy, side) for strategy cooldowns.
    strategy_last_close: HashMap<(String, String, String), f64>,
    /// In-memory trades-opened counter for the rolling hour.
    hour_window_start: f64,
    hour_trades: u32,
    open_positions: HashMap<String, OpenPosition>,
}

// -----------------------------------------------------------------------------
// Risk Manager
// -----------------------------------------------------------------------------

pub struct RiskManager {
    risk: RiskConfig,
    trading: TradingConfig,
    min_risk_reward_ratio: f64,
    /// Canary-clamped caps, applied at construction.
    max_position_usd: f64,
    max_risk_per_trade: f64,
    trading_paused: Arc<AtomicBool>,
    inner: Mutex<Inner>,
}

impl RiskManager {
    pub fn new(
        risk: RiskConfig,
        trading: TradingConfig,
        min_risk_reward_ratio: f64,
        max_position_usd: f64,
        max_risk_per_trade: f64,
        trading_paused: Arc<AtomicBool>,
    ) -> Self {
        let bankroll = risk.initial_bankroll;
        info!(
            bankroll,
            max_position_usd,
            max_risk_per_trade,
            min_risk_reward_ratio,
            "risk manager initialized"
        );
        Self {
            risk,
            trading,
            min_risk_reward_ratio,
            max_position_usd,
            max_risk_per_trade,
            trading_paused,
            inner: Mutex::new(Inner {
                bankroll,
                peak_bankroll: bankroll,
                max_drawdown_pct: 0.0,
                daily_pnl: 0.0,
                daily_trades: 0,
                current_date: date_string(now_unix()),
                consecutive_wins: 0,
                consecutive_losses: 0,
                last_loss_at: None,
                pair_last_close: HashMap::new(),
                strategy_last_close: HashMap::new(),
                hour_window_start: now_unix(),
                hour_trades: 0,
                open_positions: HashMap::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Pre-trade evaluation
    // -------------------------------------------------------------------------

    /// Evaluate a trade intent. `sql_trades_last_hour` is the ledger's count
    /// of trades opened in the trailing hour; the stricter of it and the
    /// in-memory counter applies.
    pub fn evaluate_trade(&self, intent: &TradeIntent, sql_trades_last_hour: u32) -> RiskDecision {
        self.evaluate_trade_at(intent, sql_trades_last_hour, now_unix())
    }

    pub fn evaluate_trade_at(
        &self,
        intent: &TradeIntent,
        sql_trades_last_hour: u32,
        now: f64,
    ) -> RiskDecision {
        let sl_dist = (intent.entry_price - intent.stop_loss).abs();
        let tp_dist = (intent.take_profit - intent.entry_price).abs();
        let rr = if sl_dist > 0.0 { tp_dist / sl_dist } else { 0.0 };

        // 1. Pause flag.
        if self.trading_paused.load(Ordering::SeqCst) {
            return RiskDecision::deny("trading paused", rr);
        }

        let mut inner = self.inner.lock();
        maybe_reset_daily(&mut inner, now, self.risk.initial_bankroll);

        // 2. Daily trade cap.
        if self.risk.max_daily_trades > 0 && inner.daily_trades >= self.risk.max_daily_trades {
            return RiskDecision::deny(
                format!("daily trade cap reached ({})", self.risk.max_daily_trades),
                rr,
            );
        }

        // 3. Per-hour cap (0 disables).
        if self.trading.max_trades_per_hour > 0 {
            if now - inner.hour_window_start > 3600.0 {
                inner.hour_window_start = now;
                inner.hour_trades = 0;
            }
            let hourly = inner.hour_trades.max(sql_trades_last_hour);
            if hourly >= self.trading.max_trades_per_hour {
                return RiskDecision::deny(
                    format!("hourly trade cap reached ({hourly})"),
                    rr,
                );
            }
        }

        // 4. Risk/reward.
        if intent.entry_price <= 0.0 || sl_dist <= 0.0 || tp_dist <= 0.0 {
            return RiskDecision::deny("missing SL/TP levels", rr);
        }
        if rr < self.min_risk_reward_ratio {
            return RiskDecision::deny(
                format!("risk/reward {rr:.2} below minimum {:.2}", self.min_risk_reward_ratio),
                rr,
            );
        }

        // 5. Per-pair cooldown.
        if let Some(last) = inner.pair_last_close.get(&intent.pair) {
            let elapsed = now - last;
            if elapsed < self.trading.cooldown_seconds as f64 {
                return RiskDecision::deny(
                    format!("pair cooldown ({elapsed:.0}s < {}s)", self.trading.cooldown_seconds),
                    rr,
                );
            }
        }

        // 6. Global cooldown after a losing streak.
        if inner.consecutive_losses >= 2 {
            if let Some(last_loss) = inner.last_loss_at {
                let elapsed = now - last_loss;
                let window = self.risk.global_cooldown_seconds_on_loss as f64;
                if elapsed < window {
                    return RiskDecision::deny(
                        format!(
                            "global loss cooldown ({} consecutive losses, {elapsed:.0}s elapsed)",
                            inner.consecutive_losses
                        ),
                        rr,
                    );
                }
            }
        }

        // 7. Daily loss limit.
        if inner.bankroll > 0.0 {
            let daily_loss_frac = -inner.daily_pnl / inner.bankroll;
            if daily_loss_frac >= self.risk.max_daily_loss {
                return RiskDecision::deny(
                    format!("daily loss limit hit ({:.2}%)", daily_loss_frac * 100.0),
                    rr,
                );
            }
        }

        // 8. Risk of ruin.
        let ror = risk_of_ruin(
            intent.win_rate,
            intent.avg_win_loss_ratio,
            self.max_risk_per_trade,
        );
        if ror > self.risk.risk_of_ruin_threshold {
            return RiskDecision::deny(
                format!("risk of ruin {ror:.4} above threshold"),
                rr,
            );
        }

        // 9. Max concurrent open positions.
        if inner.open_positions.len() >= self.trading.max_concurrent_positions {
            return RiskDecision::deny(
                format!(
                    "max concurrent positions reached ({})",
                    self.trading.max_concurrent_positions
                ),
                rr,
            );
        }

        // Sizing.
        let drawdown_factor = drawdown_factor(current_drawdown_pct(&inner));
        let size_usd = self.position_size(&inner, intent, sl_dist, drawdown_factor);
        if size_usd <= 0.0 {
            return RiskDecision::deny("computed size is zero", rr);
        }

        // 10. Exposure cap.
        let exposure: f64 = inner.open_positions.values().map(|p| p.size_usd).sum();
        let cap = self.risk.max_total_exposure_pct * inner.bankroll;
        if exposure + size_usd > cap {
            return RiskDecision::deny(
                format!(
                    "exposure cap: {:.0} + {:.0} exceeds {:.0} USD",
                    exposure, size_usd, cap
                ),
                rr,
            );
        }

        debug!(
            pair = %intent.pair,
            size_usd,
            rr,
            drawdown_factor,
            "trade intent approved"
        );
        RiskDecision {
            allowed: true,
            size_usd,
            reason: "ok".to_string(),
            risk_reward_ratio: rr,
        }
    }

    /// Kelly-scaled position size, capped by risk-per-trade and the absolute
    /// position cap.
    fn position_size(
        &self,
        inner: &Inner,
        intent: &TradeIntent,
        sl_dist: f64,
        drawdown_factor: f64,
    ) -> f64 {
        let wr = intent.win_rate.clamp(0.0, 1.0);
        let r = intent.avg_win_loss_ratio.max(1e-9);
        let f_star = (wr - (1.0 - wr) / r).max(0.0);
        let kelly = (self.risk.kelly_fraction * f_star).clamp(0.0, self.risk.max_kelly_size);

        let confidence_boost = (0.5 + intent.confidence).clamp(0.5, 1.5);
        let mut size = inner.bankroll * kelly * drawdown_factor * confidence_boost;

        // Risk-per-trade cap: a stop-out must not lose more than the cap.
        let sl_dist_pct = sl_dist / intent.entry_price;
        if sl_dist_pct > 0.0 {
            let risk_cap = inner.bankroll * self.max_risk_per_trade / sl_dist_pct;
            size = size.min(risk_cap);
        }

        size.min(self.max_position_usd).max(0.0)
    }

    // -------------------------------------------------------------------------
    // Position registry (mutated only by the executor)
    // -------------------------------------------------------------------------

    pub fn register_position(
        &self,
        trade_id: &str,
        pair: &str,
        side: TradeSide,
        size_usd: f64,
        entry_price: f64,
        initial_sl: f64,
    ) {
        let mut inner = self.inner.lock();
        inner.open_positions.insert(
            trade_id.to_string(),
            OpenPosition {
                pair: pair.to_string(),
                size_usd,
                sl_state: StopLossState::new(entry_price, initial_sl, side),
            },
        );
        inner.daily_trades += 1;
        inner.hour_trades += 1;
    }

    /// Advance the SL state machine for one open trade. Returns a snapshot
    /// of the state after the update, or None for an unknown trade.
    pub fn update_stop(&self, trade_id: &str, price: f64) -> Option<StopLossState> {
        let params = StopLossParams {
            breakeven_activation_pct: self.risk.breakeven_activation_pct,
            trailing_activation_pct: self.risk.trailing_activation_pct,
            trailing_step_pct: self.risk.trailing_step_pct,
            round_trip_fee_pct: 0.0,
        };
        let mut inner = self.inner.lock();
        let position = inner.open_positions.get_mut(trade_id)?;
        position.sl_state.update(price, &params);
        Some(position.sl_state)
    }

    pub fn stop_state(&self, trade_id: &str) -> Option<StopLossState> {
        self.inner.lock().open_positions.get(trade_id).map(|p| p.sl_state)
    }

    /// Remove a position from the registry (trade closed or cancelled).
    pub fn remove_position(&self, trade_id: &str) {
        self.inner.lock().open_positions.remove(trade_id);
    }

    pub fn open_position_count(&self) -> usize {
        self.inner.lock().open_positions.len()
    }

    pub fn total_exposure_usd(&self) -> f64 {
        self.inner.lock().open_positions.values().map(|p| p.size_usd).sum()
    }

    // -------------------------------------------------------------------------
    // Outcome recording
    // -------------------------------------------------------------------------

    /// Record a closed trade's PnL into the rolling counters and cooldown
    /// bookkeeping.
    pub fn record_trade_close(&self, pair: &str, strategy: &str, side: TradeSide, pnl: f64) {
        self.record_trade_close_at(pair, strategy, side, pnl, now_unix());
    }

    pub fn record_trade_close_at(
        &self,
        pair: &str,
        strategy: &str,
        side: TradeSide,
        pnl: f64,
        now: f64,
    ) {
        let mut inner = self.inner.lock();
        maybe_reset_daily(&mut inner, now, self.risk.initial_bankroll);

        inner.daily_pnl += pnl;
        inner.bankroll += pnl;
        if inner.bankroll > inner.peak_bankroll {
            inner.peak_bankroll = inner.bankroll;
        }
        let dd = current_drawdown_pct(&inner);
        if dd > inner.max_drawdown_pct {
            inner.max_drawdown_pct = dd;
        }

        if pnl > 0.0 {
            inner.consecutive_wins += 1;
            inner.consecutive_losses = 0;
        } else if pnl < 0.0 {
            inner.consecutive_losses += 1;
            inner.consecutive_wins = 0;
            inner.last_loss_at = Some(now);
        }

        inner.pair_last_close.insert(pair.to_string(), now);
        inner.strategy_last_close.insert(
            (pair.to_string(), strategy.to_string(), side.as_str().to_string()),
            now,
        );

        if pnl < 0.0 {
            warn!(pair, strategy, pnl, losses = inner.consecutive_losses, "losing trade recorded");
        } else {
            debug!(pair, strategy, pnl, "trade close recorded");
        }
    }

    // -------------------------------------------------------------------------
    // Cooldown predicate (injected into the confluence detector)
    // -------------------------------------------------------------------------

    /// True when the (pair, strategy, side) combination is still cooling
    /// down from its last close. Uses the per-strategy override when one is
    /// configured, else the global pair cooldown.
    pub fn is_on_cooldown(&self, pair: &str, strategy: &str, side: &str) -> bool {
        self.is_on_cooldown_at(pair, strategy, side, now_unix())
    }

    pub fn is_on_cooldown_at(&self, pair: &str, strategy: &str, side: &str, now: f64) -> bool {
        let window = self
            .trading
            .strategy_cooldowns_seconds
            .get(strategy)
            .copied()
            .unwrap_or(self.trading.cooldown_seconds) as f64;
        if window <= 0.0 {
            return false;
        }
        let key = (pair.to_string(), strategy.to_string(), side.to_string());
        let inner = self.inner.lock();
        match inner.strategy_last_close.get(&key) {
            Some(last) => now - last < window,
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------

    pub fn consecutive_losses(&self) -> u32 {
        self.inner.lock().consecutive_losses
    }

    pub fn current_drawdown_pct(&self) -> f64 {
        current_drawdown_pct(&self.inner.lock())
    }

    pub fn bankroll(&self) -> f64 {
        self.inner.lock().bankroll
    }

    pub fn report(&self, win_rate: f64, avg_win_loss_ratio: f64) -> RiskReport {
        let inner = self.inner.lock();
        let exposure: f64 = inner.open_positions.values().map(|p| p.size_usd).sum();
        let cap = self.risk.max_total_exposure_pct * inner.bankroll;
        let dd = current_drawdown_pct(&inner);
        RiskReport {
            bankroll: inner.bankroll,
            initial_bankroll: self.risk.initial_bankroll,
            peak_bankroll: inner.peak_bankroll,
            current_drawdown_pct: dd,
            max_drawdown_pct: inner.max_drawdown_pct,
            daily_pnl: inner.daily_pnl,
            daily_trades: inner.daily_trades,
            open_positions: inner.open_positions.len(),
            total_exposure_usd: exposure,
            remaining_capacity_usd: (cap - exposure).max(0.0),
            risk_of_ruin: risk_of_ruin(win_rate, avg_win_loss_ratio, self.max_risk_per_trade),
            drawdown_factor: drawdown_factor(dd),
            consecutive_wins: inner.consecutive_wins,
            consecutive_losses: inner.consecutive_losses,
        }
    }

    pub fn positions_for_pair(&self, pair: &str) -> Vec<String> {
        self.inner
            .lock()
            .open_positions
            .iter()
            .filter(|(_, p)| p.pair == pair)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

// -----------------------------------------------------------------------------
// Free helpers
// -----------------------------------------------------------------------------

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn date_string(unix: f64) -> String {
    DateTime::<Utc>::from_timestamp(unix as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn maybe_reset_daily(inner: &mut Inner, now: f64, _initial_bankroll: f64) {
    let today = date_string(now);
    if inner.current_date != today {
        info!(
            old_date = %inner.current_date,
            new_date = %today,
            "date rolled; resetting daily risk counters"
        );
        inner.daily_pnl = 0.0;
        inner.daily_trades = 0;
        inner.current_date = today;
    }
}

fn current_drawdown_pct(inner: &Inner) -> f64 {
    if inner.peak_bankroll <= 0.0 {
        return 0.0;
    }
    ((inner.peak_bankroll - inner.bankroll) / inner.peak_bankroll * 100.0).max(0.0)
}

/// Piecewise sizing haircut by drawdown depth.
fn drawdown_factor(drawdown_pct: f64) -> f64 {
    if drawdown_pct <= 0.0 {
        1.0
    } else if drawdown_pct <= 4.0 {
        0.80
    } else if drawdown_pct <= 8.0 {
        0.60
    } else {
        0.40
    }
}

/// Gambler's-ruin estimate: ((1 - edge) / (1 + edge)) ^ units with
/// edge = wr - (1 - wr) / R and units = 1 / max_risk_per_trade.
/// No edge means certain ruin (1.0).
fn risk_of_ruin(win_rate: f64, avg_win_loss_ratio: f64, max_risk_per_trade: f64) -> f64 {
    let r = avg_win_loss_ratio.max(1e-9);
    let edge = win_rate - (1.0 - win_rate) / r;
    if edge <= 0.0 {
        return 1.0;
    }
    let units = 1.0 / max_risk_per_trade.clamp(1e-4, 1.0);
    (((1.0 - edge) / (1.0 + edge)).max(0.0)).powf(units)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RiskManager {
        manager_with(|_, _| {})
    }

    fn manager_with(adjust: impl FnOnce(&mut RiskConfig, &mut TradingConfig)) -> RiskManager {
        let mut risk = RiskConfig::default();
        let mut trading = TradingConfig::default();
        adjust(&mut risk, &mut trading);
        let max_pos = risk.max_position_usd;
        let max_risk = risk.max_risk_per_trade;
        RiskManager::new(
            risk,
            trading,
            0.9,
            max_pos,
            max_risk,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn intent() -> TradeIntent {
        TradeIntent {
            pair: "BTC/USD".to_string(),
            side: TradeSide::Buy,
            entry_price: 50_000.0,
            stop_loss: 49_000.0,
            take_profit: 52_000.0,
            win_rate: 0.55,
            avg_win_loss_ratio: 2.0,
            confidence: 0.70,
        }
    }

    #[test]
    fn paper_lifecycle_sizing_is_bounded() {
        // Scenario: bankroll 10k, max_risk 2%, max_position 500 USD.
        let m = manager();
        let decision = m.evaluate_trade(&intent(), 0);
        assert!(decision.allowed, "reason: {}", decision.reason);
        assert!(decision.size_usd > 0.0);
        assert!(decision.size_usd <= 500.0);
        assert!(decision.risk_reward_ratio >= 1.0);
    }

    #[test]
    fn paused_denies_everything() {
        let paused = Arc::new(AtomicBool::new(true));
        let risk = RiskConfig::default();
        let trading = TradingConfig::default();
        let m = RiskManager::new(risk, trading, 0.9, 500.0, 0.02, paused);
        let decision = m.evaluate_trade(&intent(), 0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("paused"));
    }

    #[test]
    fn poor_risk_reward_denied() {
        let m = manager();
        let mut i = intent();
        i.take_profit = 50_100.0; // 0.1 RR vs 2% stop
        let decision = m.evaluate_trade(&i, 0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("risk/reward"));
    }

    #[test]
    fn hourly_cap_zero_disables() {
        let m = manager_with(|_, t| t.max_trades_per_hour = 0);
        // SQL says 1000 trades this hour; cap disabled, still allowed.
        let decision = m.evaluate_trade(&intent(), 1000);
        assert!(decision.allowed);
    }

    #[test]
    fn hourly_cap_consults_sql_count() {
        let m = manager_with(|_, t| t.max_trades_per_hour = 3);
        assert!(m.evaluate_trade(&intent(), 2).allowed);
        let decision = m.evaluate_trade(&intent(), 3);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("hourly"));
    }

    #[test]
    fn daily_cap_enforced() {
        let m = manager_with(|r, _| r.max_daily_trades = 2);
        m.register_position("t1", "BTC/USD", TradeSide::Buy, 100.0, 50_000.0, 49_000.0);
        m.register_position("t2", "ETH/USD", TradeSide::Buy, 100.0, 3_000.0, 2_900.0);
        let decision = m.evaluate_trade(&intent(), 0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("daily trade cap"));
    }

    #[test]
    fn pair_cooldown_applies() {
        let m = manager();
        let t0 = 1_700_000_000.0;
        m.record_trade_close_at("BTC/USD", "keltner", TradeSide::Buy, 10.0, t0);
        let denied = m.evaluate_trade_at(&intent(), 0, t0 + 10.0);
        assert!(!denied.allowed);
        assert!(denied.reason.contains("cooldown"));
        // After the window it clears.
        let allowed = m.evaluate_trade_at(&intent(), 0, t0 + 301.0);
        assert!(allowed.allowed, "reason: {}", allowed.reason);
    }

    #[test]
    fn global_loss_cooldown_after_streak() {
        let m = manager();
        let t0 = 1_700_000_000.0;
        m.record_trade_close_at("ETH/USD", "trend", TradeSide::Buy, -10.0, t0);
        m.record_trade_close_at("SOL/USD", "trend", TradeSide::Buy, -10.0, t0 + 1.0);
        let decision = m.evaluate_trade_at(&intent(), 0, t0 + 60.0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("global loss cooldown"));
    }

    #[test]
    fn daily_loss_limit_denies() {
        let m = manager();
        // Fixed mid-day timestamp keeps both events on the same UTC date.
        let t0 = 1_700_000_000.0;
        // 5% of 10k bankroll is the default cap; lose 600 on a non-intent
        // pair far enough in the past to dodge the pair cooldown.
        m.record_trade_close_at("ETH/USD", "trend", TradeSide::Buy, -600.0, t0 - 7200.0);
        let decision = m.evaluate_trade_at(&intent(), 0, t0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("daily loss"));
    }

    #[test]
    fn negative_edge_fails_risk_of_ruin() {
        let m = manager();
        let mut i = intent();
        i.win_rate = 0.30;
        i.avg_win_loss_ratio = 1.0;
        let decision = m.evaluate_trade(&i, 0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("ruin"));
    }

    #[test]
    fn max_positions_enforced() {
        let m = manager_with(|_, t| t.max_concurrent_positions = 1);
        m.register_position("t1", "ETH/USD", TradeSide::Buy, 100.0, 3_000.0, 2_900.0);
        let decision = m.evaluate_trade(&intent(), 0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("concurrent"));
    }

    #[test]
    fn exposure_cap_enforced() {
        let m = manager_with(|r, _| {
            r.max_total_exposure_pct = 0.01; // 100 USD on a 10k bankroll
        });
        m.register_position("t1", "ETH/USD", TradeSide::Buy, 90.0, 3_000.0, 2_900.0);
        let decision = m.evaluate_trade(&intent(), 0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("exposure"));
    }

    #[test]
    fn drawdown_factor_tiers() {
        assert_eq!(drawdown_factor(0.0), 1.0);
        assert_eq!(drawdown_factor(3.0), 0.80);
        assert_eq!(drawdown_factor(6.0), 0.60);
        assert_eq!(drawdown_factor(12.0), 0.40);
    }

    #[test]
    fn risk_of_ruin_shape() {
        // No edge: certain ruin.
        assert_eq!(risk_of_ruin(0.4, 1.0, 0.02), 1.0);
        // Strong edge: tiny ruin probability.
        let strong = risk_of_ruin(0.6, 2.0, 0.02);
        assert!(strong < 0.001);
        // More risk per trade raises ruin odds.
        let cautious = risk_of_ruin(0.52, 1.5, 0.01);
        let aggressive = risk_of_ruin(0.52, 1.5, 0.10);
        assert!(aggressive > cautious);
    }

    #[test]
    fn sl_state_machine_via_manager() {
        let m = manager();
        m.register_position("t1", "BTC/USD", TradeSide::Buy, 400.0, 50_000.0, 49_000.0);

        // +2% activates breakeven (and trailing at +1.5%).
        let state = m.update_stop("t1", 51_000.0).unwrap();
        assert!(state.breakeven_activated);
        assert!(state.current_sl >= 50_000.0);

        m.remove_position("t1");
        assert!(m.update_stop("t1", 51_000.0).is_none());
    }

    #[test]
    fn report_reflects_state() {
        let m = manager();
        m.register_position("t1", "BTC/USD", TradeSide::Buy, 400.0, 50_000.0, 49_000.0);
        m.record_trade_close("ETH/USD", "trend", TradeSide::Buy, -100.0);

        let report = m.report(0.55, 2.0);
        assert_eq!(report.open_positions, 1);
        assert_eq!(report.total_exposure_usd, 400.0);
        assert_eq!(report.daily_pnl, -100.0);
        assert_eq!(report.consecutive_losses, 1);
        assert!(report.bankroll < report.initial_bankroll);
        assert!(report.current_drawdown_pct > 0.0);
        assert!(report.remaining_capacity_usd > 0.0);
    }

    #[test]
    fn strategy_cooldown_override() {
        let m = manager_with(|_, t| {
            t.cooldown_seconds = 300;
            t.strategy_cooldowns_seconds.insert("keltner".to_string(), 60);
        });
        let t0 = 1_700_000_000.0;
        m.record_trade_close_at("BTC/USD", "keltner", TradeSide::Buy, -5.0, t0);
        m.record_trade_close_at("BTC/USD", "trend", TradeSide::Buy, -5.0, t0);

        // Keltner clears after its 60s override; trend still cooling at 300s.
        assert!(m.is_on_cooldown_at("BTC/USD", "keltner", "buy", t0 + 30.0));
        assert!(!m.is_on_cooldown_at("BTC/USD", "keltner", "buy", t0 + 61.0));
        assert!(m.is_on_cooldown_at("BTC/USD", "trend", "buy", t0 + 200.0));
        assert!(!m.is_on_cooldown_at("BTC/USD", "trend", "buy", t0 + 301.0));
        // Different side never cooled.
        assert!(!m.is_on_cooldown_at("BTC/USD", "keltner", "sell", t0 + 30.0));
    }
}
