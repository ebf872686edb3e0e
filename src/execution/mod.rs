// =============================================================================
// Trade Executor — opens, manages and closes positions (paper + live)
// =============================================================================
//
// Paper mode fills instantly at market with the configured slippage. Live
// mode submits real orders (market by default, limit + chase when
// configured) and reconciles anything that does not fill immediately.
//
// The executor owns open trades; stop-loss state lives in the risk manager;
// the canonical record of both is the trades table.

pub mod reconcile;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::Value;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BotConfig;
use crate::confluence::{ConfluenceDetector, ConfluenceSignal};
use crate::exchange::{
    round_quantity, OrderRequest, OrderState, OrderType, VenueAdapter, VenueError,
};
use crate::market_data::MarketDataCache;
use crate::ml::OnlineLearner;
use crate::persistence::{AnalyticsMirror, Database, TradeRecord};
use crate::risk::{RiskManager, TradeIntent};
use crate::types::{EngineMode, TradeSide, TradeStatus};

/// How long the open path polls for a fill before handing the order to the
/// pending-open reconciler.
const FILL_POLL_DEADLINE: Duration = Duration::from_secs(10);
const FILL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A submitted live buy with no local open row yet.
#[derive(Debug, Clone)]
pub struct PendingOpen {
    pub order_id: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub submit_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub strategy: String,
    pub confidence: f64,
    pub created_ts: f64,
    pub metadata: serde_json::Value,
}

pub struct TradeExecutor {
    pub(crate) mode: EngineMode,
    pub(crate) config: BotConfig,
    pub(crate) venue: Arc<dyn VenueAdapter>,
    pub(crate) db: Arc<Database>,
    pub(crate) risk: Arc<RiskManager>,
    pub(crate) market_data: Arc<MarketDataCache>,
    pub(crate) mirror: Arc<AnalyticsMirror>,
    pub(crate) confluence: Arc<ConfluenceDetector>,
    pub(crate) online_learner: Arc<OnlineLearner>,
    pub(crate) pending_opens: Mutex<HashMap<String, PendingOpen>>,
    pub(crate) rejected_orders: AtomicU64,
}

impl TradeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BotConfig,
        venue: Arc<dyn VenueAdapter>,
        db: Arc<Database>,
        risk: Arc<RiskManager>,
        market_data: Arc<MarketDataCache>,
        mirror: Arc<AnalyticsMirror>,
        confluence: Arc<ConfluenceDetector>,
        online_learner: Arc<OnlineLearner>,
    ) -> Self {
        Self {
            mode: config.app.mode,
            config,
            venue,
            db,
            risk,
            market_data,
            mirror,
            confluence,
            online_learner,
            pending_opens: Mutex::new(HashMap::new()),
            rejected_orders: AtomicU64::new(0),
        }
    }

    fn tenant(&self) -> &str {
        &self.config.tenant_id
    }

    fn fee_per_side(&self) -> f64 {
        self.config.exchange.taker_fee
    }

    // -------------------------------------------------------------------------
    // Open flow
    // -------------------------------------------------------------------------

    /// Execute an approved confluence signal. Returns the new trade id, or
    /// None when the trade was rejected anywhere along the way.
    pub async fn execute_signal(
        &self,
        signal: &ConfluenceSignal,
        features: &HashMap<String, f64>,
        win_rate: f64,
        avg_win_loss_ratio: f64,
    ) -> Result<Option<String>> {
        let Some(side) = signal.direction.side() else {
            return Ok(None);
        };

        // Spot execution path: shorts are rejected unless the venue is
        // flagged as supporting them. The signal itself is still recorded.
        if side == TradeSide::Sell && !self.config.exchange.supports_short {
            debug!(pair = %signal.pair, "short signal rejected on spot venue");
            return Ok(None);
        }

        // One open trade per (tenant, pair, side).
        let open = self
            .db
            .get_open_trades(Some(&signal.pair), Some(self.tenant()))
            .context("failed to check open trades")?;
        if open.iter().any(|t| t.side == side) {
            debug!(pair = %signal.pair, "open trade already exists for this side");
            return Ok(None);
        }
        if self.pending_opens.lock().contains_key(&signal.pair) {
            debug!(pair = %signal.pair, "pending open already in flight");
            return Ok(None);
        }

        let intent = TradeIntent {
            pair: signal.pair.clone(),
            side,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            win_rate,
            avg_win_loss_ratio,
            confidence: signal.confidence,
        };

        let hour_ago = (chrono::Utc::now() - chrono::Duration::hours(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let sql_hour_count = self
            .db
            .count_trades_since(&hour_ago, Some(self.tenant()))
            .unwrap_or(0);

        let decision = self.risk.evaluate_trade(&intent, sql_hour_count);
        if !decision.allowed {
            info!(pair = %signal.pair, reason = %decision.reason, "trade denied by risk manager");
            self.db
                .log_thought(
                    "risk",
                    &format!("Trade denied | {} {} | {}", signal.pair, side, decision.reason),
                    "info",
                    None,
                    Some(self.tenant()),
                )
                .ok();
            return Ok(None);
        }

        let quantity = round_quantity(
            decision.size_usd / signal.entry_price,
            self.venue.quantity_precision(&signal.pair),
        );
        if quantity < self.venue.min_quantity(&signal.pair) {
            debug!(pair = %signal.pair, quantity, "quantity below venue minimum");
            return Ok(None);
        }

        let trade_id = format!("mrd-{}", Uuid::new_v4());
        let strategy = primary_strategy_name(signal);
        let metadata = json!({
            "confluence_count": signal.confluence_count,
            "is_sure_fire": signal.is_sure_fire,
            "regime": signal.regime,
            "volatility_regime": signal.volatility_regime,
            "obi": signal.obi,
            "book_score": signal.book_score,
            "size_usd": decision.size_usd,
        });

        let fill_price = match self.mode {
            EngineMode::Paper => self.paper_fill_price(signal.entry_price, side),
            EngineMode::Live => {
                match self
                    .live_open(signal, side, quantity, &trade_id, &strategy, &metadata)
                    .await?
                {
                    Some(price) => price,
                    None => return Ok(None), // pending or rejected
                }
            }
        };

        // Preserve the intended risk distance: shift SL/TP by the fill
        // deviation from the planned entry.
        let shift = fill_price - signal.entry_price;
        let stop_loss = signal.stop_loss + shift;
        let take_profit = signal.take_profit + shift;

        self.record_open(
            &trade_id,
            &signal.pair,
            side,
            fill_price,
            quantity,
            &strategy,
            signal.confidence,
            stop_loss,
            take_profit,
            decision.size_usd,
            metadata,
            features,
        )?;
        Ok(Some(trade_id))
    }

    fn paper_fill_price(&self, entry: f64, side: TradeSide) -> f64 {
        // Simulated fills pay the spread: buys fill above, sells below.
        entry * (1.0 + side.sign() * self.config.slippage_pct)
    }

    /// Live submission: market by default; limit + chase when configured.
    /// Returns the fill price, or None when the order is pending (tracked
    /// for reconciliation) or terminally rejected.
    async fn live_open(
        &self,
        signal: &ConfluenceSignal,
        side: TradeSide,
        quantity: f64,
        trade_id: &str,
        strategy: &str,
        metadata: &serde_json::Value,
    ) -> Result<Option<f64>> {
        let exchange = &self.config.exchange;
        let use_limit = exchange.post_only || exchange.limit_chase_attempts > 0;

        let mut last_status: Option<crate::exchange::OrderStatus> = None;

        if use_limit {
            let tick = self.venue.price_tick(&signal.pair);
            let mut price = signal.entry_price;
            for attempt in 0..exchange.limit_chase_attempts.max(1) {
                let request = OrderRequest {
                    pair: signal.pair.clone(),
                    side,
                    order_type: OrderType::Limit,
                    quantity,
                    price: Some(price),
                    client_order_id: Some(trade_id.to_string()),
                    post_only: exchange.post_only,
                };
                match self.venue.submit_order(&request).await {
                    Ok(status) => {
                        tokio::time::sleep(Duration::from_secs_f64(
                            exchange.limit_chase_delay_seconds.max(0.5),
                        ))
                        .await;
                        match self.venue.get_order(&signal.pair, &status.order_id).await {
                            Ok(polled) if polled.state == OrderState::Filled => {
                                return Ok(Some(polled.average_price.unwrap_or(price)));
                            }
                            Ok(polled) => {
                                // Not filled yet: cancel and chase one tick
                                // toward the market.
                                self.venue
                                    .cancel_order(&signal.pair, &status.order_id)
                                    .await
                                    .ok();
                                last_status = Some(polled);
                                price += side.sign() * tick;
                                debug!(
                                    pair = %signal.pair,
                                    attempt,
                                    new_price = price,
                                    "limit chase: repricing"
                                );
                            }
                            Err(e) => {
                                warn!(error = %e, "limit chase poll failed");
                                last_status = Some(status);
                                break;
                            }
                        }
                    }
                    Err(VenueError::Permanent(msg)) => {
                        self.rejected_orders.fetch_add(1, Ordering::Relaxed);
                        warn!(pair = %signal.pair, error = %msg, "limit order rejected");
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if !exchange.limit_fallback_to_market {
                // Give the last submitted order to the reconciler if it is
                // still live.
                if let Some(status) = last_status {
                    if !status.state.is_terminal() {
                        self.track_pending(signal, side, quantity, trade_id, strategy, metadata, &status.order_id);
                    }
                }
                return Ok(None);
            }
        }

        // Market order (default path or limit fallback).
        let request = OrderRequest {
            pair: signal.pair.clone(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            client_order_id: Some(trade_id.to_string()),
            post_only: false,
        };
        let status = match self.venue.submit_order(&request).await {
            Ok(status) => status,
            Err(VenueError::Permanent(msg)) => {
                self.rejected_orders.fetch_add(1, Ordering::Relaxed);
                warn!(pair = %signal.pair, error = %msg, "market order rejected");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        // Poll for the fill up to a short deadline.
        let deadline = tokio::time::Instant::now() + FILL_POLL_DEADLINE;
        loop {
            match self.venue.get_order(&signal.pair, &status.order_id).await {
                Ok(polled) if polled.state == OrderState::Filled => {
                    let price = polled.average_price.unwrap_or(signal.entry_price);
                    return Ok(Some(price));
                }
                Ok(polled) if polled.state.is_terminal() => {
                    self.rejected_orders.fetch_add(1, Ordering::Relaxed);
                    warn!(pair = %signal.pair, state = ?polled.state, "order terminal without fill");
                    return Ok(None);
                }
                Ok(_) | Err(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                // Fill never confirmed: remember it and let reconciliation
                // settle the truth.
                self.track_pending(signal, side, quantity, trade_id, strategy, metadata, &status.order_id);
                return Ok(None);
            }
            tokio::time::sleep(FILL_POLL_INTERVAL).await;
        }
    }

    fn track_pending(
        &self,
        signal: &ConfluenceSignal,
        side: TradeSide,
        quantity: f64,
        _trade_id: &str,
        strategy: &str,
        metadata: &serde_json::Value,
        order_id: &str,
    ) {
        info!(pair = %signal.pair, order_id, "open pending fill; tracked for reconciliation");
        self.pending_opens.lock().insert(
            signal.pair.clone(),
            PendingOpen {
                order_id: order_id.to_string(),
                side,
                quantity,
                submit_price: signal.entry_price,
                stop_loss: signal.stop_loss,
                take_profit: signal.take_profit,
                strategy: strategy.to_string(),
                confidence: signal.confidence,
                created_ts: unix_now(),
                metadata: metadata.clone(),
            },
        );
    }

    /// Persist the open trade, capture ML features, register with risk, and
    /// emit the mirror event.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record_open(
        &self,
        trade_id: &str,
        pair: &str,
        side: TradeSide,
        fill_price: f64,
        quantity: f64,
        strategy: &str,
        confidence: f64,
        stop_loss: f64,
        take_profit: f64,
        size_usd: f64,
        metadata: serde_json::Value,
        features: &HashMap<String, f64>,
    ) -> Result<()> {
        let trade = TradeRecord::open(
            trade_id,
            self.tenant(),
            pair,
            side,
            fill_price,
            quantity,
            strategy,
            confidence,
            stop_loss,
            take_profit,
            metadata,
        );
        self.db.insert_trade(&trade).context("failed to persist open trade")?;

        // Feature row keyed by trade_id; label stays NULL until close.
        let feature_json = serde_json::to_value(features).unwrap_or(json!({}));
        self.db
            .insert_ml_features(pair, &feature_json, trade_id, Some(self.tenant()))
            .ok();

        self.risk
            .register_position(trade_id, pair, side, size_usd, fill_price, stop_loss);

        self.mirror.write_trade_event(
            "opened",
            trade_id,
            pair,
            json!({
                "side": side.as_str(),
                "entry_price": fill_price,
                "quantity": quantity,
                "stop_loss": stop_loss,
                "take_profit": take_profit,
                "strategy": strategy,
            }),
        );

        self.db
            .log_thought(
                "trade",
                &format!(
                    "OPENED {pair} {side} @ {fill_price:.4} qty={quantity:.6} SL={stop_loss:.4} TP={take_profit:.4}"
                ),
                "info",
                None,
                Some(self.tenant()),
            )
            .ok();

        info!(trade_id, pair, %side, fill_price, quantity, "position opened");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Position management
    // -------------------------------------------------------------------------

    /// One management pass over all open trades: refresh trailing stops and
    /// evaluate exits. Called every position_check_interval seconds.
    pub async fn manage_open_positions(&self) -> Result<()> {
        let open = self
            .db
            .get_open_trades(None, Some(self.tenant()))
            .context("failed to read open trades")?;
        if open.is_empty() {
            return Ok(());
        }

        for trade in open {
            let Some(price) = self.market_data.latest_price(&trade.pair) else {
                continue;
            };
            if price <= 0.0 {
                continue;
            }

            // Recovery path: after a restart the risk registry is empty but
            // the ledger still has the row.
            if self.risk.stop_state(&trade.trade_id).is_none() {
                let effective_sl = trade.trailing_stop.unwrap_or(trade.stop_loss);
                self.risk.register_position(
                    &trade.trade_id,
                    &trade.pair,
                    trade.side,
                    trade.entry_price * trade.quantity,
                    trade.entry_price,
                    effective_sl,
                );
            }

            let before = self.risk.stop_state(&trade.trade_id);
            let state = self.risk.update_stop(&trade.trade_id, price);
            let Some(state) = state else { continue };

            // Persist SL movement so a crash cannot forget a raised stop.
            let moved = before.map_or(true, |b| (b.current_sl - state.current_sl).abs() > f64::EPSILON);
            if moved {
                self.db
                    .update_trade(
                        &trade.trade_id,
                        &[
                            ("stop_loss", Value::Real(state.current_sl)),
                            (
                                "trailing_stop",
                                if state.trailing_activated {
                                    Value::Real(state.current_sl)
                                } else {
                                    Value::Null
                                },
                            ),
                        ],
                        Some(self.tenant()),
                    )
                    .ok();
            }

            // Exit checks: stop first, then target.
            let stop_hit = state.stop_hit(price);
            let tp_hit = trade.take_profit > 0.0
                && match trade.side {
                    TradeSide::Buy => price >= trade.take_profit,
                    TradeSide::Sell => price <= trade.take_profit,
                };

            if stop_hit {
                let reason = if state.trailing_activated {
                    "trailing_stop"
                } else if state.breakeven_activated {
                    "breakeven_stop"
                } else {
                    "stop_loss"
                };
                self.close_trade(&trade.trade_id, price, reason, false).await?;
            } else if tp_hit {
                self.close_trade(&trade.trade_id, price, "take_profit", false).await?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Close flow
    // -------------------------------------------------------------------------

    /// Close one trade at `exit_price`. Idempotent: closing an already
    /// closed trade is a no-op returning false.
    pub async fn close_trade(
        &self,
        trade_id: &str,
        exit_price: f64,
        reason: &str,
        force: bool,
    ) -> Result<bool> {
        let Some(trade) = self.db.get_trade(trade_id).context("failed to read trade")? else {
            return Ok(false);
        };
        if trade.status != TradeStatus::Open {
            debug!(trade_id, status = %trade.status, "close requested on non-open trade");
            return Ok(false);
        }

        // Live mode sends the opposite-side market order first.
        if self.mode == EngineMode::Live {
            let opposite = match trade.side {
                TradeSide::Buy => TradeSide::Sell,
                TradeSide::Sell => TradeSide::Buy,
            };
            let request = OrderRequest {
                pair: trade.pair.clone(),
                side: opposite,
                order_type: OrderType::Market,
                quantity: trade.quantity,
                price: None,
                client_order_id: Some(format!("{trade_id}-close")),
                post_only: false,
            };
            if let Err(e) = self.venue.submit_order(&request).await {
                if force {
                    warn!(trade_id, error = %e, "close order failed; forcing local close");
                } else {
                    return Err(anyhow::anyhow!("close order failed: {e}"));
                }
            }
        }

        let entry_notional = trade.entry_price * trade.quantity;
        let exit_notional = exit_price * trade.quantity;
        let fees = (entry_notional + exit_notional) * self.fee_per_side();
        let slippage = (entry_notional + exit_notional) * self.config.slippage_pct;
        let gross = (exit_price - trade.entry_price) * trade.quantity * trade.side.sign();
        let pnl = gross - fees - slippage;
        let pnl_pct = if entry_notional > 0.0 {
            pnl / entry_notional * 100.0
        } else {
            0.0
        };

        let closed = self
            .db
            .close_trade(trade_id, exit_price, pnl, pnl_pct, fees, slippage, Some(self.tenant()))
            .context("failed to persist close")?;
        if !closed {
            return Ok(false);
        }

        self.risk.remove_position(trade_id);
        self.risk
            .record_trade_close(&trade.pair, &trade.strategy, trade.side, pnl);

        // Strategy performance + runtime guardrail.
        let regime = trade.metadata["regime"].as_str().unwrap_or("");
        let vol_regime = trade.metadata["volatility_regime"].as_str().unwrap_or("");
        self.confluence
            .record_trade_result(&trade.strategy, pnl, regime, vol_regime);

        // Feed the online learner asynchronously; the label was written in
        // the close transaction.
        if let Ok(Some((features, Some(label)))) = self.db.get_ml_features_for_trade(trade_id) {
            if let Some(map) = features.as_object() {
                let features: HashMap<String, f64> = map
                    .iter()
                    .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                    .collect();
                let learner = self.online_learner.clone();
                tokio::spawn(async move {
                    learner.update(&features, label);
                });
            }
        }

        self.mirror.write_trade_event(
            "closed",
            trade_id,
            &trade.pair,
            json!({
                "exit_price": exit_price,
                "pnl": pnl,
                "pnl_pct": pnl_pct,
                "fees": fees,
                "slippage": slippage,
                "reason": reason,
            }),
        );
        self.db
            .log_thought(
                "trade",
                &format!(
                    "CLOSED {} {} @ {exit_price:.4} pnl={pnl:.2} ({reason})",
                    trade.pair, trade.side
                ),
                if pnl >= 0.0 { "info" } else { "warning" },
                None,
                Some(self.tenant()),
            )
            .ok();

        info!(trade_id, pair = %trade.pair, pnl, reason, "position closed");
        Ok(true)
    }

    /// Close every open position. Returns the number closed.
    pub async fn close_all_positions(&self, reason: &str) -> Result<usize> {
        let open = self
            .db
            .get_open_trades(None, Some(self.tenant()))
            .context("failed to read open trades")?;
        let mut closed = 0;
        for trade in open {
            let price = self
                .market_data
                .latest_price(&trade.pair)
                .unwrap_or(trade.entry_price);
            if self.close_trade(&trade.trade_id, price, reason, true).await? {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, reason, "close-all executed");
        }
        Ok(closed)
    }

    pub fn rejected_order_count(&self) -> u64 {
        self.rejected_orders.load(Ordering::Relaxed)
    }

    pub fn pending_open_count(&self) -> usize {
        self.pending_opens.lock().len()
    }
}

/// The strongest real strategy vote names the trade's strategy.
fn primary_strategy_name(signal: &ConfluenceSignal) -> String {
    signal
        .signals
        .iter()
        .filter(|s| s.direction == signal.direction && s.strategy_name != crate::confluence::ORDER_BOOK_STRATEGY)
        .max_by(|a, b| a.strength.partial_cmp(&b.strength).unwrap_or(std::cmp::Ordering::Equal))
        .map(|s| s.strategy_name.clone())
        .unwrap_or_else(|| "confluence".to_string())
}

pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
