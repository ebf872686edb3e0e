// =============================================================================
// Broker Reconciliation — pending opens and broker-truth positions
// =============================================================================
//
// Live trading can crash between order submit and ledger insert, or an order
// can fill after the open path gave up polling. Two recovery paths close the
// gap:
//
//   * Pending opens: every submitted-but-unconfirmed order is remembered per
//     symbol and re-checked each scan tick until it fills, dies, or times
//     out (15 minutes with no broker position = give up).
//   * Broker truth: periodically (and once at startup) the venue's reported
//     positions are compared with local open rows. A broker long with no
//     local row is materialized from broker numbers; a quantity mismatch is
//     logged loudly.

use rusqlite::types::Value as SqlValue;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{unix_now, PendingOpen, TradeExecutor};
use crate::exchange::OrderState;
use crate::types::{EngineMode, TradeSide};

/// Broker-truth reconciliation runs every N scan loops.
pub const BROKER_RECONCILE_INTERVAL_LOOPS: u64 = 4;

/// Give up on a pending order after this long without a fill or a broker
/// position.
const PENDING_GIVE_UP_SECONDS: f64 = 900.0;

/// Relative quantity mismatch worth shouting about.
const QTY_MISMATCH_TOLERANCE: f64 = 1e-6;

impl TradeExecutor {
    /// Re-check every pending open against the local ledger, broker
    /// positions, and the order itself.
    pub async fn reconcile_pending_opens(&self) {
        if self.mode != EngineMode::Live {
            self.pending_opens.lock().clear();
            return;
        }
        let snapshot: Vec<(String, PendingOpen)> = {
            let pending = self.pending_opens.lock();
            pending.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        if snapshot.is_empty() {
            return;
        }

        let broker_positions = self.venue.list_open_positions().await.unwrap_or_default();

        for (pair, pending) in snapshot {
            // 1. A local open row appeared (another path already settled it).
            let local_open = self
                .db
                .get_open_trades(Some(&pair), Some(&self.config.tenant_id))
                .unwrap_or_default();
            if local_open.iter().any(|t| t.side == pending.side) {
                self.pending_opens.lock().remove(&pair);
                continue;
            }

            // 2. Broker already shows the position: materialize from truth.
            if let Some(broker) = broker_positions
                .iter()
                .find(|p| p.pair.eq_ignore_ascii_case(&pair) && p.quantity > 0.0)
            {
                let entry = if broker.avg_entry_price > 0.0 {
                    broker.avg_entry_price
                } else {
                    pending.submit_price
                };
                if self
                    .materialize_from_broker(&pair, broker.quantity, entry, "pending_reconcile", Some(&pending))
                    .is_ok()
                {
                    self.pending_opens.lock().remove(&pair);
                }
                continue;
            }

            // 3. Ask the venue about the order itself.
            match self.venue.get_order(&pair, &pending.order_id).await {
                Ok(status) if status.state == OrderState::Filled => {
                    let fill = status.average_price.unwrap_or(pending.submit_price);
                    let qty = if status.filled_quantity > 0.0 {
                        status.filled_quantity
                    } else {
                        pending.quantity
                    };
                    if self
                        .materialize_from_broker(&pair, qty, fill, "order_filled", Some(&pending))
                        .is_ok()
                    {
                        self.pending_opens.lock().remove(&pair);
                    }
                }
                Ok(status) if status.state.is_terminal() => {
                    // Rejected or cancelled: forget it.
                    warn!(pair = %pair, order_id = %pending.order_id, state = ?status.state,
                          "pending open died at the venue");
                    self.rejected_orders.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.pending_opens.lock().remove(&pair);
                }
                Ok(_) => {
                    // Still live: time it out eventually.
                    if unix_now() - pending.created_ts > PENDING_GIVE_UP_SECONDS {
                        warn!(pair = %pair, order_id = %pending.order_id,
                              "pending open timed out with no fill and no broker position");
                        self.venue.cancel_order(&pair, &pending.order_id).await.ok();
                        self.pending_opens.lock().remove(&pair);
                    }
                }
                Err(e) => {
                    warn!(pair = %pair, error = %e, "pending open query failed");
                    if unix_now() - pending.created_ts > PENDING_GIVE_UP_SECONDS {
                        self.pending_opens.lock().remove(&pair);
                    }
                }
            }
        }
    }

    /// Compare broker positions with local open rows. `source` tags the log
    /// line ("startup" or "periodic").
    pub async fn reconcile_broker_positions(&self, source: &str) {
        if self.mode != EngineMode::Live {
            return;
        }
        let broker_positions = match self.venue.list_open_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(source, error = %e, "broker position fetch failed");
                return;
            }
        };

        let mut materialized = 0usize;
        let mut mismatched = 0usize;

        for broker in &broker_positions {
            if broker.quantity <= 0.0 {
                continue;
            }
            let local = self
                .db
                .get_open_trades(Some(&broker.pair), Some(&self.config.tenant_id))
                .unwrap_or_default();
            match local.iter().find(|t| t.side == TradeSide::Buy) {
                None => {
                    let entry = if broker.avg_entry_price > 0.0 {
                        broker.avg_entry_price
                    } else {
                        self.market_data.latest_price(&broker.pair).unwrap_or(0.0)
                    };
                    if entry <= 0.0 {
                        warn!(pair = %broker.pair, "cannot materialize broker position without a price");
                        continue;
                    }
                    if self
                        .materialize_from_broker(&broker.pair, broker.quantity, entry, source, None)
                        .is_ok()
                    {
                        materialized += 1;
                    }
                }
                Some(local_trade) => {
                    let rel = (local_trade.quantity - broker.quantity).abs()
                        / broker.quantity.max(1e-12);
                    if rel > QTY_MISMATCH_TOLERANCE {
                        mismatched += 1;
                        warn!(
                            pair = %broker.pair,
                            local_qty = local_trade.quantity,
                            broker_qty = broker.quantity,
                            "quantity mismatch between ledger and broker"
                        );
                        // Broker truth wins for the managed quantity.
                        self.db
                            .update_trade(
                                &local_trade.trade_id,
                                &[("quantity", SqlValue::Real(broker.quantity))],
                                Some(&self.config.tenant_id),
                            )
                            .ok();
                    }
                }
            }
        }

        if materialized > 0 || mismatched > 0 {
            info!(source, materialized, mismatched, "broker reconciliation applied");
            self.db
                .log_thought(
                    "system",
                    &format!(
                        "Broker reconcile ({source}): materialized={materialized} mismatched={mismatched}"
                    ),
                    "warning",
                    None,
                    Some(&self.config.tenant_id),
                )
                .ok();
        }
    }

    /// Create a local open row from broker-reported numbers. The crash
    /// recovery path after submit-then-die.
    pub(crate) fn materialize_from_broker(
        &self,
        pair: &str,
        quantity: f64,
        entry_price: f64,
        source: &str,
        pending: Option<&PendingOpen>,
    ) -> anyhow::Result<()> {
        let trade_id = format!("reconciled-{}", Uuid::new_v4());

        // Risk levels: the pending intent when we have it, else a
        // conservative 1% stop with the configured R:R.
        let (stop_loss, take_profit, strategy, confidence) = match pending {
            Some(p) => {
                let shift = entry_price - p.submit_price;
                (
                    p.stop_loss + shift,
                    p.take_profit + shift,
                    p.strategy.clone(),
                    p.confidence,
                )
            }
            None => {
                let rr = self.config.ai.min_risk_reward_ratio.max(1.2);
                (
                    entry_price * 0.99,
                    entry_price * (1.0 + 0.01 * rr),
                    "reconciled".to_string(),
                    0.5,
                )
            }
        };

        let metadata = match pending {
            Some(p) => {
                let mut m = p.metadata.clone();
                if let Some(obj) = m.as_object_mut() {
                    obj.insert("reconciled_from".to_string(), json!(source));
                }
                m
            }
            None => json!({ "reconciled_from": source }),
        };

        self.record_open(
            &trade_id,
            pair,
            TradeSide::Buy,
            entry_price,
            quantity,
            &strategy,
            confidence,
            stop_loss,
            take_profit,
            quantity * entry_price,
            metadata,
            &std::collections::HashMap::new(),
        )?;

        info!(
            pair,
            trade_id = %trade_id,
            quantity,
            entry_price,
            source,
            "open position materialized from broker truth"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::exchange::{OrderStatus, VenuePosition};
    use crate::types::{EngineMode, TradeStatus};

    fn live_harness() -> Harness {
        harness(|c| {
            c.app.mode = EngineMode::Live;
        })
    }

    fn pending(order_id: &str, price: f64) -> PendingOpen {
        PendingOpen {
            order_id: order_id.to_string(),
            side: TradeSide::Buy,
            quantity: 0.01,
            submit_price: price,
            stop_loss: price * 0.98,
            take_profit: price * 1.04,
            strategy: "keltner".to_string(),
            confidence: 0.7,
            created_ts: unix_now(),
            metadata: json!({"regime": "trend"}),
        }
    }

    #[tokio::test]
    async fn paper_mode_clears_pending() {
        let h = harness(|_| {});
        h.executor
            .pending_opens
            .lock()
            .insert("BTC/USD".to_string(), pending("ord-1", 50_000.0));
        h.executor.reconcile_pending_opens().await;
        assert_eq!(h.executor.pending_open_count(), 0);
    }

    #[tokio::test]
    async fn pending_materializes_from_broker_position() {
        let h = live_harness();
        h.executor
            .pending_opens
            .lock()
            .insert("BTC/USD".to_string(), pending("ord-x", 50_000.0));
        h.venue.positions.write().push(VenuePosition {
            pair: "BTC/USD".to_string(),
            quantity: 0.01,
            avg_entry_price: 50_050.0,
        });

        h.executor.reconcile_pending_opens().await;

        assert_eq!(h.executor.pending_open_count(), 0);
        let open = h.executor.db.get_open_trades(None, None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].quantity, 0.01);
        assert_eq!(open[0].entry_price, 50_050.0);
        // SL shifted by the fill deviation (+50).
        assert!((open[0].stop_loss - (50_000.0 * 0.98 + 50.0)).abs() < 1e-6);
        assert_eq!(open[0].metadata["reconciled_from"], "pending_reconcile");
    }

    #[tokio::test]
    async fn pending_materializes_from_filled_order() {
        let h = live_harness();
        h.venue.order_states.write().insert(
            "ord-y".to_string(),
            OrderStatus {
                order_id: "ord-y".to_string(),
                state: crate::exchange::OrderState::Filled,
                filled_quantity: 0.02,
                average_price: Some(50_100.0),
            },
        );
        h.executor
            .pending_opens
            .lock()
            .insert("BTC/USD".to_string(), pending("ord-y", 50_000.0));

        h.executor.reconcile_pending_opens().await;

        assert_eq!(h.executor.pending_open_count(), 0);
        let open = h.executor.db.get_open_trades(None, None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entry_price, 50_100.0);
        assert_eq!(open[0].quantity, 0.02);
    }

    #[tokio::test]
    async fn pending_dropped_when_order_terminal() {
        let h = live_harness();
        h.venue.order_states.write().insert(
            "ord-z".to_string(),
            OrderStatus {
                order_id: "ord-z".to_string(),
                state: crate::exchange::OrderState::Rejected,
                filled_quantity: 0.0,
                average_price: None,
            },
        );
        h.executor
            .pending_opens
            .lock()
            .insert("BTC/USD".to_string(), pending("ord-z", 50_000.0));

        h.executor.reconcile_pending_opens().await;

        assert_eq!(h.executor.pending_open_count(), 0);
        assert!(h.executor.db.get_open_trades(None, None).unwrap().is_empty());
        assert_eq!(h.executor.rejected_order_count(), 1);
    }

    #[tokio::test]
    async fn pending_gives_up_after_timeout() {
        let h = live_harness();
        h.venue.order_states.write().insert(
            "ord-t".to_string(),
            OrderStatus {
                order_id: "ord-t".to_string(),
                state: crate::exchange::OrderState::Open,
                filled_quantity: 0.0,
                average_price: None,
            },
        );
        let mut stale = pending("ord-t", 50_000.0);
        stale.created_ts = unix_now() - 1_000.0; // past the 15-minute window
        h.executor
            .pending_opens
            .lock()
            .insert("BTC/USD".to_string(), stale);

        h.executor.reconcile_pending_opens().await;
        assert_eq!(h.executor.pending_open_count(), 0);
        assert!(h.executor.db.get_open_trades(None, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn startup_reconcile_materializes_unknown_position() {
        let h = live_harness();
        h.venue.positions.write().push(VenuePosition {
            pair: "ETH/USD".to_string(),
            quantity: 0.5,
            avg_entry_price: 3_000.0,
        });

        h.executor.reconcile_broker_positions("startup").await;

        let open = h.executor.db.get_open_trades(None, None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].pair, "ETH/USD");
        assert_eq!(open[0].strategy, "reconciled");
        assert_eq!(open[0].status, TradeStatus::Open);
        // Conservative default stop 1% below broker entry.
        assert!((open[0].stop_loss - 2_970.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn qty_mismatch_adopts_broker_truth() {
        let h = live_harness();
        // Local row says 0.5, broker says 0.4.
        h.executor
            .materialize_from_broker("ETH/USD", 0.5, 3_000.0, "test", None)
            .unwrap();
        h.venue.positions.write().push(VenuePosition {
            pair: "ETH/USD".to_string(),
            quantity: 0.4,
            avg_entry_price: 3_000.0,
        });

        h.executor.reconcile_broker_positions("periodic").await;

        let open = h.executor.db.get_open_trades(None, None).unwrap();
        assert_eq!(open.len(), 1);
        assert!((open[0].quantity - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn matching_position_left_alone() {
        let h = live_harness();
        h.executor
            .materialize_from_broker("ETH/USD", 0.5, 3_000.0, "test", None)
            .unwrap();
        h.venue.positions.write().push(VenuePosition {
            pair: "ETH/USD".to_string(),
            quantity: 0.5,
            avg_entry_price: 3_000.0,
        });

        h.executor.reconcile_broker_positions("periodic").await;
        let open = h.executor.db.get_open_trades(None, None).unwrap();
        assert_eq!(open.len(), 1);
        assert!((open[0].quantity - 0.5).abs() < 1e-9);
    }
}
