// =============================================================================
// Bot Engine — event loop, gating pipeline, circuit breakers
// =============================================================================
//
// The engine owns every long-lived loop:
//
//   1. Scan loop        pops pairs from the event queue, runs confluence,
//                       pushes qualifying signals through the gating pipeline
//   2. Position loop    fixed 2 s cadence over open trades
//   3. WS loop          venue stream ingestion (reconnects internally)
//   4. WS dispatch      parsed events -> cache updates -> scan queue
//   5. Candle poll      REST 1m bars for venues without OHLC push
//   6. Health monitor   staleness, WS state, circuit breakers
//   7. Cleanup          hourly retention + daily summary
//
// Each loop runs under the restart supervisor; critical loops that keep
// dying trip the auto-pause path instead of thrashing with positions open.

pub mod supervisor;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Timelike, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::confluence::ConfluenceSignal;
use crate::exchange::ws::{MarketEvent, WsClient};
use crate::execution::reconcile::BROKER_RECONCILE_INTERVAL_LOOPS;
use crate::ml::{blend_confidence, build_features, combine_models};
use crate::strategies::StrategySignal;
use crate::types::{normalize_pair, SignalDirection, TradeSide};
use supervisor::supervise;

/// Bars pulled per pair on each REST candle poll.
const CANDLE_POLL_BARS: usize = 5;
/// A pair with no bar update for this long is flagged by the health monitor.
const HEALTH_STALE_SECONDS: u64 = 600;
/// Fallback priors for Kelly sizing until the ledger has enough history.
const DEFAULT_WIN_RATE: f64 = 0.55;
const DEFAULT_WIN_LOSS_RATIO: f64 = 1.5;
const MIN_TRADES_FOR_STATS: u32 = 10;

pub struct BotEngine {
    state: Arc<AppState>,
    ws_client: Arc<WsClient>,
    ws_events: tokio::sync::Mutex<mpsc::Receiver<MarketEvent>>,
    stale_check_count: AtomicU32,
    ws_disconnected_since: Mutex<Option<Instant>>,
}

impl BotEngine {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(2048);
        let ws_client = Arc::new(WsClient::new(
            state.config.exchange.ws_url.clone(),
            state.config.effective_pairs(),
            state.config.exchange.order_book_depth,
            tx,
        ));
        Arc::new(Self {
            state,
            ws_client,
            ws_events: tokio::sync::Mutex::new(rx),
            stale_check_count: AtomicU32::new(0),
            ws_disconnected_since: Mutex::new(None),
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Seed the market-data cache from REST history for every pair.
    pub async fn warmup(&self) -> Result<()> {
        let pairs = self.state.config.effective_pairs();
        let warmup_bars = self.state.config.trading.warmup_bars;
        for pair in &pairs {
            match self.state.venue.get_ohlc(pair, 1, warmup_bars).await {
                Ok(bars) if !bars.is_empty() => {
                    let stored = self.state.market_data.warmup(pair, bars);
                    info!(pair = %pair, bars = stored, "pair warmed up");
                }
                Ok(_) => warn!(pair = %pair, "warmup returned no bars"),
                Err(e) if e.is_transient() => {
                    warn!(pair = %pair, error = %e, "warmup fetch failed (transient)");
                }
                Err(e) => {
                    return Err(anyhow::anyhow!(e))
                        .with_context(|| format!("warmup failed for {pair}"));
                }
            }
        }
        Ok(())
    }

    /// Startup broker reconciliation (live mode): adopt any broker position
    /// the ledger does not know about.
    pub async fn startup_reconcile(&self) {
        self.state.executor.reconcile_broker_positions("startup").await;
    }

    /// Spawn every supervised loop. Returns the join handles.
    pub fn spawn_all(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        macro_rules! spawn_loop {
            ($name:literal, $critical:expr) => {{
                let engine = self.clone();
                let running = self.state.running.clone();
                let pause_engine = self.clone();
                handles.push(tokio::spawn(async move {
                    supervise(
                        $name,
                        $critical,
                        running,
                        move |task_name| {
                            let engine = pause_engine.clone();
                            tokio::spawn(async move {
                                engine
                                    .auto_pause("task_failures", &format!("task={task_name}"))
                                    .await;
                            });
                        },
                        || {
                            let engine = engine.clone();
                            async move { engine.run_inner($name).await }
                        },
                    )
                    .await;
                }));
            }};
        }

        spawn_loop!("scan", true);
        spawn_loop!("position", true);
        spawn_loop!("ws", true);
        spawn_loop!("ws_dispatch", true);
        spawn_loop!("candle_poll", true);
        spawn_loop!("health", true);
        spawn_loop!("cleanup", false);

        handles
    }

    async fn run_inner(self: Arc<Self>, name: &'static str) -> Result<()> {
        match name {
            "scan" => self.run_scan_loop().await,
            "position" => self.run_position_loop().await,
            "ws" => self.run_ws_loop().await,
            "ws_dispatch" => self.run_ws_dispatch_loop().await,
            "candle_poll" => self.run_candle_poll_loop().await,
            "health" => self.run_health_loop().await,
            "cleanup" => self.run_cleanup_loop().await,
            other => anyhow::bail!("unknown task {other}"),
        }
    }

    // -------------------------------------------------------------------------
    // 1. Scan loop
    // -------------------------------------------------------------------------

    pub async fn run_scan_loop(&self) -> Result<()> {
        let scan_interval = Duration::from_secs(self.state.config.effective_scan_interval());
        info!(interval_s = scan_interval.as_secs(), "scan loop started");

        while self.state.is_running() {
            if self.state.is_paused() {
                tokio::time::sleep(scan_interval).await;
                continue;
            }

            // Hourly session-multiplier refresh, best-effort.
            if self.state.config.session.enabled && self.state.session.needs_refresh() {
                if let Ok(stats) = self.state.db.hourly_stats(None) {
                    self.state.session.refresh(&stats);
                }
            }

            let pairs = self.state.config.effective_pairs();
            let batch = self.state.scan_queue.collect(scan_interval, &pairs).await;
            if !self.state.is_running() {
                break;
            }

            let cycle_start = Instant::now();
            let signals = self.state.confluence.scan_pairs(&batch.pairs).await;
            let mut active = 0usize;
            for signal in signals {
                if signal.direction == SignalDirection::Neutral {
                    continue;
                }
                active += 1;
                if let Err(e) = self.process_signal(signal).await {
                    error!(error = %e, "signal processing failed");
                }
            }

            // Reconciliation cadence rides the scan loop.
            self.state.executor.reconcile_pending_opens().await;
            let scan_n = self.state.scan_count.fetch_add(1, Ordering::SeqCst) + 1;
            if scan_n % BROKER_RECONCILE_INTERVAL_LOOPS == 0 {
                self.state.executor.reconcile_broker_positions("periodic").await;
            }

            let cycle_ms = cycle_start.elapsed().as_millis() as f64;
            if scan_n % 10 == 0 || active > 0 {
                self.state.db.insert_metric("scan_cycle_ms", cycle_ms, None).ok();
                self.state
                    .db
                    .log_thought(
                        "system",
                        &format!(
                            "Scan #{scan_n} | {cycle_ms:.0}ms | signals: {active}/{} pairs",
                            batch.pairs.len()
                        ),
                        "debug",
                        None,
                        None,
                    )
                    .ok();
            }
            self.state.increment_version();
        }
        Ok(())
    }

    fn quiet_hours_active(&self) -> bool {
        let hour = Utc::now().hour();
        self.state.config.trading.quiet_hours_utc.contains(&hour)
    }

    /// Pre-trade gating pipeline for one confluence signal.
    pub async fn process_signal(&self, mut signal: ConfluenceSignal) -> Result<Option<String>> {
        if signal.direction == SignalDirection::Neutral || self.state.is_paused() {
            return Ok(None);
        }
        if self.quiet_hours_active() {
            debug!(pair = %signal.pair, "quiet hours; signal skipped");
            return Ok(None);
        }

        let ai_cfg = &self.state.config.ai;
        let real_votes = signal.real_directional_votes();

        // ── ML probability gate ─────────────────────────────────────────
        let spread = self.state.market_data.spread_pct(&signal.pair);
        let features = build_features(&signal, spread, Utc::now().hour());
        let base_ai = self.state.predictor.predict(&features);
        let online_ai = self.state.online_learner.predict_proba(&features);
        let ai_confidence =
            combine_models(base_ai, online_ai, self.state.predictor.is_model_loaded());

        let pre_blend = signal.confidence;
        signal.confidence = blend_confidence(pre_blend, ai_confidence, real_votes);

        self.state
            .db
            .log_thought(
                "analysis",
                &format!(
                    "{} | {} | confluence {}/{} | strength {:.2} | AI {:.2} | OBI {:+.3} | book {:+.3}{}",
                    signal.pair,
                    signal.direction,
                    signal.confluence_count,
                    self.state.confluence.strategy_names().len()
                        + usize::from(ai_cfg.obi_counts_as_confluence),
                    signal.strength,
                    ai_confidence,
                    signal.obi,
                    signal.book_score,
                    if signal.is_sure_fire { " | SURE FIRE" } else { "" },
                ),
                "info",
                Some(&json!({
                    "pre_blend_confidence": pre_blend,
                    "blended_confidence": signal.confidence,
                    "real_votes": real_votes,
                })),
                None,
            )
            .ok();

        // ── Vote / solo gates ───────────────────────────────────────────
        let min_confluence = self.state.config.effective_min_confluence();
        let (allow_keltner_solo, allow_any_solo) = self.state.config.solo_modes();
        let has_keltner = signal
            .signals
            .iter()
            .any(|s| s.direction == signal.direction && s.strategy_name == "keltner" && s.is_actionable());
        let keltner_solo_ok = allow_keltner_solo
            && has_keltner
            && real_votes == 1
            && signal.confidence >= ai_cfg.keltner_solo_min_confidence;
        let any_solo_ok =
            allow_any_solo && real_votes == 1 && signal.confidence >= ai_cfg.solo_min_confidence;

        let mut rejected_reason: Option<String> = None;
        if real_votes < min_confluence && !keltner_solo_ok && !any_solo_ok {
            rejected_reason = Some(format!("votes {real_votes} < {min_confluence}"));
        }

        // ── Confidence gate ─────────────────────────────────────────────
        let exec_confidence = self.state.config.effective_exec_confidence();
        if rejected_reason.is_none() && signal.confidence < exec_confidence {
            rejected_reason = Some(format!(
                "confidence {:.2} below {exec_confidence:.2}",
                signal.confidence
            ));
        }

        // ── Risk/reward gate ────────────────────────────────────────────
        if rejected_reason.is_none() {
            let sl_dist = (signal.entry_price - signal.stop_loss).abs();
            let tp_dist = (signal.take_profit - signal.entry_price).abs();
            if sl_dist > 0.0 && tp_dist > 0.0 && tp_dist / sl_dist < ai_cfg.min_risk_reward_ratio {
                rejected_reason = Some(format!(
                    "risk/reward {:.2} below {:.2}",
                    tp_dist / sl_dist,
                    ai_cfg.min_risk_reward_ratio
                ));
            }
        }

        // ── Spread / book freshness gate ────────────────────────────────
        let max_spread = self.state.config.trading.max_spread_pct;
        if rejected_reason.is_none() && max_spread > 0.0 {
            let book_age = self
                .state
                .market_data
                .order_book(&signal.pair)
                .map(|b| (now_unix() - b.updated_at).max(0.0))
                .unwrap_or(f64::MAX);
            let max_age = ai_cfg.book_score_max_age_seconds.max(1.0);
            if spread <= 0.0 || book_age > max_age || spread > max_spread {
                rejected_reason = Some(format!(
                    "spread gate (spread={spread:.5}, age={book_age:.0}s)"
                ));
            }
        }

        if let Some(reason) = rejected_reason {
            debug!(pair = %signal.pair, reason = %reason, "signal gated out");
            self.record_signal(&signal, ai_confidence, false);
            return Ok(None);
        }

        // ── Execute ─────────────────────────────────────────────────────
        let (win_rate, avg_ratio) = self.sizing_priors();
        let trade_id = self
            .state
            .executor
            .execute_signal(&signal, &features, win_rate, avg_ratio)
            .await?;
        self.record_signal(&signal, ai_confidence, trade_id.is_some());
        if let Some(id) = &trade_id {
            info!(trade_id = %id, pair = %signal.pair, direction = %signal.direction, "signal executed");
        }
        Ok(trade_id)
    }

    fn record_signal(&self, signal: &ConfluenceSignal, ai_confidence: f64, acted: bool) {
        let strategy = signal
            .signals
            .iter()
            .find(|s| s.direction == signal.direction)
            .map(|s| s.strategy_name.clone())
            .unwrap_or_else(|| "confluence".to_string());
        self.state
            .db
            .insert_signal(
                &signal.pair,
                &strategy,
                &signal.direction.to_string(),
                signal.strength,
                signal.confluence_count,
                ai_confidence,
                acted,
                &json!({
                    "confidence": signal.confidence,
                    "is_sure_fire": signal.is_sure_fire,
                    "regime": signal.regime,
                }),
                None,
            )
            .ok();
    }

    /// Win-rate / payoff priors for Kelly sizing: ledger stats once there is
    /// enough history, neutral priors before that.
    fn sizing_priors(&self) -> (f64, f64) {
        match self.state.db.performance_stats(None) {
            Ok(stats) if stats.total_trades >= MIN_TRADES_FOR_STATS => {
                (stats.win_rate, stats.avg_win_loss_ratio())
            }
            _ => (DEFAULT_WIN_RATE, DEFAULT_WIN_LOSS_RATIO),
        }
    }

    // -------------------------------------------------------------------------
    // 2. Position management loop
    // -------------------------------------------------------------------------

    pub async fn run_position_loop(&self) -> Result<()> {
        let interval = Duration::from_secs(
            self.state.config.trading.position_check_interval_seconds.max(1),
        );
        info!(interval_s = interval.as_secs(), "position management loop started");
        let mut ticker = tokio::time::interval(interval);
        while self.state.is_running() {
            ticker.tick().await;
            self.state.executor.manage_open_positions().await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // 3/4. WebSocket ingestion + dispatch
    // -------------------------------------------------------------------------

    pub async fn run_ws_loop(&self) -> Result<()> {
        self.ws_client.run(self.state.running.clone()).await;
        Ok(())
    }

    pub async fn run_ws_dispatch_loop(&self) -> Result<()> {
        let mut rx = self.ws_events.lock().await;
        while self.state.is_running() {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(event)) => self.dispatch_market_event(event),
                Ok(None) => return Ok(()), // channel closed on shutdown
                Err(_) => continue,
            }
        }
        Ok(())
    }

    fn dispatch_market_event(&self, event: MarketEvent) {
        match event {
            MarketEvent::Ticker { pair, price } => {
                let previous = self.state.market_data.latest_price(&pair);
                self.state.market_data.update_latest_close(&pair, price);
                if let Some(prev) = previous {
                    let move_pct = (price - prev).abs() / prev.max(1e-12);
                    if move_pct >= self.state.config.trading.event_price_move_pct {
                        self.state.scan_queue.enqueue(&pair, "price_move");
                    }
                }
            }
            MarketEvent::OhlcBar { pair, bar } => {
                if self.state.market_data.update_bar(&pair, bar) {
                    self.state.scan_queue.enqueue(&pair, "new_bar");
                }
            }
            MarketEvent::Book { pair, book } => {
                let analysis = crate::market_data::analyze_order_book(
                    &book,
                    self.state.config.ai.whale_threshold_usd,
                );
                self.state.market_data.update_order_book(&pair, book);
                self.state.market_data.update_order_book_analysis(&pair, analysis);
            }
            MarketEvent::Trade { pair, price, volume: _ } => {
                self.state.market_data.update_latest_close(&pair, price);
            }
        }
    }

    // -------------------------------------------------------------------------
    // 5. REST candle poll
    // -------------------------------------------------------------------------

    pub async fn run_candle_poll_loop(&self) -> Result<()> {
        let interval =
            Duration::from_secs(self.state.config.trading.candle_poll_seconds.clamp(30, 3600));
        info!(interval_s = interval.as_secs(), "candle poll loop started");
        let mut ticker = tokio::time::interval(interval);
        while self.state.is_running() {
            ticker.tick().await;
            for pair in self.state.config.effective_pairs() {
                match self.state.venue.get_ohlc(&pair, 1, CANDLE_POLL_BARS).await {
                    Ok(bars) => {
                        for bar in bars {
                            if self.state.market_data.update_bar(&pair, bar) {
                                self.state.scan_queue.enqueue(&pair, "rest_candle");
                            }
                        }
                    }
                    Err(e) if e.is_transient() => {
                        warn!(pair = %pair, error = %e, "candle poll failed (transient)");
                    }
                    Err(e) => {
                        warn!(pair = %pair, error = %e, "candle poll failed");
                    }
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // 6. Health monitor + circuit breakers
    // -------------------------------------------------------------------------

    pub async fn run_health_loop(&self) -> Result<()> {
        let interval =
            Duration::from_secs(self.state.config.monitoring.health_check_interval.max(5));
        info!(interval_s = interval.as_secs(), "health monitor started");
        let mut ticker = tokio::time::interval(interval);
        while self.state.is_running() {
            ticker.tick().await;

            self.state
                .ws_connected
                .store(self.ws_client.is_connected(), Ordering::SeqCst);

            let stale_pairs: Vec<String> = self
                .state
                .config
                .effective_pairs()
                .into_iter()
                .filter(|p| self.state.market_data.is_stale(p, HEALTH_STALE_SECONDS))
                .collect();

            if !stale_pairs.is_empty() {
                warn!(pairs = ?stale_pairs, "stale market data detected");
                for pair in &stale_pairs {
                    if let Ok(bars) = self.state.venue.get_ohlc(pair, 1, 120).await {
                        if !bars.is_empty() {
                            self.state.market_data.warmup(pair, bars);
                        }
                    }
                }
            }

            self.apply_circuit_breakers(&stale_pairs).await;

            self.state
                .db
                .insert_metric("uptime_seconds", self.state.uptime_seconds() as f64, None)
                .ok();
            self.state
                .db
                .insert_metric(
                    "open_positions",
                    self.state.risk.open_position_count() as f64,
                    None,
                )
                .ok();
        }
        Ok(())
    }

    /// Evaluate every auto-pause condition; each transition is idempotent.
    pub async fn apply_circuit_breakers(&self, stale_pairs: &[String]) {
        let mon = self.state.config.monitoring.clone();

        // Stale-data breaker: N consecutive unhealthy ticks.
        if mon.auto_pause_on_stale_data {
            let count = if stale_pairs.is_empty() {
                self.stale_check_count.store(0, Ordering::SeqCst);
                0
            } else {
                self.stale_check_count.fetch_add(1, Ordering::SeqCst) + 1
            };
            let threshold = mon.stale_data_pause_after_checks.max(1);
            if !stale_pairs.is_empty() && count >= threshold {
                let detail = format!("pairs={}", stale_pairs.join(","));
                self.auto_pause("stale_data", &detail).await;
            }
        }

        // WS-disconnect breaker: continuous downtime.
        if mon.auto_pause_on_ws_disconnect {
            let connected = self.ws_client.is_connected();
            let trip = {
                let mut since = self.ws_disconnected_since.lock();
                if connected {
                    *since = None;
                    false
                } else {
                    let started = since.get_or_insert_with(Instant::now);
                    started.elapsed().as_secs() >= mon.ws_disconnect_pause_after_seconds.max(1)
                }
            };
            if trip {
                self.auto_pause(
                    "ws_disconnected",
                    &format!(">{}s", mon.ws_disconnect_pause_after_seconds),
                )
                .await;
            }
        }

        // Loss-streak breaker.
        if mon.auto_pause_on_consecutive_losses {
            let losses = self.state.risk.consecutive_losses();
            let threshold = mon.consecutive_losses_pause_threshold.max(1);
            if losses >= threshold {
                self.auto_pause(
                    "consecutive_losses",
                    &format!("{losses} consecutive losses (threshold={threshold})"),
                )
                .await;
            }
        }

        // Drawdown breaker.
        if mon.auto_pause_on_drawdown {
            let drawdown = self.state.risk.current_drawdown_pct();
            let threshold = mon.drawdown_pause_pct.max(0.1);
            if drawdown >= threshold {
                self.auto_pause(
                    "drawdown_limit",
                    &format!("drawdown={drawdown:.2}% threshold={threshold:.2}%"),
                )
                .await;
            }
        }
    }

    /// Idempotent transition to paused trading with audit + notification.
    pub async fn auto_pause(&self, reason: &str, detail: &str) {
        if self.state.trading_paused.swap(true, Ordering::SeqCst) {
            return; // already paused
        }
        *self.state.auto_pause_reason.write() = Some(reason.to_string());

        let message = if detail.is_empty() {
            format!("AUTO-PAUSE: {reason}")
        } else {
            format!("AUTO-PAUSE: {reason} | {detail}")
        };
        warn!(reason, detail, "trading auto-paused");
        self.state
            .db
            .log_thought("system", &message, "warning", None, None)
            .ok();
        self.state.notifier.notify_all(&message).await;
        self.state.increment_version();

        if self.state.config.monitoring.emergency_close_on_auto_pause {
            match self
                .state
                .executor
                .close_all_positions(&format!("auto_pause:{reason}"))
                .await
            {
                Ok(closed) if closed > 0 => {
                    self.state
                        .db
                        .log_thought(
                            "system",
                            &format!("AUTO-PAUSE emergency close: {closed} positions closed"),
                            "warning",
                            None,
                            None,
                        )
                        .ok();
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "emergency close failed"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // 7. Cleanup loop
    // -------------------------------------------------------------------------

    pub async fn run_cleanup_loop(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        while self.state.is_running() {
            ticker.tick().await;
            self.state
                .db
                .cleanup_old_data(self.state.config.monitoring.metrics_retention_hours)?;
            self.state.db.update_daily_summary(None).ok();
            // Ship (and in this build, discard) buffered analytics docs.
            let shipped = self.state.mirror.drain(500).len();
            if shipped > 0 {
                debug!(shipped, "analytics docs drained");
            }
            info!("cleanup pass completed");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Operator control surface
    // -------------------------------------------------------------------------

    pub async fn operator_pause(&self, reason: &str) {
        if !self.state.trading_paused.swap(true, Ordering::SeqCst) {
            *self.state.auto_pause_reason.write() = Some(format!("operator:{reason}"));
            self.state
                .db
                .log_thought("system", &format!("Trading PAUSED by operator: {reason}"), "warning", None, None)
                .ok();
            self.state.increment_version();
        }
    }

    pub async fn operator_resume(&self) {
        if self.state.trading_paused.swap(false, Ordering::SeqCst) {
            *self.state.auto_pause_reason.write() = None;
            self.stale_check_count.store(0, Ordering::SeqCst);
            self.state
                .db
                .log_thought("system", "Trading RESUMED by operator", "info", None, None)
                .ok();
            self.state.increment_version();
        }
    }

    pub async fn operator_close_all(&self, reason: &str) -> Result<usize> {
        self.state.executor.close_all_positions(reason).await
    }

    /// Close everything, then stop the engine.
    pub async fn operator_kill(&self) -> Result<usize> {
        let closed = self.state.executor.close_all_positions("kill").await?;
        self.state
            .db
            .log_thought("system", &format!("KILL: {closed} positions closed, stopping engine"), "critical", None, None)
            .ok();
        self.state.running.store(false, Ordering::SeqCst);
        Ok(closed)
    }

    // -------------------------------------------------------------------------
    // External signals (webhook path)
    // -------------------------------------------------------------------------

    /// Execute a verified external signal by injecting a synthetic one-vote
    /// confluence into the executor. The webhook layer has already verified
    /// the HMAC, timestamp, and event_id idempotency.
    pub async fn execute_external_signal(
        &self,
        payload: &serde_json::Value,
        source: &str,
    ) -> Result<String> {
        if self.state.is_paused() {
            anyhow::bail!("trading paused");
        }

        let pair = payload["pair"]
            .as_str()
            .map(|p| normalize_pair(&p.replace('-', "/")))
            .filter(|p| !p.is_empty())
            .context("pair is required")?;
        let known = self.state.config.effective_pairs();
        if !known.iter().any(|p| p == &pair) {
            anyhow::bail!("pair not configured: {pair}");
        }

        let direction_raw = payload["direction"].as_str().unwrap_or_default();
        let side = TradeSide::parse(direction_raw)
            .context("direction must be long/short or buy/sell")?;
        let direction = match side {
            TradeSide::Buy => SignalDirection::Long,
            TradeSide::Sell => SignalDirection::Short,
        };

        let market_price = self.state.market_data.latest_price(&pair).unwrap_or(0.0);
        let entry_price = payload["entry_price"].as_f64().unwrap_or(market_price);
        if entry_price <= 0.0 {
            anyhow::bail!("entry_price missing and no market price available");
        }

        let ai_cfg = &self.state.config.ai;
        let confidence = payload["confidence"]
            .as_f64()
            .unwrap_or(ai_cfg.min_confidence)
            .clamp(0.0, 1.0);
        let strength = payload["strength"].as_f64().unwrap_or(confidence).clamp(0.0, 1.0);
        let confluence_count = payload["confluence_count"]
            .as_u64()
            .unwrap_or(ai_cfg.confluence_threshold.max(2) as u64)
            .max(1) as usize;

        // Derive SL/TP when omitted.
        let stop_pct = payload["stop_pct"].as_f64().unwrap_or(0.01).max(0.001);
        let rr = payload["risk_reward"]
            .as_f64()
            .unwrap_or(ai_cfg.min_risk_reward_ratio.max(1.2))
            .max(1.0);
        let mut stop_loss = payload["stop_loss"].as_f64().unwrap_or(0.0);
        let mut take_profit = payload["take_profit"].as_f64().unwrap_or(0.0);
        if stop_loss <= 0.0 {
            stop_loss = match side {
                TradeSide::Buy => entry_price * (1.0 - stop_pct),
                TradeSide::Sell => entry_price * (1.0 + stop_pct),
            };
        }
        if take_profit <= 0.0 {
            let tp_pct = stop_pct * rr;
            take_profit = match side {
                TradeSide::Buy => entry_price * (1.0 + tp_pct),
                TradeSide::Sell => entry_price * (1.0 - tp_pct),
            };
        }

        let strategy_name = payload["strategy"]
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("external_{source}"));
        let provider = payload["provider"].as_str().unwrap_or_default();

        let strategy_signal = StrategySignal::new(
            &strategy_name,
            &pair,
            direction,
            strength,
            confidence,
            entry_price,
            stop_loss,
            take_profit,
            json!({ "external": true, "source": source, "provider": provider }),
        );
        let mut signal = ConfluenceSignal::neutral(&pair);
        signal.direction = direction;
        signal.strength = strength;
        signal.confidence = confidence;
        signal.confluence_count = confluence_count;
        signal.entry_price = entry_price;
        signal.stop_loss = stop_loss;
        signal.take_profit = take_profit;
        signal.signals = vec![strategy_signal];

        let spread = self.state.market_data.spread_pct(&pair);
        let features = build_features(&signal, spread, Utc::now().hour());
        let (win_rate, avg_ratio) = self.sizing_priors();
        let trade_id = self
            .state
            .executor
            .execute_signal(&signal, &features, win_rate, avg_ratio)
            .await?
            .context("signal rejected by risk/execution")?;

        self.state
            .db
            .log_thought(
                "signal",
                &format!("External signal executed | {pair} {direction} | source={source}"),
                "info",
                Some(&json!({ "source": source, "provider": provider, "trade_id": trade_id })),
                None,
            )
            .ok();
        Ok(trade_id)
    }

    // -------------------------------------------------------------------------
    // Read surface
    // -------------------------------------------------------------------------

    pub fn status_snapshot(&self) -> serde_json::Value {
        let stats = self.state.db.performance_stats(None).unwrap_or_default();
        let report = self
            .state
            .risk
            .report(stats.win_rate.max(0.01), stats.avg_win_loss_ratio());
        json!({
            "mode": self.state.config.app.mode.to_string(),
            "running": self.state.is_running(),
            "trading_paused": self.state.is_paused(),
            "pause_reason": self.state.auto_pause_reason.read().clone(),
            "uptime_seconds": self.state.uptime_seconds(),
            "scan_count": self.state.scan_count.load(Ordering::SeqCst),
            "state_version": self.state.state_version.load(Ordering::SeqCst),
            "pairs": self.state.config.effective_pairs(),
            "canary_mode": self.state.config.trading.canary_mode,
            "ws_connected": self.state.ws_connected.load(Ordering::SeqCst),
            "pending_opens": self.state.executor.pending_open_count(),
            "rejected_orders": self.state.executor.rejected_order_count(),
            "mirror": {
                "buffered": self.state.mirror.buffered(),
                "dropped_docs": self.state.mirror.dropped_docs(),
            },
            "risk": report,
            "performance": stats,
            "strategies": self.state.confluence.strategy_stats(),
            "online_model": self.state.online_learner.stats(),
        })
    }

    /// Graceful shutdown: stop loops, close clients, persist models.
    pub async fn shutdown(&self) {
        self.state.running.store(false, Ordering::SeqCst);
        self.state.online_learner.force_save();
        info!("engine shutdown flag set");
    }
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::test_support::test_state;
    use crate::market_data::OrderBookSnapshot;
    use crate::strategies::StrategySignal;

    fn fresh_book(engine: &BotEngine, pair: &str) {
        let book = OrderBookSnapshot {
            bids: vec![(49_999.0, 5.0), (49_998.0, 4.0)],
            asks: vec![(50_001.0, 5.0), (50_002.0, 4.0)],
            updated_at: now_unix(),
        };
        let analysis = crate::market_data::analyze_order_book(&book, 50_000.0);
        engine.state.market_data.update_order_book(pair, book);
        engine.state.market_data.update_order_book_analysis(pair, analysis);
        engine.state.market_data.update_ticker(pair, 50_000.0);
    }

    fn executable_signal(pair: &str, votes: usize) -> ConfluenceSignal {
        let mut signal = ConfluenceSignal::neutral(pair);
        signal.direction = SignalDirection::Long;
        signal.strength = 0.85;
        signal.confidence = 0.85;
        signal.confluence_count = votes;
        signal.entry_price = 50_000.0;
        signal.stop_loss = 49_000.0;
        signal.take_profit = 52_000.0;
        signal.regime = "trend".to_string();
        signal.volatility_regime = "mid_vol".to_string();
        for name in ["keltner", "trend", "ichimoku", "supertrend"].iter().take(votes) {
            signal.signals.push(StrategySignal::new(
                name,
                pair,
                SignalDirection::Long,
                0.7,
                0.7,
                50_000.0,
                49_000.0,
                52_000.0,
                json!({}),
            ));
        }
        signal
    }

    #[tokio::test]
    async fn pipeline_executes_qualified_signal() {
        let (state, _) = test_state(|c| {
            c.trading.cooldown_seconds = 0;
        });
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");

        let trade_id = engine
            .process_signal(executable_signal("BTC/USD", 3))
            .await
            .unwrap();
        assert!(trade_id.is_some(), "3 real votes at high confidence should execute");

        let open = engine.state.db.get_open_trades(None, None).unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn pipeline_rejects_insufficient_votes() {
        let (state, _) = test_state(|_| {});
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");

        let trade_id = engine
            .process_signal(executable_signal("BTC/USD", 1))
            .await
            .unwrap();
        assert!(trade_id.is_none());
        assert!(engine.state.db.get_open_trades(None, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn solo_mode_allows_single_keltner_vote() {
        let (state, _) = test_state(|c| {
            c.ai.allow_keltner_solo = true;
            c.ai.keltner_solo_min_confidence = 0.5;
            c.trading.cooldown_seconds = 0;
        });
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");

        let trade_id = engine
            .process_signal(executable_signal("BTC/USD", 1))
            .await
            .unwrap();
        assert!(trade_id.is_some(), "keltner solo should pass with permission on");
    }

    #[tokio::test]
    async fn pipeline_rejects_missing_book_when_spread_gated() {
        let (state, _) = test_state(|_| {});
        let engine = BotEngine::new(state);
        // No order book at all: the spread gate fails closed.
        let trade_id = engine
            .process_signal(executable_signal("BTC/USD", 3))
            .await
            .unwrap();
        assert!(trade_id.is_none());
    }

    #[tokio::test]
    async fn pipeline_rejects_low_confidence() {
        let (state, _) = test_state(|_| {});
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");

        let mut signal = executable_signal("BTC/USD", 3);
        signal.confidence = 0.30;
        let trade_id = engine.process_signal(signal).await.unwrap();
        assert!(trade_id.is_none());
    }

    #[tokio::test]
    async fn pipeline_rejects_poor_risk_reward() {
        let (state, _) = test_state(|_| {});
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");

        let mut signal = executable_signal("BTC/USD", 3);
        signal.take_profit = 50_100.0; // RR 0.1 vs a 1000-point stop
        let trade_id = engine.process_signal(signal).await.unwrap();
        assert!(trade_id.is_none());
    }

    #[tokio::test]
    async fn quiet_hours_block_trading() {
        let (state, _) = test_state(|c| {
            c.trading.quiet_hours_utc = (0..24).collect();
        });
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");

        let trade_id = engine
            .process_signal(executable_signal("BTC/USD", 3))
            .await
            .unwrap();
        assert!(trade_id.is_none());
    }

    #[tokio::test]
    async fn stale_data_breaker_pauses_once() {
        // Threshold of 1: a single stale health tick trips the breaker.
        let (state, _) = test_state(|c| {
            c.monitoring.stale_data_pause_after_checks = 1;
        });
        let engine = BotEngine::new(state);

        engine
            .apply_circuit_breakers(&["BTC/USD".to_string()])
            .await;
        assert!(engine.state.is_paused());
        assert_eq!(
            engine.state.auto_pause_reason.read().as_deref(),
            Some("stale_data")
        );

        // A second trip is idempotent: still exactly one AUTO-PAUSE thought.
        engine
            .apply_circuit_breakers(&["BTC/USD".to_string()])
            .await;
        let thoughts = engine.state.db.get_thoughts(50).unwrap();
        let pauses = thoughts
            .iter()
            .filter(|t| t.message.contains("AUTO-PAUSE: stale_data"))
            .count();
        assert_eq!(pauses, 1);
    }

    #[tokio::test]
    async fn consecutive_loss_breaker_trips() {
        let (state, _) = test_state(|c| {
            c.monitoring.consecutive_losses_pause_threshold = 2;
        });
        let engine = BotEngine::new(state);
        engine
            .state
            .risk
            .record_trade_close("BTC/USD", "trend", TradeSide::Buy, -10.0);
        engine
            .state
            .risk
            .record_trade_close("ETH/USD", "trend", TradeSide::Buy, -10.0);

        engine.apply_circuit_breakers(&[]).await;
        assert!(engine.state.is_paused());
        assert_eq!(
            engine.state.auto_pause_reason.read().as_deref(),
            Some("consecutive_losses")
        );
    }

    #[tokio::test]
    async fn operator_resume_clears_pause() {
        let (state, _) = test_state(|c| {
            c.monitoring.stale_data_pause_after_checks = 1;
        });
        let engine = BotEngine::new(state);
        engine.apply_circuit_breakers(&["BTC/USD".to_string()]).await;
        assert!(engine.state.is_paused());

        engine.operator_resume().await;
        assert!(!engine.state.is_paused());
        assert!(engine.state.auto_pause_reason.read().is_none());
    }

    #[tokio::test]
    async fn paused_engine_skips_signals() {
        let (state, _) = test_state(|_| {});
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");
        engine.operator_pause("test").await;

        let trade_id = engine
            .process_signal(executable_signal("BTC/USD", 3))
            .await
            .unwrap();
        assert!(trade_id.is_none());
    }

    #[tokio::test]
    async fn kill_closes_positions_and_stops() {
        let (state, _) = test_state(|c| {
            c.trading.cooldown_seconds = 0;
        });
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");
        engine
            .process_signal(executable_signal("BTC/USD", 3))
            .await
            .unwrap()
            .expect("position opens");

        let closed = engine.operator_kill().await.unwrap();
        assert_eq!(closed, 1);
        assert!(!engine.state.is_running());
        assert!(engine.state.db.get_open_trades(None, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_signal_executes() {
        let (state, _) = test_state(|c| {
            c.trading.cooldown_seconds = 0;
        });
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");

        let payload = json!({
            "pair": "BTC/USD",
            "direction": "long",
            "confidence": 0.8,
            "entry_price": 50_000.0,
            "stop_loss": 49_000.0,
            "take_profit": 52_000.0,
            "event_id": "evt_1",
        });
        let trade_id = engine.execute_external_signal(&payload, "webhook").await.unwrap();
        assert!(!trade_id.is_empty());
        let trade = engine.state.db.get_trade(&trade_id).unwrap().unwrap();
        assert_eq!(trade.pair, "BTC/USD");
    }

    #[tokio::test]
    async fn external_signal_rejects_unknown_pair() {
        let (state, _) = test_state(|_| {});
        let engine = BotEngine::new(state);
        let payload = json!({ "pair": "DOGE/JPY", "direction": "long" });
        let err = engine.execute_external_signal(&payload, "webhook").await.unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn external_signal_derives_levels() {
        let (state, _) = test_state(|c| {
            c.trading.cooldown_seconds = 0;
        });
        let engine = BotEngine::new(state);
        fresh_book(&engine, "BTC/USD");

        let payload = json!({
            "pair": "BTC/USD",
            "direction": "buy",
            "stop_pct": 0.02,
            "risk_reward": 2.0,
        });
        let trade_id = engine.execute_external_signal(&payload, "webhook").await.unwrap();
        let trade = engine.state.db.get_trade(&trade_id).unwrap().unwrap();
        // Entry from the ticker; SL 2% under; TP 4% over.
        assert!(trade.stop_loss < trade.entry_price);
        assert!(trade.take_profit > trade.entry_price);
    }

    #[tokio::test]
    async fn status_snapshot_shape() {
        let (state, _) = test_state(|_| {});
        let engine = BotEngine::new(state);
        let status = engine.status_snapshot();
        assert_eq!(status["mode"], "paper");
        assert_eq!(status["trading_paused"], false);
        assert!(status["risk"]["bankroll"].as_f64().unwrap() > 0.0);
        assert!(status["strategies"].as_array().unwrap().len() == 9);
    }

    #[tokio::test]
    async fn market_event_dispatch_enqueues_on_new_bar() {
        let (state, _) = test_state(|_| {});
        let engine = BotEngine::new(state);
        // Warm the pair so bars append.
        let bars: Vec<crate::market_data::Bar> = (0..20)
            .map(|i| crate::market_data::Bar {
                time: i as f64 * 60.0,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 5.0,
                vwap: 100.0,
            })
            .collect();
        engine.state.market_data.warmup("BTC/USD", bars);

        engine.dispatch_market_event(MarketEvent::OhlcBar {
            pair: "BTC/USD".to_string(),
            bar: crate::market_data::Bar {
                time: 20.0 * 60.0,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 5.0,
                vwap: 100.2,
            },
        });

        let batch = engine
            .state
            .scan_queue
            .collect(Duration::from_secs(1), &["FALLBACK".to_string()])
            .await;
        assert!(batch.from_events);
        assert_eq!(batch.pairs, vec!["BTC/USD".to_string()]);
    }

    #[tokio::test]
    async fn ticker_move_enqueues_scan() {
        let (state, _) = test_state(|_| {});
        let engine = BotEngine::new(state);
        engine.state.market_data.update_ticker("BTC/USD", 100.0);

        // 1% move with a 0.5% threshold.
        engine.dispatch_market_event(MarketEvent::Ticker {
            pair: "BTC/USD".to_string(),
            price: 101.0,
        });
        let batch = engine
            .state
            .scan_queue
            .collect(Duration::from_secs(1), &["FALLBACK".to_string()])
            .await;
        assert!(batch.from_events);
    }
}
