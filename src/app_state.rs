// =============================================================================
// Central Application State — the wiring hub
// =============================================================================
//
// One struct ties every subsystem together behind Arcs. Subsystems manage
// their own interior mutability; AppState adds the cross-cutting flags
// (running, trading paused) and the version counter the read surfaces use.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::info;

use crate::config::BotConfig;
use crate::confluence::session::SessionAnalyzer;
use crate::confluence::ConfluenceDetector;
use crate::exchange::VenueAdapter;
use crate::execution::TradeExecutor;
use crate::market_data::{MarketDataCache, ScanQueue};
use crate::ml::{BatchPredictor, OnlineLearner, FEATURE_NAMES};
use crate::notify::NotifierRegistry;
use crate::persistence::{AnalyticsMirror, Database};
use crate::risk::RiskManager;

pub struct AppState {
    pub config: BotConfig,

    // ── Cross-cutting flags ─────────────────────────────────────────────
    pub running: Arc<AtomicBool>,
    pub trading_paused: Arc<AtomicBool>,
    pub auto_pause_reason: RwLock<Option<String>>,
    pub ws_connected: Arc<AtomicBool>,

    // ── Version / timing ────────────────────────────────────────────────
    pub state_version: AtomicU64,
    pub scan_count: AtomicU64,
    pub start_time: Instant,

    // ── Subsystems ──────────────────────────────────────────────────────
    pub market_data: Arc<MarketDataCache>,
    pub scan_queue: Arc<ScanQueue>,
    pub db: Arc<Database>,
    pub mirror: Arc<AnalyticsMirror>,
    pub risk: Arc<RiskManager>,
    pub confluence: Arc<ConfluenceDetector>,
    pub predictor: Arc<BatchPredictor>,
    pub online_learner: Arc<OnlineLearner>,
    pub session: Arc<SessionAnalyzer>,
    pub executor: Arc<TradeExecutor>,
    pub venue: Arc<dyn VenueAdapter>,
    pub notifier: Arc<NotifierRegistry>,
}

impl AppState {
    /// Wire every subsystem from a loaded config and a venue adapter.
    pub fn build(config: BotConfig, venue: Arc<dyn VenueAdapter>) -> Result<Arc<Self>> {
        let trading_paused = Arc::new(AtomicBool::new(false));

        let db = Arc::new(
            Database::open(&config.db_path, &config.tenant_id)
                .context("canonical database unavailable")?,
        );
        let mirror = Arc::new(AnalyticsMirror::default());

        let warmup_ready = config.trading.warmup_bars.min(100).max(1);
        let market_data = Arc::new(MarketDataCache::new(
            config.trading.warmup_bars + 240,
            warmup_ready,
        ));
        let scan_queue = Arc::new(ScanQueue::new());

        let session = Arc::new(SessionAnalyzer::new(
            config.session.min_trades_per_hour,
            config.session.max_boost,
            config.session.max_penalty,
        ));

        let confluence = Arc::new(ConfluenceDetector::new(
            market_data.clone(),
            &config,
            config.session.enabled.then(|| session.clone()),
        ));

        let risk = Arc::new(RiskManager::new(
            config.risk.clone(),
            config.trading.clone(),
            config.ai.min_risk_reward_ratio,
            config.effective_max_position_usd(),
            config.effective_max_risk_per_trade(),
            trading_paused.clone(),
        ));

        // Cooldown predicate: the risk manager's bookkeeping feeds the
        // confluence detector through a small closure handle, never an
        // ownership cycle.
        {
            let risk_for_cooldown = risk.clone();
            confluence.set_cooldown_checker(Arc::new(move |pair, strategy, side| {
                risk_for_cooldown.is_on_cooldown(pair, strategy, side)
            }));
        }

        let predictor = Arc::new(BatchPredictor::load(
            &config.ai.batch_model_path,
            &config.ai.normalization_path,
        ));
        let online_learner = Arc::new(OnlineLearner::new(
            config.ai.online_model_path.clone(),
            FEATURE_NAMES,
            config.ai.min_updates_before_predict,
            25,
        ));

        let executor = Arc::new(TradeExecutor::new(
            config.clone(),
            venue.clone(),
            db.clone(),
            risk.clone(),
            market_data.clone(),
            mirror.clone(),
            confluence.clone(),
            online_learner.clone(),
        ));

        let notifier = Arc::new(NotifierRegistry::from_urls(&config.notify.webhook_urls));

        info!(
            mode = %config.app.mode,
            pairs = ?config.effective_pairs(),
            canary = config.trading.canary_mode,
            "application state built"
        );

        Ok(Arc::new(Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
            trading_paused,
            auto_pause_reason: RwLock::new(None),
            ws_connected: Arc::new(AtomicBool::new(false)),
            state_version: AtomicU64::new(1),
            scan_count: AtomicU64::new(0),
            start_time: Instant::now(),
            market_data,
            scan_queue,
            db,
            mirror,
            risk,
            confluence,
            predictor,
            online_learner,
            session,
            executor,
            venue,
            notifier,
        }))
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.trading_paused.load(Ordering::SeqCst)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_state;
    use std::sync::atomic::Ordering;

    #[test]
    fn build_wires_subsystems() {
        let (state, _) = test_state(|_| {});
        assert!(state.is_running());
        assert!(!state.is_paused());
        assert_eq!(state.confluence.strategy_names().len(), 9);
        assert_eq!(state.risk.open_position_count(), 0);
    }

    #[test]
    fn version_counter_increments() {
        let (state, _) = test_state(|_| {});
        let v0 = state.state_version.load(Ordering::SeqCst);
        state.increment_version();
        assert_eq!(state.state_version.load(Ordering::SeqCst), v0 + 1);
    }

    #[test]
    fn pause_flag_shared_with_risk_manager() {
        let (state, _) = test_state(|_| {});
        state.trading_paused.store(true, Ordering::SeqCst);
        let intent = crate::risk::TradeIntent {
            pair: "BTC/USD".to_string(),
            side: crate::types::TradeSide::Buy,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: 104.0,
            win_rate: 0.55,
            avg_win_loss_ratio: 2.0,
            confidence: 0.7,
        };
        let decision = state.risk.evaluate_trade(&intent, 0);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("paused"));
    }
}
