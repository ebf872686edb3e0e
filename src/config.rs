// =============================================================================
// Bot Configuration — every tunable knob, serde-defaulted, env-overridable
// =============================================================================
//
// All fields carry serde defaults so that older config files keep loading
// after new fields are added. Environment variables prefixed MERIDIAN_
// override file values; a value that fails to coerce is logged and the file
// value kept. Saves use the atomic tmp + rename pattern.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::EngineMode;

// =============================================================================
// Default-value helpers (required by the serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_pairs() -> Vec<String> {
    vec![
        "BTC/USD".to_string(),
        "ETH/USD".to_string(),
        "SOL/USD".to_string(),
        "XRP/USD".to_string(),
        "ADA/USD".to_string(),
    ]
}

fn default_timeframes() -> Vec<u32> {
    vec![1]
}

fn d_u32_1() -> u32 {
    1
}

fn d_scan_interval() -> u64 {
    60
}

fn d_position_check_interval() -> u64 {
    2
}

fn d_candle_poll() -> u64 {
    60
}

fn d_warmup_bars() -> usize {
    500
}

fn d_max_concurrent_positions() -> usize {
    5
}

fn d_cooldown_seconds() -> u64 {
    300
}

fn d_event_price_move_pct() -> f64 {
    0.005
}

fn d_max_spread_pct() -> f64 {
    0.002
}

fn d_canary_max_pairs() -> usize {
    2
}

fn d_canary_max_position_usd() -> f64 {
    100.0
}

fn d_canary_max_risk() -> f64 {
    0.005
}

fn d_canary_min_confidence() -> f64 {
    0.68
}

fn d_canary_min_confluence() -> usize {
    3
}

fn d_canary_scan_interval() -> u64 {
    60
}

fn d_rate_limit_rps() -> f64 {
    15.0
}

fn d_max_retries() -> u32 {
    5
}

fn d_retry_base_delay() -> f64 {
    1.0
}

fn d_timeout_seconds() -> u64 {
    30
}

fn d_maker_fee() -> f64 {
    0.0016
}

fn d_taker_fee() -> f64 {
    0.0026
}

fn d_limit_chase_attempts() -> u32 {
    2
}

fn d_limit_chase_delay() -> f64 {
    2.0
}

fn d_exchange_name() -> String {
    "kraken".to_string()
}

fn d_rest_url() -> String {
    "https://api.kraken.com".to_string()
}

fn d_ws_url() -> String {
    "wss://ws.kraken.com/v2".to_string()
}

fn d_order_book_depth() -> usize {
    25
}

fn d_confluence_threshold() -> usize {
    3
}

fn d_min_confidence() -> f64 {
    0.65
}

fn d_min_rr() -> f64 {
    0.9
}

fn d_keltner_solo_min() -> f64 {
    0.60
}

fn d_solo_min() -> f64 {
    0.65
}

fn d_obi_threshold() -> f64 {
    0.15
}

fn d_book_score_threshold() -> f64 {
    0.2
}

fn d_book_score_max_age() -> f64 {
    5.0
}

fn d_whale_threshold() -> f64 {
    50_000.0
}

fn d_guard_min_trades() -> usize {
    20
}

fn d_guard_window() -> usize {
    30
}

fn d_guard_min_wr() -> f64 {
    0.35
}

fn d_guard_min_pf() -> f64 {
    0.85
}

fn d_guard_disable_minutes() -> u64 {
    120
}

fn d_min_updates_before_predict() -> usize {
    50
}

fn d_batch_model_path() -> String {
    "models/trade_predictor.json".to_string()
}

fn d_normalization_path() -> String {
    "models/normalization.json".to_string()
}

fn d_online_model_path() -> String {
    "models/online_sgd.json".to_string()
}

fn d_session_min_trades() -> u32 {
    5
}

fn d_session_max_boost() -> f64 {
    1.15
}

fn d_session_max_penalty() -> f64 {
    0.70
}

fn d_adx_trend_threshold() -> f64 {
    25.0
}

fn d_atr_pct_high() -> f64 {
    0.02
}

fn d_atr_pct_low() -> f64 {
    0.008
}

fn d_max_risk_per_trade() -> f64 {
    0.02
}

fn d_max_daily_loss() -> f64 {
    0.05
}

fn d_max_position_usd() -> f64 {
    500.0
}

fn d_initial_bankroll() -> f64 {
    10_000.0
}

fn d_atr_mult_sl() -> f64 {
    2.0
}

fn d_atr_mult_tp() -> f64 {
    3.0
}

fn d_trailing_activation() -> f64 {
    0.015
}

fn d_trailing_step() -> f64 {
    0.005
}

fn d_breakeven_activation() -> f64 {
    0.01
}

fn d_kelly_fraction() -> f64 {
    0.25
}

fn d_max_kelly_size() -> f64 {
    0.10
}

fn d_risk_of_ruin_threshold() -> f64 {
    0.01
}

fn d_max_total_exposure_pct() -> f64 {
    0.50
}

fn d_global_cooldown_on_loss() -> u64 {
    1800
}

fn d_health_check_interval() -> u64 {
    60
}

fn d_metrics_retention_hours() -> u64 {
    72
}

fn d_stale_pause_checks() -> u32 {
    3
}

fn d_ws_disconnect_pause_secs() -> u64 {
    300
}

fn d_consecutive_losses_pause() -> u32 {
    4
}

fn d_drawdown_pause_pct() -> f64 {
    8.0
}

fn d_db_path() -> String {
    "data/trading.db".to_string()
}

fn d_lock_path() -> String {
    "data/instance.lock".to_string()
}

fn d_tenant_id() -> String {
    "default".to_string()
}

fn d_slippage_pct() -> f64 {
    0.0005
}

fn d_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn d_max_skew() -> u64 {
    300
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: EngineMode,
    #[serde(default = "d_tenant_id")]
    pub account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "d_exchange_name")]
    pub name: String,
    #[serde(default = "d_rest_url")]
    pub rest_url: String,
    #[serde(default = "d_ws_url")]
    pub ws_url: String,
    #[serde(default = "d_rate_limit_rps")]
    pub rate_limit_per_second: f64,
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    #[serde(default = "d_retry_base_delay")]
    pub retry_base_delay: f64,
    #[serde(default = "d_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "d_maker_fee")]
    pub maker_fee: f64,
    #[serde(default = "d_taker_fee")]
    pub taker_fee: f64,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default = "d_limit_chase_attempts")]
    pub limit_chase_attempts: u32,
    #[serde(default = "d_limit_chase_delay")]
    pub limit_chase_delay_seconds: f64,
    #[serde(default = "default_true")]
    pub limit_fallback_to_market: bool,
    /// Spot venues generally cannot short; execution rejects SHORT intents
    /// unless this is set.
    #[serde(default)]
    pub supports_short: bool,
    #[serde(default = "d_order_book_depth")]
    pub order_book_depth: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty exchange config deserializes")
    }
}

impl ExchangeConfig {
    /// Round-trip taker cost, both sides.
    pub fn round_trip_fee_pct(&self) -> f64 {
        self.taker_fee * 2.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,
    #[serde(default = "d_scan_interval")]
    pub scan_interval_seconds: u64,
    #[serde(default = "d_position_check_interval")]
    pub position_check_interval_seconds: u64,
    #[serde(default = "d_candle_poll")]
    pub candle_poll_seconds: u64,
    #[serde(default = "d_warmup_bars")]
    pub warmup_bars: usize,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<u32>,
    #[serde(default = "d_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    #[serde(default = "d_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Optional per-strategy cooldown overrides, seconds.
    #[serde(default)]
    pub strategy_cooldowns_seconds: HashMap<String, u64>,
    #[serde(default = "d_event_price_move_pct")]
    pub event_price_move_pct: f64,
    #[serde(default = "d_max_spread_pct")]
    pub max_spread_pct: f64,
    #[serde(default)]
    pub use_closed_candles_only: bool,
    /// When set, only the named strategy runs.
    #[serde(default)]
    pub single_strategy_mode: Option<String>,
    /// UTC hours during which no new trades open.
    #[serde(default)]
    pub quiet_hours_utc: Vec<u32>,
    /// 0 disables the per-hour cap.
    #[serde(default)]
    pub max_trades_per_hour: u32,
    #[serde(default)]
    pub canary_mode: bool,
    #[serde(default)]
    pub canary_pairs: Vec<String>,
    #[serde(default = "d_canary_max_pairs")]
    pub canary_max_pairs: usize,
    #[serde(default = "d_canary_max_position_usd")]
    pub canary_max_position_usd: f64,
    #[serde(default = "d_canary_max_risk")]
    pub canary_max_risk_per_trade: f64,
    #[serde(default = "d_canary_min_confidence")]
    pub canary_min_confidence: f64,
    #[serde(default = "d_canary_min_confluence")]
    pub canary_min_confluence: usize,
    #[serde(default = "d_canary_scan_interval")]
    pub canary_scan_interval_seconds: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty trading config deserializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "d_confluence_threshold")]
    pub confluence_threshold: usize,
    #[serde(default = "d_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "d_min_rr")]
    pub min_risk_reward_ratio: f64,
    #[serde(default)]
    pub allow_keltner_solo: bool,
    #[serde(default)]
    pub allow_any_solo: bool,
    #[serde(default = "d_keltner_solo_min")]
    pub keltner_solo_min_confidence: f64,
    #[serde(default = "d_solo_min")]
    pub solo_min_confidence: f64,
    #[serde(default = "d_obi_threshold")]
    pub obi_threshold: f64,
    #[serde(default = "d_book_score_threshold")]
    pub book_score_threshold: f64,
    #[serde(default = "d_book_score_max_age")]
    pub book_score_max_age_seconds: f64,
    #[serde(default = "d_u32_1")]
    pub multi_timeframe_min_agreement: u32,
    #[serde(default = "d_u32_1")]
    pub primary_timeframe: u32,
    #[serde(default)]
    pub obi_counts_as_confluence: bool,
    /// Weight of the synthetic order_book vote in weighted scoring.
    #[serde(default = "d_obi_weight")]
    pub obi_weight: f64,
    #[serde(default = "d_whale_threshold")]
    pub whale_threshold_usd: f64,
    #[serde(default = "default_true")]
    pub strategy_guardrails_enabled: bool,
    #[serde(default = "d_guard_min_trades")]
    pub strategy_guardrails_min_trades: usize,
    #[serde(default = "d_guard_window")]
    pub strategy_guardrails_window_trades: usize,
    #[serde(default = "d_guard_min_wr")]
    pub strategy_guardrails_min_win_rate: f64,
    #[serde(default = "d_guard_min_pf")]
    pub strategy_guardrails_min_profit_factor: f64,
    #[serde(default = "d_guard_disable_minutes")]
    pub strategy_guardrails_disable_minutes: u64,
    #[serde(default = "d_min_updates_before_predict")]
    pub min_updates_before_predict: usize,
    #[serde(default = "d_batch_model_path")]
    pub batch_model_path: String,
    #[serde(default = "d_normalization_path")]
    pub normalization_path: String,
    #[serde(default = "d_online_model_path")]
    pub online_model_path: String,
}

fn d_obi_weight() -> f64 {
    0.4
}

impl Default for AiConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty ai config deserializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "d_session_min_trades")]
    pub min_trades_per_hour: u32,
    #[serde(default = "d_session_max_boost")]
    pub max_boost: f64,
    #[serde(default = "d_session_max_penalty")]
    pub max_penalty: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty session config deserializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    #[serde(default = "d_adx_trend_threshold")]
    pub adx_trend_threshold: f64,
    #[serde(default = "d_atr_pct_high")]
    pub atr_pct_high: f64,
    #[serde(default = "d_atr_pct_low")]
    pub atr_pct_low: f64,
    /// Per-strategy weight multipliers applied in a trending market.
    #[serde(default = "default_trend_weights")]
    pub trend_weight_multipliers: HashMap<String, f64>,
    #[serde(default = "default_range_weights")]
    pub range_weight_multipliers: HashMap<String, f64>,
    #[serde(default = "default_high_vol_weights")]
    pub high_vol_weight_multipliers: HashMap<String, f64>,
    #[serde(default = "default_low_vol_weights")]
    pub low_vol_weight_multipliers: HashMap<String, f64>,
}

fn weights(entries: &[(&str, f64)]) -> HashMap<String, f64> {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn default_trend_weights() -> HashMap<String, f64> {
    weights(&[
        ("trend", 1.3),
        ("ichimoku", 1.2),
        ("supertrend", 1.2),
        ("order_flow", 1.1),
        ("mean_reversion", 0.8),
        ("stochastic_divergence", 0.8),
        ("reversal", 0.7),
        ("keltner", 0.9),
        ("volatility_squeeze", 1.1),
    ])
}

fn default_range_weights() -> HashMap<String, f64> {
    weights(&[
        ("mean_reversion", 1.3),
        ("stochastic_divergence", 1.3),
        ("keltner", 1.2),
        ("reversal", 1.1),
        ("order_flow", 1.1),
        ("trend", 0.8),
        ("ichimoku", 0.8),
        ("supertrend", 0.8),
        ("volatility_squeeze", 0.9),
    ])
}

fn default_high_vol_weights() -> HashMap<String, f64> {
    weights(&[
        ("volatility_squeeze", 1.3),
        ("supertrend", 1.1),
        ("order_flow", 1.1),
        ("mean_reversion", 0.9),
        ("stochastic_divergence", 0.9),
        ("reversal", 0.9),
    ])
}

fn default_low_vol_weights() -> HashMap<String, f64> {
    weights(&[
        ("mean_reversion", 1.2),
        ("stochastic_divergence", 1.2),
        ("keltner", 1.1),
        ("volatility_squeeze", 0.8),
        ("supertrend", 0.9),
        ("ichimoku", 0.9),
    ])
}

impl Default for RegimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty regime config deserializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "d_max_risk_per_trade")]
    pub max_risk_per_trade: f64,
    #[serde(default = "d_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default = "d_max_position_usd")]
    pub max_position_usd: f64,
    #[serde(default = "d_initial_bankroll")]
    pub initial_bankroll: f64,
    #[serde(default = "d_atr_mult_sl")]
    pub atr_multiplier_sl: f64,
    #[serde(default = "d_atr_mult_tp")]
    pub atr_multiplier_tp: f64,
    #[serde(default = "d_trailing_activation")]
    pub trailing_activation_pct: f64,
    #[serde(default = "d_trailing_step")]
    pub trailing_step_pct: f64,
    #[serde(default = "d_breakeven_activation")]
    pub breakeven_activation_pct: f64,
    #[serde(default = "d_kelly_fraction")]
    pub kelly_fraction: f64,
    #[serde(default = "d_max_kelly_size")]
    pub max_kelly_size: f64,
    #[serde(default = "d_risk_of_ruin_threshold")]
    pub risk_of_ruin_threshold: f64,
    /// 0 disables the daily trade cap.
    #[serde(default)]
    pub max_daily_trades: u32,
    #[serde(default = "d_max_total_exposure_pct")]
    pub max_total_exposure_pct: f64,
    #[serde(default = "d_global_cooldown_on_loss")]
    pub global_cooldown_seconds_on_loss: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty risk config deserializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "d_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "d_metrics_retention_hours")]
    pub metrics_retention_hours: u64,
    #[serde(default = "default_true")]
    pub auto_pause_on_stale_data: bool,
    #[serde(default = "d_stale_pause_checks")]
    pub stale_data_pause_after_checks: u32,
    #[serde(default = "default_true")]
    pub auto_pause_on_ws_disconnect: bool,
    #[serde(default = "d_ws_disconnect_pause_secs")]
    pub ws_disconnect_pause_after_seconds: u64,
    #[serde(default = "default_true")]
    pub auto_pause_on_consecutive_losses: bool,
    #[serde(default = "d_consecutive_losses_pause")]
    pub consecutive_losses_pause_threshold: u32,
    #[serde(default = "default_true")]
    pub auto_pause_on_drawdown: bool,
    #[serde(default = "d_drawdown_pause_pct")]
    pub drawdown_pause_pct: f64,
    #[serde(default)]
    pub emergency_close_on_auto_pause: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty monitoring config deserializes")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "d_bind_addr")]
    pub bind_addr: String,
    /// Shared secret for external signal webhook HMAC verification.
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "d_max_skew")]
    pub max_timestamp_skew_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty api config deserializes")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Operator channel webhook URLs; each receives auto-pause and trade
    /// notifications as a JSON POST.
    #[serde(default)]
    pub webhook_urls: Vec<String>,
}

// =============================================================================
// BotConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default = "d_db_path")]
    pub db_path: String,
    #[serde(default = "d_lock_path")]
    pub lock_path: String,
    #[serde(default = "d_tenant_id")]
    pub tenant_id: String,
    /// Paper-mode simulated slippage per side, as a fraction of price.
    #[serde(default = "d_slippage_pct")]
    pub slippage_pct: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty bot config deserializes")
    }
}

impl BotConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.apply_env_overrides();
        info!(
            path = %path.display(),
            mode = %config.app.mode,
            pairs = ?config.trading.pairs,
            "config loaded"
        );
        Ok(config)
    }

    /// Persist using an atomic write (tmp then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize config to JSON")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Environment overrides with type coercion. A value that fails to parse
    /// is logged and the existing value kept.
    pub fn apply_env_overrides(&mut self) {
        override_string("MERIDIAN_MODE", |v| match v.to_ascii_lowercase().as_str() {
            "paper" => {
                self.app.mode = EngineMode::Paper;
                true
            }
            "live" => {
                self.app.mode = EngineMode::Live;
                true
            }
            _ => false,
        });
        override_string("MERIDIAN_PAIRS", |v| {
            let pairs: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if pairs.is_empty() {
                return false;
            }
            self.trading.pairs = pairs;
            true
        });
        override_parse("MERIDIAN_SCAN_INTERVAL_SECONDS", &mut self.trading.scan_interval_seconds);
        override_parse("MERIDIAN_WARMUP_BARS", &mut self.trading.warmup_bars);
        override_parse("MERIDIAN_MAX_TRADES_PER_HOUR", &mut self.trading.max_trades_per_hour);
        override_parse("MERIDIAN_CANARY_MODE", &mut self.trading.canary_mode);
        override_parse("MERIDIAN_INITIAL_BANKROLL", &mut self.risk.initial_bankroll);
        override_parse("MERIDIAN_MAX_POSITION_USD", &mut self.risk.max_position_usd);
        override_parse("MERIDIAN_MAX_RISK_PER_TRADE", &mut self.risk.max_risk_per_trade);
        override_parse("MERIDIAN_MIN_CONFIDENCE", &mut self.ai.min_confidence);
        override_parse("MERIDIAN_CONFLUENCE_THRESHOLD", &mut self.ai.confluence_threshold);
        override_string("MERIDIAN_DB_PATH", |v| {
            self.db_path = v.to_string();
            true
        });
        override_string("MERIDIAN_LOCK_PATH", |v| {
            self.lock_path = v.to_string();
            true
        });
        override_string("MERIDIAN_TENANT_ID", |v| {
            self.tenant_id = v.to_string();
            true
        });
        override_string("MERIDIAN_BIND_ADDR", |v| {
            self.api.bind_addr = v.to_string();
            true
        });
        override_string("MERIDIAN_WEBHOOK_SECRET", |v| {
            self.api.webhook_secret = v.to_string();
            true
        });
    }

    /// Pair list after canary clamping.
    pub fn effective_pairs(&self) -> Vec<String> {
        let t = &self.trading;
        if !t.canary_mode {
            return t.pairs.iter().map(|p| p.to_uppercase()).collect();
        }
        let source = if t.canary_pairs.is_empty() {
            &t.pairs
        } else {
            &t.canary_pairs
        };
        source
            .iter()
            .take(t.canary_max_pairs.max(1))
            .map(|p| p.to_uppercase())
            .collect()
    }

    /// Scan interval after canary clamping (canary never scans faster).
    pub fn effective_scan_interval(&self) -> u64 {
        let t = &self.trading;
        if t.canary_mode {
            t.scan_interval_seconds.max(t.canary_scan_interval_seconds.max(1))
        } else {
            t.scan_interval_seconds.max(1)
        }
    }

    /// Minimum directional real votes required by the gating pipeline.
    pub fn effective_min_confluence(&self) -> usize {
        let base = self.ai.confluence_threshold.max(2);
        if self.trading.canary_mode {
            base.max(self.trading.canary_min_confluence)
        } else {
            base
        }
    }

    /// Execution confidence threshold bounded to [0.45, 0.75], canary-raised.
    pub fn effective_exec_confidence(&self) -> f64 {
        let base = self.ai.min_confidence.clamp(0.45, 0.75);
        if self.trading.canary_mode {
            base.max(self.trading.canary_min_confidence)
        } else {
            base
        }
    }

    /// Max position size after canary clamping.
    pub fn effective_max_position_usd(&self) -> f64 {
        if self.trading.canary_mode {
            self.risk.max_position_usd.min(self.trading.canary_max_position_usd)
        } else {
            self.risk.max_position_usd
        }
    }

    /// Per-trade risk cap after canary clamping.
    pub fn effective_max_risk_per_trade(&self) -> f64 {
        if self.trading.canary_mode {
            self.risk.max_risk_per_trade.min(self.trading.canary_max_risk_per_trade)
        } else {
            self.risk.max_risk_per_trade
        }
    }

    /// Solo-mode permissions; canary disables both.
    pub fn solo_modes(&self) -> (bool, bool) {
        if self.trading.canary_mode {
            (false, false)
        } else {
            (self.ai.allow_keltner_solo, self.ai.allow_any_solo)
        }
    }
}

fn override_string(name: &str, mut apply: impl FnMut(&str) -> bool) {
    if let Ok(raw) = std::env::var(name) {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !apply(trimmed) {
            warn!(var = name, value = %raw, "invalid env override ignored");
        } else {
            info!(var = name, "env override applied");
        }
    }
}

fn override_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<T>() {
            Ok(v) => {
                *slot = v;
                info!(var = name, value = %raw, "env override applied");
            }
            Err(_) => {
                warn!(var = name, value = %raw, "env override failed to parse; keeping file value");
            }
        }
    }
}
