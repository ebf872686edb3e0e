// =============================================================================
// Meridian Spot Engine — Main Entry Point
// =============================================================================
//
// Startup order matters: config, instance lock, canonical database, venue
// client, warmup, broker reconciliation, then the supervised loops. The
// process survives any single subsystem failure; a crashed engine build is
// retried with backoff up to MAX_ENGINE_RESTARTS before giving up.

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod confluence;
mod engine;
mod error_policy;
mod exchange;
mod execution;
mod indicators;
mod market_data;
mod ml;
mod notify;
mod persistence;
mod risk;
mod strategies;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::BotConfig;
use crate::engine::BotEngine;
use crate::exchange::kraken::KrakenClient;
use crate::persistence::InstanceLock;
use crate::types::EngineMode;

/// Top-level engine restarts before the process gives up.
const MAX_ENGINE_RESTARTS: u32 = 5;
/// Grace period for supervised tasks to settle on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Meridian Spot Engine — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut restarts = 0u32;
    loop {
        match run_engine().await {
            Ok(()) => {
                info!("Meridian shut down complete.");
                return Ok(());
            }
            Err(e) => {
                restarts += 1;
                error!(error = %e, restart = restarts, "engine run failed");
                if restarts >= MAX_ENGINE_RESTARTS {
                    return Err(e.context("engine failed too many times"));
                }
                let delay = (2u64.saturating_pow(restarts)).min(60);
                warn!(delay_s = delay, "restarting engine after backoff");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
    }
}

async fn run_engine() -> Result<()> {
    // ── 1. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        BotConfig::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file missing; using defaults + env overrides");
        let mut config = BotConfig::default();
        config.apply_env_overrides();
        config
    };

    let api_key = std::env::var("MERIDIAN_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("MERIDIAN_API_SECRET").unwrap_or_default();
    if config.app.mode == EngineMode::Live && (api_key.is_empty() || api_secret.is_empty()) {
        anyhow::bail!("live mode requires MERIDIAN_API_KEY and MERIDIAN_API_SECRET");
    }

    info!(
        mode = %config.app.mode,
        pairs = ?config.effective_pairs(),
        canary = config.trading.canary_mode,
        db = %config.db_path,
        "configuration ready"
    );

    // ── 2. One engine per database ───────────────────────────────────────
    let _lock = InstanceLock::acquire(&config.lock_path)
        .context("instance lock contention: is another engine running?")?;

    // ── 3. Venue + subsystems ────────────────────────────────────────────
    let venue = Arc::new(KrakenClient::new(&config.exchange, api_key, api_secret));
    let bind_addr = config.api.bind_addr.clone();
    let state = AppState::build(config, venue)?;
    let engine = BotEngine::new(state.clone());

    // ── 4. Warmup + broker truth ─────────────────────────────────────────
    if let Err(e) = engine.warmup().await {
        // Unreachable venue REST at startup is a critical failure.
        error_policy::handle_init_error("venue_rest_startup", e)?;
    }
    engine.startup_reconcile().await;

    // ── 5. Control router ────────────────────────────────────────────────
    let router = api::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind control router on {bind_addr}"))?;
    info!(addr = %bind_addr, "control router listening");
    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "control router stopped");
        }
    });

    // ── 6. Supervised loops ──────────────────────────────────────────────
    let handles = engine.spawn_all();
    info!(tasks = handles.len(), "all subsystems running; Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutdown signal received; stopping gracefully");

    engine.shutdown().await;
    api_task.abort();

    let settle = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, settle).await.is_err() {
        warn!("tasks did not settle within the grace period; continuing shutdown");
    }

    state.db.update_daily_summary(None).ok();
    Ok(())
}
