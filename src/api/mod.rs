// =============================================================================
// Control Router — operator commands, read surfaces, signal webhook
// =============================================================================
//
// Commands (pause / resume / close-all / kill) set flags that the engine
// loops observe at their boundaries; they never pre-empt an in-flight order.
// Read endpoints are sanitized: internal error detail stays in the logs.
//
// The external signal webhook verifies an HMAC-SHA256 signature over the
// raw body, enforces a timestamp skew window, and deduplicates by event_id
// before a payload can reach the trading pipeline.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::engine::BotEngine;

type HmacSha256 = Hmac<Sha256>;

pub fn router(engine: Arc<BotEngine>) -> Router {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/positions", get(get_positions))
        .route("/api/v1/risk", get(get_risk))
        .route("/api/v1/pnl", get(get_pnl))
        .route("/api/v1/thoughts", get(get_thoughts))
        .route("/api/v1/control/pause", post(post_pause))
        .route("/api/v1/control/resume", post(post_resume))
        .route("/api/v1/control/close-all", post(post_close_all))
        .route("/api/v1/control/kill", post(post_kill))
        .route("/api/v1/webhook/signal", post(post_signal_webhook))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

// -----------------------------------------------------------------------------
// Read endpoints
// -----------------------------------------------------------------------------

async fn get_status(State(engine): State<Arc<BotEngine>>) -> impl IntoResponse {
    Json(engine.status_snapshot())
}

async fn get_positions(State(engine): State<Arc<BotEngine>>) -> impl IntoResponse {
    match engine.state().db.get_open_trades(None, None) {
        Ok(trades) => Json(json!({ "ok": true, "positions": trades })).into_response(),
        Err(e) => sanitized_error(e),
    }
}

async fn get_risk(State(engine): State<Arc<BotEngine>>) -> impl IntoResponse {
    let stats = engine.state().db.performance_stats(None).unwrap_or_default();
    let report = engine
        .state()
        .risk
        .report(stats.win_rate.max(0.01), stats.avg_win_loss_ratio());
    Json(json!({ "ok": true, "risk": report }))
}

async fn get_pnl(State(engine): State<Arc<BotEngine>>) -> impl IntoResponse {
    match engine.state().db.performance_stats(None) {
        Ok(stats) => Json(json!({ "ok": true, "performance": stats })).into_response(),
        Err(e) => sanitized_error(e),
    }
}

#[derive(Deserialize)]
struct ThoughtsQuery {
    #[serde(default = "default_thought_limit")]
    limit: usize,
}

fn default_thought_limit() -> usize {
    50
}

async fn get_thoughts(
    State(engine): State<Arc<BotEngine>>,
    Query(query): Query<ThoughtsQuery>,
) -> impl IntoResponse {
    match engine.state().db.get_thoughts(query.limit.min(500)) {
        Ok(thoughts) => Json(json!({ "ok": true, "thoughts": thoughts })).into_response(),
        Err(e) => sanitized_error(e),
    }
}

// -----------------------------------------------------------------------------
// Control endpoints
// -----------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct ControlBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn post_pause(
    State(engine): State<Arc<BotEngine>>,
    body: Option<Json<ControlBody>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|b| b.0.reason)
        .unwrap_or_else(|| "manual".to_string());
    engine.operator_pause(&reason).await;
    Json(json!({ "ok": true, "trading_paused": true }))
}

async fn post_resume(State(engine): State<Arc<BotEngine>>) -> impl IntoResponse {
    engine.operator_resume().await;
    Json(json!({ "ok": true, "trading_paused": false }))
}

async fn post_close_all(
    State(engine): State<Arc<BotEngine>>,
    body: Option<Json<ControlBody>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|b| b.0.reason)
        .unwrap_or_else(|| "manual".to_string());
    match engine.operator_close_all(&reason).await {
        Ok(closed) => Json(json!({ "ok": true, "closed": closed })).into_response(),
        Err(e) => sanitized_error(e),
    }
}

async fn post_kill(State(engine): State<Arc<BotEngine>>) -> impl IntoResponse {
    match engine.operator_kill().await {
        Ok(closed) => Json(json!({ "ok": true, "closed": closed, "running": false })).into_response(),
        Err(e) => sanitized_error(e),
    }
}

// -----------------------------------------------------------------------------
// Signal webhook
// -----------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub(crate) enum WebhookRejection {
    MissingSignature,
    BadSignature,
    MalformedPayload,
    MissingEventId,
    StaleTimestamp,
}

impl WebhookRejection {
    fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSignature => "missing signature",
            Self::BadSignature => "invalid signature",
            Self::MalformedPayload => "malformed payload",
            Self::MissingEventId => "event_id is required",
            Self::StaleTimestamp => "timestamp outside allowed skew",
        }
    }
}

/// Verify signature + timestamp and parse the payload. Pure so the policy
/// is testable without HTTP plumbing.
pub(crate) fn verify_webhook(
    secret: &str,
    max_skew_seconds: u64,
    signature_hex: Option<&str>,
    body: &[u8],
    now_unix: i64,
) -> Result<serde_json::Value, WebhookRejection> {
    let signature_hex = signature_hex.ok_or(WebhookRejection::MissingSignature)?;
    let signature =
        hex::decode(signature_hex.trim()).map_err(|_| WebhookRejection::BadSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookRejection::BadSignature)?;
    mac.update(body);
    // Constant-time comparison.
    mac.verify_slice(&signature)
        .map_err(|_| WebhookRejection::BadSignature)?;

    let payload: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| WebhookRejection::MalformedPayload)?;

    if payload["event_id"].as_str().map_or(true, |s| s.trim().is_empty()) {
        return Err(WebhookRejection::MissingEventId);
    }

    // Timestamp skew: enforced when the payload carries one.
    if let Some(ts) = payload["timestamp"].as_i64() {
        if (now_unix - ts).unsigned_abs() > max_skew_seconds {
            return Err(WebhookRejection::StaleTimestamp);
        }
    }

    Ok(payload)
}

/// Full webhook handling minus the HTTP layer: verification, idempotency,
/// then injection into the trading pipeline.
pub(crate) async fn handle_signal_webhook(
    engine: &Arc<BotEngine>,
    signature_hex: Option<&str>,
    body: &[u8],
) -> (StatusCode, serde_json::Value) {
    let config = &engine.state().config.api;
    if config.webhook_secret.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "ok": false, "error": "webhook not configured" }),
        );
    }

    let now = chrono::Utc::now().timestamp();
    let payload = match verify_webhook(
        &config.webhook_secret,
        config.max_timestamp_skew_seconds,
        signature_hex,
        body,
        now,
    ) {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(reason = rejection.as_str(), "webhook rejected");
            return (
                StatusCode::UNAUTHORIZED,
                json!({ "ok": false, "error": rejection.as_str() }),
            );
        }
    };

    // Idempotency: the first submission wins, replays are acknowledged as
    // duplicates with no side effects.
    let event_id = payload["event_id"].as_str().unwrap_or_default();
    let payload_hash = hex::encode(Sha256::digest(body));
    match engine
        .state()
        .db
        .mark_signal_event_processed(event_id, "webhook", &payload_hash, None)
    {
        Ok(true) => {}
        Ok(false) => {
            info!(event_id, "duplicate webhook event ignored");
            return (StatusCode::OK, json!({ "ok": true, "duplicate": true }));
        }
        Err(e) => {
            warn!(error = %e, "webhook dedup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "ok": false, "error": "internal error" }),
            );
        }
    }

    match engine.execute_external_signal(&payload, "webhook").await {
        Ok(trade_id) => (
            StatusCode::OK,
            json!({ "ok": true, "duplicate": false, "trade_id": trade_id }),
        ),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "ok": false, "duplicate": false, "error": e.to_string() }),
        ),
    }
}

async fn post_signal_webhook(
    State(engine): State<Arc<BotEngine>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok());
    let (status, response) = handle_signal_webhook(&engine, signature, &body).await;
    (status, Json(response))
}

fn sanitized_error(e: anyhow::Error) -> axum::response::Response {
    warn!(error = %e, "api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": "internal error" })),
    )
        .into_response()
}
