// =============================================================================
// Venue WebSocket Client — ticker / ohlc / book / trade ingestion
// =============================================================================
//
// Connects to the venue's v2 WebSocket feed, subscribes to the configured
// channels with staggered sends, parses data frames into MarketEvents, and
// pushes them to the engine through a bounded channel.
//
// Reconnection: exponential backoff 2^n seconds capped at 60. When the
// venue signals temporary unavailability ("try again later" style closes),
// the backoff switches to a linear 15s * n ramp capped at 120s, which is
// gentler on a venue that is shedding load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::{Bar, OrderBookSnapshot};
use crate::types::normalize_pair;

/// Gap between subscription sends on (re)connect.
const SUBSCRIBE_STAGGER: Duration = Duration::from_millis(500);

/// One parsed market data event.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Ticker { pair: String, price: f64 },
    OhlcBar { pair: String, bar: Bar },
    Book { pair: String, book: OrderBookSnapshot },
    Trade { pair: String, price: f64, volume: f64 },
}

pub struct WsClient {
    url: String,
    pairs: Vec<String>,
    depth: usize,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<MarketEvent>,
}

impl WsClient {
    pub fn new(
        url: String,
        pairs: Vec<String>,
        depth: usize,
        events: mpsc::Sender<MarketEvent>,
    ) -> Self {
        Self {
            url,
            pairs,
            depth,
            connected: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Shared connection flag for the health monitor.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Run the connect/read/reconnect loop until `running` clears.
    pub async fn run(&self, running: Arc<AtomicBool>) {
        let mut reconnect_count: u32 = 0;
        let mut temporarily_unavailable = false;

        while running.load(Ordering::SeqCst) {
            match self.connect_and_stream(&running).await {
                Ok(()) => {
                    // Clean shutdown or server-side close after a healthy
                    // session: reset the backoff.
                    reconnect_count = 0;
                    temporarily_unavailable = false;
                }
                Err(e) => {
                    reconnect_count += 1;
                    temporarily_unavailable = is_temporarily_unavailable(&e.to_string());
                    error!(
                        error = %e,
                        attempt = reconnect_count,
                        "websocket session failed"
                    );
                }
            }
            self.connected.store(false, Ordering::SeqCst);

            if !running.load(Ordering::SeqCst) {
                break;
            }
            let delay = backoff_delay(reconnect_count.max(1), temporarily_unavailable);
            warn!(delay_s = delay, "websocket reconnecting");
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        info!("websocket loop stopped");
    }

    async fn connect_and_stream(&self, running: &Arc<AtomicBool>) -> anyhow::Result<()> {
        info!(url = %self.url, pairs = ?self.pairs, "connecting websocket");
        let (stream, _response) = connect_async(&self.url).await?;
        let (mut write, mut read) = stream.split();

        // Subscribe channel by channel with staggered sends so the venue's
        // per-connection message limits are respected after a reconnect.
        for sub in self.subscriptions() {
            write.send(Message::Text(sub.to_string())).await?;
            tokio::time::sleep(SUBSCRIBE_STAGGER).await;
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("websocket connected and subscribed");

        while running.load(Ordering::SeqCst) {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(err) = frame_error(&text) {
                        // Per-channel transient errors propagate so the
                        // reconnect path can pick the right backoff.
                        if is_temporarily_unavailable(&err) {
                            anyhow::bail!("subscription error: {err}");
                        }
                        warn!(error = %err, "websocket frame error");
                        continue;
                    }
                    for event in parse_message(&text) {
                        if self.events.send(event).await.is_err() {
                            // Receiver gone: the engine is shutting down.
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    anyhow::bail!("websocket closed by server: {reason}");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => anyhow::bail!("websocket stream ended"),
            }
        }
        Ok(())
    }

    fn subscriptions(&self) -> Vec<serde_json::Value> {
        vec![
            json!({"method": "subscribe", "params": {"channel": "ticker", "symbol": self.pairs}}),
            json!({"method": "subscribe", "params": {"channel": "ohlc", "interval": 1, "symbol": self.pairs}}),
            json!({"method": "subscribe", "params": {"channel": "book", "depth": self.depth, "symbol": self.pairs}}),
            json!({"method": "subscribe", "params": {"channel": "trade", "symbol": self.pairs}}),
        ]
    }
}

/// Reconnect delay in seconds.
fn backoff_delay(attempt: u32, temporarily_unavailable: bool) -> u64 {
    if temporarily_unavailable {
        (15 * attempt as u64).min(120)
    } else {
        2u64.saturating_pow(attempt.min(6)).min(60)
    }
}

fn is_temporarily_unavailable(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("temporarily unavailable")
        || lower.contains("try again")
        || lower.contains("unavailable")
        || lower.contains("1013")
}

/// Error field from a subscription ack or status frame, if any.
fn frame_error(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value["error"].as_str().map(|s| s.to_string())
}

fn num(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn iso_to_unix(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
            .unwrap_or(0.0),
        other => num(other),
    }
}

/// Parse one data frame into zero or more events. Unknown channels and
/// malformed entries parse to nothing; a bad frame never kills the session.
pub fn parse_message(text: &str) -> Vec<MarketEvent> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    let Some(channel) = value["channel"].as_str() else {
        return Vec::new();
    };
    let Some(data) = value["data"].as_array() else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for entry in data {
        let Some(symbol) = entry["symbol"].as_str() else {
            continue;
        };
        let pair = normalize_pair(symbol);

        match channel {
            "ticker" => {
                let price = num(&entry["last"]);
                if price > 0.0 {
                    events.push(MarketEvent::Ticker { pair, price });
                }
            }
            "ohlc" => {
                let bar = Bar {
                    time: iso_to_unix(&entry["interval_begin"]),
                    open: num(&entry["open"]),
                    high: num(&entry["high"]),
                    low: num(&entry["low"]),
                    close: num(&entry["close"]),
                    volume: num(&entry["volume"]),
                    vwap: num(&entry["vwap"]),
                };
                if bar.time > 0.0 && bar.close > 0.0 {
                    events.push(MarketEvent::OhlcBar { pair, bar });
                } else {
                    debug!(symbol, "malformed ohlc entry dropped");
                }
            }
            "book" => {
                let side = |key: &str| -> Vec<(f64, f64)> {
                    entry[key]
                        .as_array()
                        .map(|levels| {
                            levels
                                .iter()
                                .map(|l| (num(&l["price"]), num(&l["qty"])))
                                .filter(|(p, _)| *p > 0.0)
                                .collect()
                        })
                        .unwrap_or_default()
                };
                events.push(MarketEvent::Book {
                    pair,
                    book: OrderBookSnapshot {
                        bids: side("bids"),
                        asks: side("asks"),
                        updated_at: std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs_f64(),
                    },
                });
            }
            "trade" => {
                let price = num(&entry["price"]);
                let volume = num(&entry["qty"]);
                if price > 0.0 {
                    events.push(MarketEvent::Trade { pair, price, volume });
                }
            }
            _ => {}
        }
    }
    events
}
