// =============================================================================
// Kraken REST Client — signed private calls + public market data
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Private requests
// sign SHA512-HMAC over (path + SHA256(nonce + postdata)) with the
// base64-decoded secret, per Kraken's API-Sign scheme.
//
// All calls route through the token-bucket limiter; transient failures are
// retried with exponential backoff and jitter, permanent ones surface
// immediately.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::Client;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimiter;
use super::{OrderRequest, OrderState, OrderStatus, OrderType, VenueAdapter, VenueError, VenuePosition};
use crate::config::ExchangeConfig;
use crate::market_data::{Bar, OrderBookSnapshot};
use crate::types::TradeSide;

type HmacSha512 = Hmac<Sha512>;

pub struct KrakenClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: Client,
    limiter: RateLimiter,
    max_retries: u32,
    retry_base_delay: f64,
}

impl KrakenClient {
    pub fn new(config: &ExchangeConfig, api_key: String, secret: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .expect("reqwest client builds with static settings");

        debug!(base_url = %config.rest_url, "kraken client initialized");
        Self {
            api_key,
            secret,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            client,
            limiter: RateLimiter::new(config.rate_limit_per_second),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay.max(0.1),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn nonce() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }

    /// API-Sign = base64(HMAC-SHA512(path + SHA256(nonce + postdata), secret))
    fn sign(&self, path: &str, nonce: u64, postdata: &str) -> Result<String, VenueError> {
        let secret = BASE64
            .decode(&self.secret)
            .map_err(|_| VenueError::Permanent("secret is not valid base64".into()))?;

        let mut sha = Sha256::new();
        sha.update(format!("{nonce}{postdata}").as_bytes());
        let digest = sha.finalize();

        let mut mac = HmacSha512::new_from_slice(&secret)
            .map_err(|_| VenueError::Permanent("invalid secret length".into()))?;
        mac.update(path.as_bytes());
        mac.update(&digest);
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    // -------------------------------------------------------------------------
    // Transport with retry
    // -------------------------------------------------------------------------

    async fn call(&self, path: &str, postdata: Option<String>) -> Result<serde_json::Value, VenueError> {
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            match self.call_once(path, postdata.as_deref()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.5);
                    let delay = (self.retry_base_delay * 2f64.powi(attempt as i32 - 1) + jitter)
                        .min(60.0);
                    warn!(
                        path,
                        attempt,
                        delay_s = format!("{delay:.1}"),
                        error = %e,
                        "transient venue error; retrying"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(
        &self,
        path: &str,
        postdata: Option<&str>,
    ) -> Result<serde_json::Value, VenueError> {
        let url = format!("{}{}", self.base_url, path);

        let response = match postdata {
            Some(body) => {
                let nonce = Self::nonce();
                let body = format!("nonce={nonce}&{body}");
                let sign = self.sign(path, nonce, &body)?;
                self.client
                    .post(&url)
                    .header("API-Key", &self.api_key)
                    .header("API-Sign", sign)
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .body(body)
                    .send()
                    .await
            }
            None => self.client.get(&url).send().await,
        };

        let response = response.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                VenueError::Transient(format!("request failed: {e}"))
            } else {
                VenueError::Transient(format!("transport error: {e}"))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(VenueError::Transient(format!("http {status}")));
        }
        if !status.is_success() {
            return Err(VenueError::Permanent(format!("http {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VenueError::Transient(format!("bad json: {e}")))?;

        let errors = body["error"].as_array().cloned().unwrap_or_default();
        if let Some(first) = errors.first().and_then(|e| e.as_str()) {
            return Err(classify_kraken_error(first));
        }
        Ok(body["result"].clone())
    }

    fn to_kraken_interval(minutes: u32) -> u32 {
        match minutes {
            0 | 1 => 1,
            m => m,
        }
    }
}

/// Map Kraken error codes onto the retry taxonomy.
fn classify_kraken_error(code: &str) -> VenueError {
    let transient = code.contains("Temporary")
        || code.contains("Unavailable")
        || code.contains("Rate limit")
        || code.contains("Throttled")
        || code.contains("Timeout")
        || code.starts_with("EService");
    if transient {
        VenueError::Transient(code.to_string())
    } else {
        VenueError::Permanent(code.to_string())
    }
}

fn parse_f64(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Kraken OHLC rows: [time, open, high, low, close, vwap, volume, count].
fn parse_ohlc_rows(rows: &serde_json::Value) -> Vec<Bar> {
    let Some(arr) = rows.as_array() else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|row| {
            let r = row.as_array()?;
            if r.len() < 7 {
                return None;
            }
            Some(Bar {
                time: parse_f64(&r[0]),
                open: parse_f64(&r[1]),
                high: parse_f64(&r[2]),
                low: parse_f64(&r[3]),
                close: parse_f64(&r[4]),
                vwap: parse_f64(&r[5]),
                volume: parse_f64(&r[6]),
            })
        })
        .collect()
}

fn parse_book_side(levels: &serde_json::Value) -> Vec<(f64, f64)> {
    let Some(arr) = levels.as_array() else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|level| {
            let l = level.as_array()?;
            if l.len() < 2 {
                return None;
            }
            Some((parse_f64(&l[0]), parse_f64(&l[1])))
        })
        .collect()
}

fn parse_order_state(status: &str) -> OrderState {
    match status {
        "pending" => OrderState::Pending,
        "open" => OrderState::Open,
        "closed" => OrderState::Filled,
        "canceled" | "expired" => OrderState::Cancelled,
        _ => OrderState::Rejected,
    }
}

/// Kraken uses pair names without the slash in several endpoints.
fn venue_pair(pair: &str) -> String {
    pair.replace('/', "")
}

#[async_trait::async_trait]
impl VenueAdapter for KrakenClient {
    #[instrument(skip(self), name = "kraken::get_ohlc")]
    async fn get_ohlc(
        &self,
        pair: &str,
        interval_minutes: u32,
        limit: usize,
    ) -> Result<Vec<Bar>, VenueError> {
        let path = format!(
            "/0/public/OHLC?pair={}&interval={}",
            venue_pair(pair),
            Self::to_kraken_interval(interval_minutes)
        );
        let result = self.call(&path, None).await?;

        // Result keys the rows by the venue's canonical pair name; take the
        // first array-valued entry.
        let rows = result
            .as_object()
            .and_then(|o| o.values().find(|v| v.is_array()))
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let mut bars = parse_ohlc_rows(&rows);
        if bars.len() > limit {
            bars = bars.split_off(bars.len() - limit);
        }
        debug!(pair, count = bars.len(), "ohlc fetched");
        Ok(bars)
    }

    #[instrument(skip(self), name = "kraken::get_ticker")]
    async fn get_ticker(&self, pair: &str) -> Result<f64, VenueError> {
        let path = format!("/0/public/Ticker?pair={}", venue_pair(pair));
        let result = self.call(&path, None).await?;
        let price = result
            .as_object()
            .and_then(|o| o.values().next())
            .map(|entry| parse_f64(&entry["c"][0]))
            .unwrap_or(0.0);
        if price <= 0.0 {
            return Err(VenueError::Transient("ticker returned no price".into()));
        }
        Ok(price)
    }

    #[instrument(skip(self), name = "kraken::get_order_book")]
    async fn get_order_book(
        &self,
        pair: &str,
        depth: usize,
    ) -> Result<OrderBookSnapshot, VenueError> {
        let path = format!("/0/public/Depth?pair={}&count={}", venue_pair(pair), depth);
        let result = self.call(&path, None).await?;
        let entry = result
            .as_object()
            .and_then(|o| o.values().next())
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(OrderBookSnapshot {
            bids: parse_book_side(&entry["bids"]),
            asks: parse_book_side(&entry["asks"]),
            updated_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
        })
    }

    #[instrument(skip(self, request), name = "kraken::submit_order")]
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderStatus, VenueError> {
        let ordertype = match request.order_type {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        };
        let side = match request.side {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        };

        let mut postdata = format!(
            "pair={}&type={}&ordertype={}&volume={}",
            venue_pair(&request.pair),
            side,
            ordertype,
            request.quantity
        );
        if let Some(price) = request.price {
            postdata.push_str(&format!("&price={price}"));
        }
        if let Some(coid) = &request.client_order_id {
            postdata.push_str(&format!("&cl_ord_id={coid}"));
        }
        if request.post_only {
            postdata.push_str("&oflags=post");
        }

        let result = self.call("/0/private/AddOrder", Some(postdata)).await?;
        let order_id = result["txid"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if order_id.is_empty() {
            return Err(VenueError::Permanent("order accepted without txid".into()));
        }

        debug!(order_id = %order_id, pair = %request.pair, "order submitted");
        Ok(OrderStatus {
            order_id,
            state: OrderState::Open,
            filled_quantity: 0.0,
            average_price: None,
        })
    }

    #[instrument(skip(self), name = "kraken::get_order")]
    async fn get_order(&self, _pair: &str, order_id: &str) -> Result<OrderStatus, VenueError> {
        let postdata = format!("txid={order_id}");
        let result = self.call("/0/private/QueryOrders", Some(postdata)).await?;
        let entry = &result[order_id];
        if entry.is_null() {
            return Err(VenueError::Permanent(format!("unknown order {order_id}")));
        }
        let state = parse_order_state(entry["status"].as_str().unwrap_or(""));
        Ok(OrderStatus {
            order_id: order_id.to_string(),
            state,
            filled_quantity: parse_f64(&entry["vol_exec"]),
            average_price: {
                let p = parse_f64(&entry["price"]);
                if p > 0.0 {
                    Some(p)
                } else {
                    None
                }
            },
        })
    }

    #[instrument(skip(self), name = "kraken::cancel_order")]
    async fn cancel_order(&self, _pair: &str, order_id: &str) -> Result<(), VenueError> {
        let postdata = format!("txid={order_id}");
        self.call("/0/private/CancelOrder", Some(postdata)).await?;
        debug!(order_id, "order cancelled");
        Ok(())
    }

    /// Spot "positions" are non-quote balances priced at their last trade.
    async fn list_open_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        let result = self.call("/0/private/Balance", Some(String::new())).await?;
        let Some(balances) = result.as_object() else {
            return Ok(Vec::new());
        };
        let mut positions = Vec::new();
        for (asset, amount) in balances {
            let qty = parse_f64(amount);
            // Skip quote currencies and dust.
            if qty <= 1e-8 || asset.contains("USD") || asset.contains("EUR") {
                continue;
            }
            positions.push(VenuePosition {
                pair: format!("{}/USD", asset.trim_start_matches('X').trim_start_matches('Z')),
                quantity: qty,
                avg_entry_price: 0.0,
            });
        }
        Ok(positions)
    }
}

impl std::fmt::Debug for KrakenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
