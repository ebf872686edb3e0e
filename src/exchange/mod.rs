// =============================================================================
// Exchange Module — venue abstraction
// =============================================================================
//
// Everything the engine needs from a venue goes through the VenueAdapter
// trait so paper simulation, live Kraken, and test doubles are
// interchangeable. Errors carry a transient/permanent classification; only
// transient errors are retried.

pub mod kraken;
pub mod rate_limit;
pub mod ws;

use async_trait::async_trait;
use serde::Serialize;

use crate::market_data::{Bar, OrderBookSnapshot};
use crate::types::TradeSide;

// -----------------------------------------------------------------------------
// Error taxonomy
// -----------------------------------------------------------------------------

/// Venue-facing error with retry classification.
#[derive(Debug, Clone)]
pub enum VenueError {
    /// Worth retrying with backoff: timeouts, 5xx, rate limits, temporary
    /// unavailability.
    Transient(String),
    /// Never retried: invalid pair, auth failures, insufficient balance,
    /// invalid order parameters.
    Permanent(String),
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

impl std::fmt::Display for VenueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(m) => write!(f, "transient venue error: {m}"),
            Self::Permanent(m) => write!(f, "permanent venue error: {m}"),
        }
    }
}

impl std::error::Error for VenueError {}

// -----------------------------------------------------------------------------
// Order model
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub pair: String,
    pub side: TradeSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Required for limit orders.
    pub price: Option<f64>,
    /// Idempotency key forwarded to the venue where supported.
    pub client_order_id: Option<String>,
    pub post_only: bool,
}

/// Venue-side order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderStatus {
    pub order_id: String,
    pub state: OrderState,
    pub filled_quantity: f64,
    pub average_price: Option<f64>,
}

/// A broker-reported position (live reconciliation).
#[derive(Debug, Clone, Serialize)]
pub struct VenuePosition {
    pub pair: String,
    pub quantity: f64,
    pub avg_entry_price: f64,
}

// -----------------------------------------------------------------------------
// Venue adapter
// -----------------------------------------------------------------------------

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    async fn get_ohlc(
        &self,
        pair: &str,
        interval_minutes: u32,
        limit: usize,
    ) -> Result<Vec<Bar>, VenueError>;

    async fn get_ticker(&self, pair: &str) -> Result<f64, VenueError>;

    async fn get_order_book(&self, pair: &str, depth: usize)
        -> Result<OrderBookSnapshot, VenueError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderStatus, VenueError>;

    async fn get_order(&self, pair: &str, order_id: &str) -> Result<OrderStatus, VenueError>;

    async fn cancel_order(&self, pair: &str, order_id: &str) -> Result<(), VenueError>;

    /// Broker-truth long positions, for venues that report them. Spot
    /// venues synthesize this from balances; the default is empty.
    async fn list_open_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        Ok(Vec::new())
    }

    async fn close_position(&self, _pair: &str) -> Result<(), VenueError> {
        Err(VenueError::Permanent("close_position not supported".into()))
    }

    /// Decimal places for order quantities on this pair.
    fn quantity_precision(&self, _pair: &str) -> u32 {
        8
    }

    /// Smallest tradable quantity on this pair.
    fn min_quantity(&self, _pair: &str) -> f64 {
        1e-5
    }

    /// Smallest price increment, used by the limit-chase path.
    fn price_tick(&self, _pair: &str) -> f64 {
        0.1
    }
}

/// Round a quantity down to the venue's precision.
pub fn round_quantity(quantity: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (quantity * factor).floor() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_quantity_floors() {
        assert_eq!(round_quantity(0.123456789, 4), 0.1234);
        assert_eq!(round_quantity(0.129999, 2), 0.12);
        assert_eq!(round_quantity(1.0, 8), 1.0);
    }

    #[test]
    fn error_classification() {
        assert!(VenueError::Transient("timeout".into()).is_transient());
        assert!(!VenueError::Permanent("bad pair".into()).is_transient());
    }

    #[test]
    fn order_state_terminality() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(!OrderState::Open.is_terminal());
        assert!(!OrderState::Pending.is_terminal());
    }
}
