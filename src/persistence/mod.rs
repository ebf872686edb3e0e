// =============================================================================
// Persistence Module
// =============================================================================
//
// The SQLite database is the canonical ledger; the analytics mirror is a
// bounded, lossy, write-only side channel; the instance lock enforces one
// engine per database file.

pub mod database;
pub mod lock;
pub mod mirror;

pub use database::{Database, PerformanceStats, TradeRecord, TRADE_UPDATE_COLUMNS};
pub use lock::InstanceLock;
pub use mirror::AnalyticsMirror;
