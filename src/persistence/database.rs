// =============================================================================
// Database — canonical SQLite ledger (single writer, WAL)
// =============================================================================
//
// Every durable fact the engine relies on lives here: trades, signals,
// metrics, ML features, thoughts, webhook idempotency, tenants. The analytics
// mirror is a separate, non-canonical sink.
//
// Concurrency: one connection guarded by a mutex with a 30 s acquisition
// timeout. Hitting the timeout is an error, never a deadlock.
//
// Trade updates accept only a whitelisted column set so dynamic column names
// can never become an injection vector.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::confluence::session::HourlyStat;
use crate::types::{TradeSide, TradeStatus};

/// Columns that `update_trade` will accept. Anything else is rejected.
pub const TRADE_UPDATE_COLUMNS: &[&str] = &[
    "exit_price",
    "pnl",
    "pnl_pct",
    "fees",
    "slippage",
    "status",
    "stop_loss",
    "take_profit",
    "trailing_stop",
    "exit_time",
    "duration_seconds",
    "notes",
    "metadata",
    "quantity",
];

const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const PERF_STATS_TTL: Duration = Duration::from_secs(5);

/// Open trades with |quantity| at or below this are phantom rows and ignored.
const MIN_QUANTITY: f64 = 1e-8;

// -----------------------------------------------------------------------------
// Row types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub tenant_id: String,
    pub pair: String,
    pub side: TradeSide,
    pub status: TradeStatus,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub quantity: f64,
    pub strategy: String,
    pub confidence: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_stop: Option<f64>,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub fees: f64,
    pub slippage: f64,
    pub entry_time: String,
    pub exit_time: Option<String>,
    pub duration_seconds: Option<f64>,
    pub metadata: serde_json::Value,
}

impl TradeRecord {
    /// A fresh open trade row.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        trade_id: &str,
        tenant_id: &str,
        pair: &str,
        side: TradeSide,
        entry_price: f64,
        quantity: f64,
        strategy: &str,
        confidence: f64,
        stop_loss: f64,
        take_profit: f64,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            trade_id: trade_id.to_string(),
            tenant_id: tenant_id.to_string(),
            pair: pair.to_string(),
            side,
            status: TradeStatus::Open,
            entry_price,
            exit_price: None,
            quantity,
            strategy: strategy.to_string(),
            confidence,
            stop_loss,
            take_profit,
            trailing_stop: None,
            pnl: 0.0,
            pnl_pct: 0.0,
            fees: 0.0,
            slippage: 0.0,
            entry_time: now_iso(),
            exit_time: None,
            duration_seconds: None,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceStats {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub today_pnl: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub open_positions: u32,
}

impl PerformanceStats {
    /// |avg_win / avg_loss|, defaulting to 1.5 while there is no history.
    pub fn avg_win_loss_ratio(&self) -> f64 {
        if self.avg_loss.abs() > 1e-12 && self.avg_win > 0.0 {
            (self.avg_win / self.avg_loss.abs()).max(0.1)
        } else {
            1.5
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThoughtRow {
    pub timestamp: String,
    pub category: String,
    pub message: String,
    pub severity: String,
}

// -----------------------------------------------------------------------------
// Database
// -----------------------------------------------------------------------------

pub struct Database {
    conn: Mutex<Connection>,
    default_tenant: String,
    perf_cache: Mutex<HashMap<String, (Instant, PerformanceStats)>>,
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    pub fn open(path: impl AsRef<Path>, default_tenant: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let db = Self::finish_open(conn, default_tenant)?;
        info!(path = %path.display(), "database ready");
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory(default_tenant: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::finish_open(conn, default_tenant)
    }

    fn finish_open(conn: Connection, default_tenant: &str) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-16000;
             PRAGMA temp_store=MEMORY;
             PRAGMA mmap_size=67108864;",
        )
        .context("failed to apply pragmas")?;

        let db = Self {
            conn: Mutex::new(conn),
            default_tenant: default_tenant.to_string(),
            perf_cache: Mutex::new(HashMap::new()),
        };
        db.create_schema()?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Acquire the write lock with the configured timeout.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        match self.conn.try_lock_for(WRITE_LOCK_TIMEOUT) {
            Some(guard) => Ok(guard),
            None => bail!("database lock timeout after {:?}", WRITE_LOCK_TIMEOUT),
        }
    }

    fn tenant(&self, tenant_id: Option<&str>) -> String {
        tenant_id.unwrap_or(&self.default_tenant).to_string()
    }

    // -------------------------------------------------------------------------
    // Schema
    // -------------------------------------------------------------------------

    fn create_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT UNIQUE NOT NULL,
                tenant_id TEXT NOT NULL DEFAULT 'default',
                pair TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('buy', 'sell')),
                entry_price REAL NOT NULL,
                exit_price REAL,
                quantity REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'open'
                    CHECK(status IN ('open', 'closed', 'cancelled', 'error')),
                strategy TEXT NOT NULL,
                confidence REAL,
                stop_loss REAL,
                take_profit REAL,
                trailing_stop REAL,
                pnl REAL DEFAULT 0.0,
                pnl_pct REAL DEFAULT 0.0,
                fees REAL DEFAULT 0.0,
                slippage REAL DEFAULT 0.0,
                entry_time TEXT NOT NULL,
                exit_time TEXT,
                duration_seconds REAL,
                notes TEXT,
                metadata TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS order_book_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pair TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                bid_volume REAL,
                ask_volume REAL,
                obi REAL,
                spread REAL,
                whale_detected INTEGER DEFAULT 0,
                snapshot_data TEXT,
                trade_id TEXT,
                tenant_id TEXT DEFAULT 'default'
            );

            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                pair TEXT NOT NULL,
                strategy TEXT NOT NULL,
                direction TEXT NOT NULL CHECK(direction IN ('long', 'short', 'neutral')),
                strength REAL NOT NULL,
                confluence_count INTEGER DEFAULT 0,
                ai_confidence REAL,
                acted_upon INTEGER DEFAULT 0,
                metadata TEXT,
                tenant_id TEXT DEFAULT 'default'
            );

            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                metric_value REAL NOT NULL,
                tags TEXT,
                tenant_id TEXT DEFAULT 'default'
            );

            CREATE TABLE IF NOT EXISTS ml_features (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                pair TEXT NOT NULL,
                features TEXT NOT NULL,
                label REAL,
                trade_id TEXT,
                tenant_id TEXT DEFAULT 'default',
                FOREIGN KEY (trade_id) REFERENCES trades(trade_id)
            );

            CREATE TABLE IF NOT EXISTS thought_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                severity TEXT DEFAULT 'info'
                    CHECK(severity IN ('debug', 'info', 'warning', 'error', 'critical')),
                metadata TEXT,
                tenant_id TEXT DEFAULT 'default'
            );

            CREATE TABLE IF NOT EXISTS system_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                stripe_customer_id TEXT,
                stripe_subscription_id TEXT,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK(status IN ('active', 'past_due', 'canceled', 'trialing', 'incomplete')),
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS tenant_api_keys (
                api_key_hash TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                label TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                FOREIGN KEY (tenant_id) REFERENCES tenants(id)
            );

            CREATE TABLE IF NOT EXISTS stripe_webhook_events (
                event_id TEXT PRIMARY KEY,
                event_type TEXT,
                payload_hash TEXT,
                received_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS signal_webhook_events (
                event_id TEXT PRIMARY KEY,
                source TEXT,
                payload_hash TEXT,
                received_at TEXT NOT NULL,
                tenant_id TEXT DEFAULT 'default'
            );

            CREATE TABLE IF NOT EXISTS backtest_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT UNIQUE NOT NULL,
                tenant_id TEXT DEFAULT 'default',
                exchange TEXT,
                pair TEXT NOT NULL,
                timeframe TEXT,
                mode TEXT,
                status TEXT NOT NULL DEFAULT 'completed'
                    CHECK(status IN ('queued', 'running', 'completed', 'failed')),
                run_type TEXT NOT NULL DEFAULT 'backtest'
                    CHECK(run_type IN ('backtest', 'optimization')),
                params_json TEXT,
                result_json TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS copy_trading_providers (
                provider_id TEXT PRIMARY KEY,
                tenant_id TEXT DEFAULT 'default',
                name TEXT NOT NULL,
                source TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                webhook_secret TEXT,
                metadata_json TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS daily_summary (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                total_trades INTEGER DEFAULT 0,
                winning_trades INTEGER DEFAULT 0,
                losing_trades INTEGER DEFAULT 0,
                total_pnl REAL DEFAULT 0.0,
                max_drawdown REAL DEFAULT 0.0,
                sharpe_ratio REAL,
                win_rate REAL,
                avg_win REAL,
                avg_loss REAL,
                best_trade REAL,
                worst_trade REAL,
                tenant_id TEXT DEFAULT 'default',
                UNIQUE(date, tenant_id)
            );

            CREATE INDEX IF NOT EXISTS idx_trades_pair ON trades(pair);
            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
            CREATE INDEX IF NOT EXISTS idx_trades_entry_time ON trades(entry_time);
            CREATE INDEX IF NOT EXISTS idx_signals_timestamp ON signals(timestamp);
            CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp);
            CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics(metric_name);
            CREATE INDEX IF NOT EXISTS idx_thought_log_timestamp ON thought_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_ml_features_pair ON ml_features(pair);
            CREATE INDEX IF NOT EXISTS idx_ml_features_label ON ml_features(label);
            CREATE INDEX IF NOT EXISTS idx_order_book_pair ON order_book_snapshots(pair);
            CREATE INDEX IF NOT EXISTS idx_signal_webhook_received_at
                ON signal_webhook_events(received_at);
            "#,
        )
        .context("failed to create schema")?;
        Ok(())
    }

    /// Backfill migrations for databases created by older builds: missing
    /// tenant_id columns, and the daily_summary uniqueness rebuild from
    /// UNIQUE(date) to UNIQUE(date, tenant_id).
    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;

        for (table, column, col_def) in [
            ("trades", "tenant_id", "TEXT NOT NULL DEFAULT 'default'"),
            ("signals", "tenant_id", "TEXT DEFAULT 'default'"),
            ("metrics", "tenant_id", "TEXT DEFAULT 'default'"),
            ("ml_features", "tenant_id", "TEXT DEFAULT 'default'"),
            ("thought_log", "tenant_id", "TEXT DEFAULT 'default'"),
            ("order_book_snapshots", "tenant_id", "TEXT DEFAULT 'default'"),
        ] {
            if !column_exists(&conn, table, column)? {
                info!(table, column, "migrating: adding tenant column");
                conn.execute(
                    &format!("ALTER TABLE {table} ADD COLUMN {column} {col_def}"),
                    [],
                )
                .with_context(|| format!("failed to add {column} to {table}"))?;
                conn.execute(
                    &format!("UPDATE {table} SET {column} = 'default' WHERE {column} IS NULL"),
                    [],
                )
                .ok();
            }
        }

        // daily_summary: older schemas used UNIQUE(date); rebuild when the
        // per-tenant uniqueness is missing.
        let table_sql: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'daily_summary'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to inspect daily_summary schema")?;
        if let Some(sql) = table_sql {
            let normalized = sql.replace(' ', "").to_lowercase();
            if !normalized.contains("unique(date,tenant_id)") {
                info!("migrating: rebuilding daily_summary with (date, tenant_id) uniqueness");
                conn.execute_batch(
                    r#"
                    CREATE TABLE daily_summary_new (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        date TEXT NOT NULL,
                        total_trades INTEGER DEFAULT 0,
                        winning_trades INTEGER DEFAULT 0,
                        losing_trades INTEGER DEFAULT 0,
                        total_pnl REAL DEFAULT 0.0,
                        max_drawdown REAL DEFAULT 0.0,
                        sharpe_ratio REAL,
                        win_rate REAL,
                        avg_win REAL,
                        avg_loss REAL,
                        best_trade REAL,
                        worst_trade REAL,
                        tenant_id TEXT DEFAULT 'default',
                        UNIQUE(date, tenant_id)
                    );
                    INSERT OR IGNORE INTO daily_summary_new
                        (date, total_trades, winning_trades, losing_trades, total_pnl,
                         max_drawdown, sharpe_ratio, win_rate, avg_win, avg_loss,
                         best_trade, worst_trade, tenant_id)
                    SELECT date, total_trades, winning_trades, losing_trades, total_pnl,
                           max_drawdown, sharpe_ratio, win_rate, avg_win, avg_loss,
                           best_trade, worst_trade,
                           COALESCE(tenant_id, 'default')
                    FROM daily_summary;
                    DROP TABLE daily_summary;
                    ALTER TABLE daily_summary_new RENAME TO daily_summary;
                    "#,
                )
                .context("failed to rebuild daily_summary")?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub fn insert_trade(&self, trade: &TradeRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO trades
             (trade_id, tenant_id, pair, side, entry_price, quantity, status, strategy,
              confidence, stop_loss, take_profit, entry_time, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                trade.trade_id,
                trade.tenant_id,
                trade.pair,
                trade.side.as_str(),
                trade.entry_price,
                trade.quantity,
                trade.status.as_str(),
                trade.strategy,
                trade.confidence,
                trade.stop_loss,
                trade.take_profit,
                trade.entry_time,
                trade.metadata.to_string(),
            ],
        )
        .context("failed to insert trade")?;
        debug!(trade_id = %trade.trade_id, pair = %trade.pair, "trade inserted");
        Ok(())
    }

    /// Update whitelisted columns on a trade row. Rejects any column outside
    /// [`TRADE_UPDATE_COLUMNS`].
    pub fn update_trade(
        &self,
        trade_id: &str,
        updates: &[(&str, Value)],
        tenant_id: Option<&str>,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        for (col, _) in updates {
            if !TRADE_UPDATE_COLUMNS.contains(col) {
                bail!("column '{col}' not allowed in trade updates");
            }
        }

        let mut sets: Vec<String> = updates
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{col} = ?{}", i + 1))
            .collect();
        sets.push("updated_at = datetime('now')".to_string());

        let mut values: Vec<Value> = updates.iter().map(|(_, v)| v.clone()).collect();
        values.push(Value::Text(trade_id.to_string()));
        let mut sql = format!(
            "UPDATE trades SET {} WHERE trade_id = ?{}",
            sets.join(", "),
            values.len()
        );
        if let Some(t) = tenant_id {
            values.push(Value::Text(t.to_string()));
            sql.push_str(&format!(" AND tenant_id = ?{}", values.len()));
        }

        let conn = self.lock()?;
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .context("failed to update trade")?;
        Ok(())
    }

    /// Close a trade and atomically label its ML feature rows in the same
    /// transaction. Idempotent: a second close of the same trade_id is a
    /// no-op returning `false`.
    #[allow(clippy::too_many_arguments)]
    pub fn close_trade(
        &self,
        trade_id: &str,
        exit_price: f64,
        pnl: f64,
        pnl_pct: f64,
        fees: f64,
        slippage: f64,
        tenant_id: Option<&str>,
    ) -> Result<bool> {
        let tenant = self.tenant(tenant_id);
        let now = now_iso();
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("failed to begin close transaction")?;

        let entry_time: Option<String> = tx
            .query_row(
                "SELECT entry_time FROM trades
                 WHERE trade_id = ?1 AND tenant_id = ?2 AND status = 'open'",
                params![trade_id, tenant],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read trade for close")?;
        let Some(entry_time) = entry_time else {
            // Already closed (or unknown): nothing to do.
            return Ok(false);
        };

        let duration = duration_seconds(&entry_time, &now).max(0.0);

        tx.execute(
            "UPDATE trades SET
                exit_price = ?1, pnl = ?2, pnl_pct = ?3, fees = ?4, slippage = ?5,
                status = 'closed', exit_time = ?6, duration_seconds = ?7,
                updated_at = datetime('now')
             WHERE trade_id = ?8 AND tenant_id = ?9 AND status = 'open'",
            params![exit_price, pnl, pnl_pct, fees, slippage, now, duration, trade_id, tenant],
        )
        .context("failed to close trade")?;

        // Label feature rows captured at entry; same transaction so the
        // ledger and the training data can never disagree.
        let label = if pnl > 0.0 { 1.0 } else { 0.0 };
        tx.execute(
            "UPDATE ml_features SET label = ?1
             WHERE trade_id = ?2 AND tenant_id = ?3 AND label IS NULL",
            params![label, trade_id, tenant],
        )
        .context("failed to label ml features")?;

        tx.commit().context("failed to commit close transaction")?;
        self.perf_cache.lock().clear();
        debug!(trade_id, pnl, "trade closed");
        Ok(true)
    }

    /// Mark a trade cancelled (order never filled). Idempotent like close.
    pub fn cancel_trade(&self, trade_id: &str, tenant_id: Option<&str>) -> Result<bool> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE trades SET status = 'cancelled', updated_at = datetime('now')
                 WHERE trade_id = ?1 AND tenant_id = ?2 AND status = 'open'",
                params![trade_id, tenant],
            )
            .context("failed to cancel trade")?;
        Ok(changed > 0)
    }

    pub fn get_open_trades(
        &self,
        pair: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<Vec<TradeRecord>> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        let mut sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades
             WHERE status = 'open' AND ABS(quantity) > {MIN_QUANTITY} AND tenant_id = ?1"
        );
        let mut args: Vec<Value> = vec![Value::Text(tenant)];
        if let Some(p) = pair {
            args.push(Value::Text(p.to_string()));
            sql.push_str(" AND pair = ?2");
        }
        sql.push_str(" ORDER BY entry_time DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), row_to_trade)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read open trades")?;
        Ok(rows)
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<Option<TradeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE trade_id = ?1 LIMIT 1"
        ))?;
        stmt.query_row(params![trade_id], row_to_trade)
            .optional()
            .context("failed to read trade")
    }

    pub fn get_trade_history(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> Result<Vec<TradeRecord>> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades
             WHERE status = 'closed' AND tenant_id = ?1
             ORDER BY exit_time DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![tenant, limit as i64], row_to_trade)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read trade history")?;
        Ok(rows)
    }

    /// Count non-cancelled trades with entry_time at or after `since_iso`.
    pub fn count_trades_since(&self, since_iso: &str, tenant_id: Option<&str>) -> Result<u32> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades
             WHERE status != 'cancelled' AND entry_time >= ?1 AND tenant_id = ?2",
            params![since_iso, tenant],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // -------------------------------------------------------------------------
    // Signals / metrics / thoughts
    // -------------------------------------------------------------------------

    pub fn insert_signal(
        &self,
        pair: &str,
        strategy: &str,
        direction: &str,
        strength: f64,
        confluence_count: usize,
        ai_confidence: f64,
        acted_upon: bool,
        metadata: &serde_json::Value,
        tenant_id: Option<&str>,
    ) -> Result<()> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO signals
             (timestamp, pair, strategy, direction, strength, confluence_count,
              ai_confidence, acted_upon, metadata, tenant_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                now_iso(),
                pair,
                strategy,
                direction,
                strength,
                confluence_count as i64,
                ai_confidence,
                acted_upon as i64,
                metadata.to_string(),
                tenant,
            ],
        )
        .context("failed to insert signal")?;
        Ok(())
    }

    pub fn insert_metric(&self, name: &str, value: f64, tenant_id: Option<&str>) -> Result<()> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO metrics (timestamp, metric_name, metric_value, tenant_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![now_iso(), name, value, tenant],
        )
        .context("failed to insert metric")?;
        Ok(())
    }

    pub fn log_thought(
        &self,
        category: &str,
        message: &str,
        severity: &str,
        metadata: Option<&serde_json::Value>,
        tenant_id: Option<&str>,
    ) -> Result<()> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO thought_log (timestamp, category, message, severity, metadata, tenant_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                now_iso(),
                category,
                message,
                severity,
                metadata.map(|m| m.to_string()),
                tenant,
            ],
        )
        .context("failed to log thought")?;
        Ok(())
    }

    pub fn get_thoughts(&self, limit: usize) -> Result<Vec<ThoughtRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, category, message, severity FROM thought_log
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ThoughtRow {
                    timestamp: row.get(0)?,
                    category: row.get(1)?,
                    message: row.get(2)?,
                    severity: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read thoughts")?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // ML features
    // -------------------------------------------------------------------------

    pub fn insert_ml_features(
        &self,
        pair: &str,
        features: &serde_json::Value,
        trade_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<()> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ml_features (timestamp, pair, features, label, trade_id, tenant_id)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            params![now_iso(), pair, features.to_string(), trade_id, tenant],
        )
        .context("failed to insert ml features")?;
        Ok(())
    }

    /// (features, label) for one trade; label is None until the trade closes.
    pub fn get_ml_features_for_trade(
        &self,
        trade_id: &str,
    ) -> Result<Option<(serde_json::Value, Option<f64>)>> {
        let conn = self.lock()?;
        let row: Option<(String, Option<f64>)> = conn
            .query_row(
                "SELECT features, label FROM ml_features WHERE trade_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![trade_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read ml features")?;
        match row {
            Some((features, label)) => {
                let parsed = serde_json::from_str(&features).unwrap_or(serde_json::Value::Null);
                Ok(Some((parsed, label)))
            }
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // System state
    // -------------------------------------------------------------------------

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO system_state (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )
        .context("failed to set state")?;
        Ok(())
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM system_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to get state")
    }

    // -------------------------------------------------------------------------
    // Webhook idempotency
    // -------------------------------------------------------------------------

    pub fn has_processed_signal_event(&self, event_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM signal_webhook_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Record a signal webhook event. Returns `false` when the event_id was
    /// already processed (duplicate).
    pub fn mark_signal_event_processed(
        &self,
        event_id: &str,
        source: &str,
        payload_hash: &str,
        tenant_id: Option<&str>,
    ) -> Result<bool> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO signal_webhook_events
             (event_id, source, payload_hash, received_at, tenant_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![event_id, source, payload_hash, now_iso(), tenant],
        )?;
        Ok(inserted > 0)
    }

    pub fn has_processed_stripe_event(&self, event_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM stripe_webhook_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn mark_stripe_event_processed(
        &self,
        event_id: &str,
        event_type: &str,
        payload_hash: &str,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO stripe_webhook_events
             (event_id, event_type, payload_hash, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_id, event_type, payload_hash, now_iso()],
        )?;
        Ok(inserted > 0)
    }

    // -------------------------------------------------------------------------
    // Aggregates
    // -------------------------------------------------------------------------

    /// Aggregate performance statistics, cached per tenant for 5 seconds.
    ///
    /// Sharpe and Sortino come from SQL-computed moments with Bessel
    /// correction and an annualization factor of sqrt(min(n, 2500)).
    pub fn performance_stats(&self, tenant_id: Option<&str>) -> Result<PerformanceStats> {
        let tenant = self.tenant(tenant_id);
        {
            let cache = self.perf_cache.lock();
            if let Some((at, stats)) = cache.get(&tenant) {
                if at.elapsed() < PERF_STATS_TTL {
                    return Ok(stats.clone());
                }
            }
        }

        let conn = self.lock()?;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let row = conn.query_row(
            "SELECT
                COUNT(*)                                               AS total,
                COALESCE(SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END), 0)  AS wins,
                COALESCE(SUM(CASE WHEN pnl <= 0 THEN 1 ELSE 0 END), 0) AS losses,
                COALESCE(SUM(pnl), 0.0)                                AS total_pnl,
                AVG(CASE WHEN pnl > 0 THEN pnl END)                    AS avg_win,
                AVG(CASE WHEN pnl <= 0 THEN pnl END)                   AS avg_loss,
                COALESCE(SUM(CASE WHEN substr(exit_time, 1, 10) = ?2
                              THEN pnl ELSE 0 END), 0.0)               AS today_pnl,
                COUNT(CASE WHEN pnl IS NOT NULL THEN 1 END)            AS n_finite,
                COALESCE(AVG(CASE WHEN pnl IS NOT NULL THEN pnl END), 0.0)       AS mean_pnl,
                COALESCE(AVG(CASE WHEN pnl IS NOT NULL THEN pnl * pnl END), 0.0) AS mean_pnl_sq,
                COUNT(CASE WHEN pnl < 0 THEN 1 END)                    AS n_down,
                COALESCE(AVG(CASE WHEN pnl < 0 THEN pnl * pnl END), 0.0)         AS mean_down_sq
             FROM trades
             WHERE status = 'closed' AND tenant_id = ?1",
            params![tenant, today],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, f64>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, f64>(11)?,
                ))
            },
        )?;

        let (total, wins, losses, total_pnl, avg_win, avg_loss, today_pnl, n_finite, mean_pnl, mean_pnl_sq, n_down, mean_down_sq) =
            row;

        let mut stats = PerformanceStats {
            total_trades: total as u32,
            winning_trades: wins as u32,
            losing_trades: losses as u32,
            win_rate: if total > 0 { wins as f64 / total as f64 } else { 0.0 },
            total_pnl,
            avg_win: avg_win.unwrap_or(0.0),
            avg_loss: avg_loss.unwrap_or(0.0),
            today_pnl,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            open_positions: 0,
        };

        if n_finite >= 5 {
            let n = n_finite as f64;
            let pop_var = (mean_pnl_sq - mean_pnl * mean_pnl).max(0.0);
            let variance = pop_var * n / (n - 1.0).max(1.0);
            let std_dev = variance.sqrt();
            let annual = (n.min(2500.0)).sqrt();
            if std_dev > 1e-12 {
                let sharpe = mean_pnl / std_dev * annual;
                stats.sharpe_ratio = if sharpe.is_finite() {
                    (sharpe * 1000.0).round() / 1000.0
                } else {
                    0.0
                };
            }
            if n_down > 0 {
                let down_dev = mean_down_sq.max(0.0).sqrt();
                if down_dev > 1e-12 {
                    let sortino = mean_pnl / down_dev * annual;
                    stats.sortino_ratio = if sortino.is_finite() {
                        (sortino * 1000.0).round() / 1000.0
                    } else {
                        0.0
                    };
                }
            } else {
                stats.sortino_ratio = 999.0;
            }
        }

        let open: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM trades
                 WHERE status = 'open' AND ABS(quantity) > {MIN_QUANTITY} AND tenant_id = ?1"
            ),
            params![tenant],
            |row| row.get(0),
        )?;
        stats.open_positions = open as u32;
        drop(conn);

        self.perf_cache
            .lock()
            .insert(tenant, (Instant::now(), stats.clone()));
        Ok(stats)
    }

    /// Per-UTC-hour closed-trade outcomes for the session analyzer.
    pub fn hourly_stats(&self, tenant_id: Option<&str>) -> Result<HashMap<u32, HourlyStat>> {
        let tenant = self.tenant(tenant_id);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT CAST(substr(entry_time, 12, 2) AS INTEGER) AS hour,
                    COUNT(*) AS total,
                    SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END) AS wins
             FROM trades
             WHERE status = 'closed' AND tenant_id = ?1
             GROUP BY hour",
        )?;
        let mut out = HashMap::new();
        let rows = stmt.query_map(params![tenant], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (hour, total, wins) = row?;
            out.insert(
                hour.clamp(0, 23) as u32,
                HourlyStat {
                    total: total as u32,
                    wins: wins as u32,
                },
            );
        }
        Ok(out)
    }

    /// Upsert today's daily summary from closed trades.
    pub fn update_daily_summary(&self, tenant_id: Option<&str>) -> Result<()> {
        let tenant = self.tenant(tenant_id);
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO daily_summary
                (date, total_trades, winning_trades, losing_trades, total_pnl,
                 win_rate, avg_win, avg_loss, best_trade, worst_trade, tenant_id)
             SELECT ?1,
                    COUNT(*),
                    SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN pnl <= 0 THEN 1 ELSE 0 END),
                    COALESCE(SUM(pnl), 0.0),
                    CASE WHEN COUNT(*) > 0
                         THEN CAST(SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END) AS REAL) / COUNT(*)
                         ELSE 0.0 END,
                    AVG(CASE WHEN pnl > 0 THEN pnl END),
                    AVG(CASE WHEN pnl <= 0 THEN pnl END),
                    MAX(pnl),
                    MIN(pnl),
                    ?2
             FROM trades
             WHERE status = 'closed' AND tenant_id = ?2 AND substr(exit_time, 1, 10) = ?1
             ON CONFLICT(date, tenant_id) DO UPDATE SET
                total_trades = excluded.total_trades,
                winning_trades = excluded.winning_trades,
                losing_trades = excluded.losing_trades,
                total_pnl = excluded.total_pnl,
                win_rate = excluded.win_rate,
                avg_win = excluded.avg_win,
                avg_loss = excluded.avg_loss,
                best_trade = excluded.best_trade,
                worst_trade = excluded.worst_trade",
            params![today, tenant],
        )
        .context("failed to update daily summary")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Purge metrics, thoughts and order-book snapshots past the retention
    /// window.
    pub fn cleanup_old_data(&self, retention_hours: u64) -> Result<()> {
        let cutoff = (Utc::now() - chrono::Duration::hours(retention_hours as i64))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.lock()?;
        let metrics = conn.execute("DELETE FROM metrics WHERE timestamp < ?1", params![cutoff])?;
        let thoughts =
            conn.execute("DELETE FROM thought_log WHERE timestamp < ?1", params![cutoff])?;
        let books = conn.execute(
            "DELETE FROM order_book_snapshots WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if metrics + thoughts + books > 0 {
            info!(metrics, thoughts, books, "old rows purged");
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Row helpers
// -----------------------------------------------------------------------------

const TRADE_COLUMNS: &str = "trade_id, tenant_id, pair, side, status, entry_price, exit_price, \
     quantity, strategy, confidence, stop_loss, take_profit, trailing_stop, pnl, pnl_pct, fees, \
     slippage, entry_time, exit_time, duration_seconds, metadata";

fn row_to_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
    let side: String = row.get(3)?;
    let status: String = row.get(4)?;
    let metadata: Option<String> = row.get(20)?;
    Ok(TradeRecord {
        trade_id: row.get(0)?,
        tenant_id: row.get(1)?,
        pair: row.get(2)?,
        side: TradeSide::parse(&side).unwrap_or(TradeSide::Buy),
        status: match status.as_str() {
            "closed" => TradeStatus::Closed,
            "cancelled" => TradeStatus::Cancelled,
            "error" => TradeStatus::Error,
            _ => TradeStatus::Open,
        },
        entry_price: row.get(5)?,
        exit_price: row.get(6)?,
        quantity: row.get(7)?,
        strategy: row.get(8)?,
        confidence: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
        stop_loss: row.get::<_, Option<f64>>(10)?.unwrap_or(0.0),
        take_profit: row.get::<_, Option<f64>>(11)?.unwrap_or(0.0),
        trailing_stop: row.get(12)?,
        pnl: row.get::<_, Option<f64>>(13)?.unwrap_or(0.0),
        pnl_pct: row.get::<_, Option<f64>>(14)?.unwrap_or(0.0),
        fees: row.get::<_, Option<f64>>(15)?.unwrap_or(0.0),
        slippage: row.get::<_, Option<f64>>(16)?.unwrap_or(0.0),
        entry_time: row.get(17)?,
        exit_time: row.get(18)?,
        duration_seconds: row.get(19)?,
        metadata: metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(serde_json::Value::Null),
    })
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn duration_seconds(start_iso: &str, end_iso: &str) -> f64 {
    let parse = |s: &str| chrono::DateTime::parse_from_rfc3339(s).ok();
    match (parse(start_iso), parse(end_iso)) {
        (Some(a), Some(b)) => (b - a).num_milliseconds() as f64 / 1000.0,
        _ => 0.0,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> Database {
        Database::open_in_memory("default").unwrap()
    }

    fn sample_trade(trade_id: &str) -> TradeRecord {
        TradeRecord::open(
            trade_id,
            "default",
            "BTC/USD",
            TradeSide::Buy,
            50_000.0,
            0.01,
            "keltner",
            0.7,
            49_000.0,
            52_000.0,
            json!({"source": "test"}),
        )
    }

    #[test]
    fn insert_and_read_open_trade() {
        let db = db();
        db.insert_trade(&sample_trade("t1")).unwrap();
        let open = db.get_open_trades(None, None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, "t1");
        assert_eq!(open[0].status, TradeStatus::Open);
        assert!(open[0].quantity.abs() > 1e-8);
    }

    #[test]
    fn duplicate_trade_id_rejected() {
        let db = db();
        db.insert_trade(&sample_trade("t1")).unwrap();
        assert!(db.insert_trade(&sample_trade("t1")).is_err());
    }

    #[test]
    fn close_trade_is_idempotent() {
        let db = db();
        db.insert_trade(&sample_trade("t1")).unwrap();

        let first = db.close_trade("t1", 51_000.0, 9.0, 1.8, 0.5, 0.5, None).unwrap();
        assert!(first, "first close applies");
        let second = db.close_trade("t1", 51_500.0, 99.0, 3.0, 0.5, 0.5, None).unwrap();
        assert!(!second, "second close is a no-op");

        let trade = db.get_trade("t1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        // First close's numbers stand.
        assert_eq!(trade.pnl, 9.0);
        assert_eq!(trade.exit_price, Some(51_000.0));
        assert!(trade.exit_time.is_some());
        assert!(trade.duration_seconds.unwrap() >= 0.0);
    }

    #[test]
    fn close_labels_ml_features_atomically() {
        let db = db();
        db.insert_trade(&sample_trade("t1")).unwrap();
        db.insert_ml_features("BTC/USD", &json!({"strength": 0.7}), "t1", None)
            .unwrap();

        let (_, label) = db.get_ml_features_for_trade("t1").unwrap().unwrap();
        assert!(label.is_none(), "label is NULL until close");

        db.close_trade("t1", 51_000.0, 9.0, 1.8, 0.0, 0.0, None).unwrap();
        let (_, label) = db.get_ml_features_for_trade("t1").unwrap().unwrap();
        assert_eq!(label, Some(1.0));

        // Losing close labels 0.
        db.insert_trade(&sample_trade("t2")).unwrap();
        db.insert_ml_features("BTC/USD", &json!({"strength": 0.4}), "t2", None)
            .unwrap();
        db.close_trade("t2", 49_000.0, -11.0, -2.2, 0.0, 0.0, None).unwrap();
        let (_, label) = db.get_ml_features_for_trade("t2").unwrap().unwrap();
        assert_eq!(label, Some(0.0));
    }

    #[test]
    fn update_trade_enforces_whitelist() {
        let db = db();
        db.insert_trade(&sample_trade("t1")).unwrap();

        db.update_trade("t1", &[("stop_loss", Value::Real(49_500.0))], None)
            .unwrap();
        let trade = db.get_trade("t1").unwrap().unwrap();
        assert_eq!(trade.stop_loss, 49_500.0);

        let err = db
            .update_trade("t1", &[("pair", Value::Text("EVIL".into()))], None)
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));

        // Injection-shaped column names are rejected, not interpolated.
        let err = db
            .update_trade("t1", &[("pnl = 0; DROP TABLE trades; --", Value::Real(0.0))], None)
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn cancel_trade_only_hits_open_rows() {
        let db = db();
        db.insert_trade(&sample_trade("t1")).unwrap();
        assert!(db.cancel_trade("t1", None).unwrap());
        assert!(!db.cancel_trade("t1", None).unwrap());
        let trade = db.get_trade("t1").unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Cancelled);
    }

    #[test]
    fn phantom_quantity_rows_hidden_from_open() {
        let db = db();
        let mut trade = sample_trade("t1");
        trade.quantity = 0.0;
        db.insert_trade(&trade).unwrap();
        assert!(db.get_open_trades(None, None).unwrap().is_empty());
    }

    #[test]
    fn tenant_scoping_on_reads() {
        let db = db();
        let mut other = sample_trade("t-other");
        other.tenant_id = "tenant-b".to_string();
        db.insert_trade(&sample_trade("t1")).unwrap();
        db.insert_trade(&other).unwrap();

        assert_eq!(db.get_open_trades(None, None).unwrap().len(), 1);
        assert_eq!(db.get_open_trades(None, Some("tenant-b")).unwrap().len(), 1);
    }

    #[test]
    fn count_trades_since_counts_entry_time() {
        let db = db();
        db.insert_trade(&sample_trade("t1")).unwrap();
        db.insert_trade(&sample_trade("t2")).unwrap();
        let past = (Utc::now() - chrono::Duration::hours(1))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        assert_eq!(db.count_trades_since(&past, None).unwrap(), 2);
        let future = (Utc::now() + chrono::Duration::hours(1))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        assert_eq!(db.count_trades_since(&future, None).unwrap(), 0);
    }

    #[test]
    fn webhook_event_dedup() {
        let db = db();
        let first = db
            .mark_signal_event_processed("evt_123", "tradingview", "abc", None)
            .unwrap();
        assert!(first);
        let second = db
            .mark_signal_event_processed("evt_123", "tradingview", "abc", None)
            .unwrap();
        assert!(!second, "duplicate event_id must be a no-op");
        assert!(db.has_processed_signal_event("evt_123").unwrap());
        assert!(!db.has_processed_signal_event("evt_999").unwrap());
    }

    #[test]
    fn stripe_event_dedup() {
        let db = db();
        assert!(db
            .mark_stripe_event_processed("evt_s", "checkout.session.completed", "h")
            .unwrap());
        assert!(!db
            .mark_stripe_event_processed("evt_s", "checkout.session.completed", "h")
            .unwrap());
    }

    #[test]
    fn performance_stats_aggregates() {
        let db = db();
        for (i, pnl) in [10.0, 20.0, -5.0, 15.0, -10.0, 30.0].iter().enumerate() {
            let id = format!("t{i}");
            db.insert_trade(&sample_trade(&id)).unwrap();
            db.close_trade(&id, 50_000.0, *pnl, 0.0, 0.0, 0.0, None).unwrap();
        }
        let stats = db.performance_stats(None).unwrap();
        assert_eq!(stats.total_trades, 6);
        assert_eq!(stats.winning_trades, 4);
        assert_eq!(stats.losing_trades, 2);
        assert!((stats.total_pnl - 60.0).abs() < 1e-9);
        assert!((stats.win_rate - 4.0 / 6.0).abs() < 1e-9);
        assert!(stats.sharpe_ratio > 0.0);
        assert!(stats.sortino_ratio > 0.0);
        assert!(stats.avg_win > 0.0);
        assert!(stats.avg_loss < 0.0);
        assert!(stats.avg_win_loss_ratio() > 0.0);
    }

    #[test]
    fn performance_stats_no_losers_sortino_sentinel() {
        let db = db();
        for i in 0..6 {
            let id = format!("t{i}");
            db.insert_trade(&sample_trade(&id)).unwrap();
            db.close_trade(&id, 50_000.0, 10.0 + i as f64, 0.0, 0.0, 0.0, None)
                .unwrap();
        }
        let stats = db.performance_stats(None).unwrap();
        assert_eq!(stats.sortino_ratio, 999.0);
    }

    #[test]
    fn performance_stats_cached_per_tenant() {
        let db = db();
        db.insert_trade(&sample_trade("t1")).unwrap();
        db.close_trade("t1", 50_000.0, 10.0, 0.0, 0.0, 0.0, None).unwrap();
        let a = db.performance_stats(None).unwrap();
        // Insert another close: the cache was invalidated by close_trade, so
        // this recomputes; but within the TTL with no writes it reuses.
        let b = db.performance_stats(None).unwrap();
        assert_eq!(a.total_trades, b.total_trades);
    }

    #[test]
    fn hourly_stats_grouping() {
        let db = db();
        let mut trade = sample_trade("t1");
        trade.entry_time = "2026-03-01T14:30:00.000000Z".to_string();
        db.insert_trade(&trade).unwrap();
        db.close_trade("t1", 51_000.0, 5.0, 1.0, 0.0, 0.0, None).unwrap();

        let stats = db.hourly_stats(None).unwrap();
        let h14 = stats.get(&14).unwrap();
        assert_eq!(h14.total, 1);
        assert_eq!(h14.wins, 1);
    }

    #[test]
    fn thoughts_and_metrics_roundtrip() {
        let db = db();
        db.log_thought("system", "AUTO-PAUSE: stale_data", "warning", None, None)
            .unwrap();
        db.insert_metric("scan_cycle_ms", 42.0, None).unwrap();
        let thoughts = db.get_thoughts(10).unwrap();
        assert_eq!(thoughts.len(), 1);
        assert!(thoughts[0].message.contains("stale_data"));
        assert_eq!(thoughts[0].severity, "warning");
    }

    #[test]
    fn system_state_roundtrip() {
        let db = db();
        assert!(db.get_state("k").unwrap().is_none());
        db.set_state("k", "v1").unwrap();
        db.set_state("k", "v2").unwrap();
        assert_eq!(db.get_state("k").unwrap(), Some("v2".to_string()));
    }

    #[test]
    fn daily_summary_upserts() {
        let db = db();
        db.insert_trade(&sample_trade("t1")).unwrap();
        db.close_trade("t1", 51_000.0, 5.0, 1.0, 0.0, 0.0, None).unwrap();
        db.update_daily_summary(None).unwrap();
        db.update_daily_summary(None).unwrap(); // second run updates, not duplicates

        let conn = db.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM daily_summary", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn cleanup_purges_old_rows() {
        let db = db();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO metrics (timestamp, metric_name, metric_value)
                 VALUES ('2000-01-01T00:00:00.000000Z', 'old', 1.0)",
                [],
            )
            .unwrap();
        }
        db.insert_metric("fresh", 1.0, None).unwrap();
        db.cleanup_old_data(72).unwrap();

        let conn = db.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM metrics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn legacy_daily_summary_rebuilt() {
        // Simulate a pre-tenant database and re-open it through the
        // migration path.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trading.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE daily_summary (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    date TEXT NOT NULL,
                    total_trades INTEGER DEFAULT 0,
                    winning_trades INTEGER DEFAULT 0,
                    losing_trades INTEGER DEFAULT 0,
                    total_pnl REAL DEFAULT 0.0,
                    max_drawdown REAL DEFAULT 0.0,
                    sharpe_ratio REAL,
                    win_rate REAL,
                    avg_win REAL,
                    avg_loss REAL,
                    best_trade REAL,
                    worst_trade REAL,
                    UNIQUE(date)
                 );
                 INSERT INTO daily_summary (date, total_trades, total_pnl)
                 VALUES ('2026-01-01', 3, 42.0);",
            )
            .unwrap();
        }

        let db = Database::open(&path, "default").unwrap();
        let conn = db.lock().unwrap();
        let (pnl, tenant): (f64, String) = conn
            .query_row(
                "SELECT total_pnl, tenant_id FROM daily_summary WHERE date = '2026-01-01'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(pnl, 42.0);
        assert_eq!(tenant, "default");
        let sql: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE name = 'daily_summary'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(sql.replace(' ', "").to_lowercase().contains("unique(date,tenant_id)"));
    }
}
