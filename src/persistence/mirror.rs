// =============================================================================
// Analytics Mirror — bounded, lossy, write-only side channel
// =============================================================================
//
// Non-canonical sink for analytics consumers (dashboards, offline research).
// Every document is stamped canonical_source="sqlite" so a downstream reader
// can never mistake mirrored rows for the ledger. Ledger doc types (trades,
// positions, backtest_runs) are write-only here: this module exposes no read
// API at all.
//
// The buffer is bounded; on overflow the OLDEST document is dropped and a
// counter incremented. Losing analytics rows is acceptable, blocking the
// trading path is not.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Default buffer bound.
const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorDoc {
    pub doc_type: String,
    pub body: Value,
}

pub struct AnalyticsMirror {
    capacity: usize,
    buffer: Mutex<VecDeque<MirrorDoc>>,
    dropped_docs: AtomicU64,
}

impl AnalyticsMirror {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::new()),
            dropped_docs: AtomicU64::new(0),
        }
    }

    /// Queue one document for the analytics backend. Never blocks; drops the
    /// oldest buffered doc when full.
    pub fn write(&self, doc_type: &str, mut body: Value) {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("canonical_source".to_string(), json!("sqlite"));
            obj.insert("analytics_mirror".to_string(), json!(true));
        } else {
            body = json!({
                "canonical_source": "sqlite",
                "analytics_mirror": true,
                "value": body,
            });
        }

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            let dropped = self.dropped_docs.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                warn!(dropped, "analytics mirror overflow; dropping oldest docs");
            }
        }
        buffer.push_back(MirrorDoc {
            doc_type: doc_type.to_string(),
            body,
        });
    }

    /// Convenience: mirror a trade lifecycle event.
    pub fn write_trade_event(&self, event: &str, trade_id: &str, pair: &str, detail: Value) {
        self.write(
            "trades",
            json!({
                "event": event,
                "trade_id": trade_id,
                "pair": pair,
                "detail": detail,
            }),
        );
    }

    /// Drain up to `max` buffered docs for shipping. This is the transport
    /// hook, not a query interface: documents leave the process and are gone.
    pub fn drain(&self, max: usize) -> Vec<MirrorDoc> {
        let mut buffer = self.buffer.lock();
        let n = buffer.len().min(max);
        let out: Vec<MirrorDoc> = buffer.drain(..n).collect();
        if !out.is_empty() {
            debug!(count = out.len(), "analytics docs drained for shipping");
        }
        out
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn dropped_docs(&self) -> u64 {
        self.dropped_docs.load(Ordering::Relaxed)
    }
}

impl Default for AnalyticsMirror {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
