// =============================================================================
// Scan Queue — bounded, deduplicated, event-driven pair queue
// =============================================================================
//
// The engine enqueues a pair whenever something interesting happens (new 1m
// bar, significant ticker move, fresh REST candle). The scan loop pops with
// an adaptive timeout: a busy event stream shortens the wait, a quiet one
// falls back to the configured scan interval and a full sweep.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::normalize_pair;

const QUEUE_CAPACITY: usize = 100;
/// Event-rate window used for the adaptive timeout.
const EVENT_WINDOW_SECS: u64 = 60;

/// Result of one collect cycle.
#[derive(Debug)]
pub struct ScanBatch {
    pub pairs: Vec<String>,
    /// True when the batch came from queued events, false for a timeout
    /// fallback sweep over the full configured pair list.
    pub from_events: bool,
}

struct EventWindow {
    count: u32,
    started: Instant,
}

pub struct ScanQueue {
    tx: mpsc::Sender<String>,
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    pending: Mutex<HashSet<String>>,
    window: Mutex<EventWindow>,
}

impl ScanQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            pending: Mutex::new(HashSet::new()),
            window: Mutex::new(EventWindow {
                count: 0,
                started: Instant::now(),
            }),
        }
    }

    /// Enqueue a pair for re-scan. Deduplicated: a pair already pending is
    /// dropped silently, as is anything beyond queue capacity.
    pub fn enqueue(&self, pair: &str, reason: &str) {
        let key = normalize_pair(pair);
        {
            let mut pending = self.pending.lock();
            if !pending.insert(key.clone()) {
                return;
            }
        }
        if self.tx.try_send(key.clone()).is_err() {
            self.pending.lock().remove(&key);
            return;
        }
        debug!(pair = %key, reason, "pair enqueued for scan");
    }

    /// Number of events observed in the current one-minute window.
    fn events_per_minute(&self) -> u32 {
        let mut w = self.window.lock();
        if w.started.elapsed().as_secs() > EVENT_WINDOW_SECS {
            w.count = 0;
            w.started = Instant::now();
        }
        w.count
    }

    fn record_event(&self) {
        let mut w = self.window.lock();
        if w.started.elapsed().as_secs() > EVENT_WINDOW_SECS {
            w.count = 0;
            w.started = Instant::now();
        }
        w.count += 1;
    }

    /// Adaptive timeout: high event rate scans faster, quiet markets wait
    /// the full interval.
    pub fn adaptive_timeout(&self, scan_interval: Duration) -> Duration {
        let secs = scan_interval.as_secs().max(1);
        let events = self.events_per_minute();
        let timeout = if events > 20 {
            (secs / 3).max(5)
        } else if events > 5 {
            (secs / 2).max(10)
        } else {
            secs
        };
        Duration::from_secs(timeout)
    }

    /// Wait for the next scan batch.
    ///
    /// Blocks up to the adaptive timeout for the first queued pair, then
    /// drains everything else queued. On timeout, returns `fallback_pairs`
    /// (the full configured pair list) with `from_events = false`.
    pub async fn collect(&self, scan_interval: Duration, fallback_pairs: &[String]) -> ScanBatch {
        let timeout = self.adaptive_timeout(scan_interval);
        let mut rx = self.rx.lock().await;

        let first = tokio::time::timeout(timeout, rx.recv()).await;
        let mut pairs: Vec<String> = Vec::new();
        match first {
            Ok(Some(pair)) => {
                self.record_event();
                pairs.push(pair);
            }
            Ok(None) | Err(_) => {
                return ScanBatch {
                    pairs: fallback_pairs.to_vec(),
                    from_events: false,
                };
            }
        }

        while let Ok(pair) = rx.try_recv() {
            self.record_event();
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }

        let mut pending = self.pending.lock();
        for p in &pairs {
            pending.remove(p);
        }
        drop(pending);

        ScanBatch {
            pairs,
            from_events: true,
        }
    }
}

impl Default for ScanQueue {
    fn default() -> Self {
        Self::new()
    }
}
