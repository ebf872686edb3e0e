// =============================================================================
// Market Data Cache — per-pair OHLCV ring buffers + latest book state
// =============================================================================
//
// The cache is the engine's single source of live market truth. It is
// mutated only by the WS/REST ingestion paths and read by the scan loop and
// read-only endpoints.
//
// Bar acceptance rules:
//   * Bars older than the newest stored bar are rejected (out-of-order).
//   * Bars whose close deviates more than 20% from the median of the last
//     12 closes are rejected (outlier / bad print).
//   * A bar with the same open_time as the newest bar replaces it in place
//     (in-progress update); a strictly newer open_time appends and reports
//     "new bar closed" to the caller.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::book::{BookAnalysis, OrderBookSnapshot};
use crate::types::normalize_pair;

/// Maximum relative deviation from the recent median close before an
/// incoming bar is treated as an outlier.
const OUTLIER_JUMP_PCT: f64 = 0.20;
/// How many recent closes feed the outlier median.
const OUTLIER_WINDOW: usize = 12;

/// A single OHLCV bar. `time` is the bar open in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub vwap: f64,
}

/// Column-oriented snapshot of one pair's bars for indicator work.
#[derive(Debug, Clone, Default)]
pub struct OhlcvArrays {
    pub times: Vec<f64>,
    pub opens: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl OhlcvArrays {
    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    /// Drop the most recent (potentially in-progress) bar.
    pub fn drop_last(&mut self) {
        self.times.pop();
        self.opens.pop();
        self.highs.pop();
        self.lows.pop();
        self.closes.pop();
        self.volumes.pop();
    }
}

struct PairData {
    bars: VecDeque<Bar>,
    warmed_up: bool,
    last_bar_update: Instant,
    ticker_price: f64,
    order_book: Option<OrderBookSnapshot>,
    book_analysis: Option<BookAnalysis>,
}

impl PairData {
    fn new() -> Self {
        Self {
            bars: VecDeque::new(),
            warmed_up: false,
            last_bar_update: Instant::now(),
            ticker_price: 0.0,
            order_book: None,
            book_analysis: None,
        }
    }
}

/// Thread-safe per-pair market data store.
pub struct MarketDataCache {
    pairs: RwLock<HashMap<String, PairData>>,
    max_bars: usize,
    warmup_ready_bars: usize,
}

impl MarketDataCache {
    /// `max_bars` bounds each ring buffer; `warmup_ready_bars` is the bar
    /// count at which a pair is considered warmed up.
    pub fn new(max_bars: usize, warmup_ready_bars: usize) -> Self {
        Self {
            pairs: RwLock::new(HashMap::new()),
            max_bars: max_bars.max(2),
            warmup_ready_bars: warmup_ready_bars.max(1),
        }
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Seed a pair's ring buffer from historical bars. Bars are sorted by
    /// open time and deduplicated; the pair is marked warmed-up when enough
    /// bars landed. Returns the number of bars stored.
    pub fn warmup(&self, pair: &str, mut bars: Vec<Bar>) -> usize {
        let key = normalize_pair(pair);
        bars.retain(|b| b.time.is_finite() && b.close.is_finite());
        bars.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));
        bars.dedup_by(|a, b| a.time == b.time);

        let mut map = self.pairs.write();
        let data = map.entry(key.clone()).or_insert_with(PairData::new);
        data.bars.clear();
        for bar in bars {
            data.bars.push_back(bar);
            if data.bars.len() > self.max_bars {
                data.bars.pop_front();
            }
        }
        data.warmed_up = data.bars.len() >= self.warmup_ready_bars;
        data.last_bar_update = Instant::now();

        debug!(pair = %key, bars = data.bars.len(), warmed_up = data.warmed_up, "pair warmed up");
        data.bars.len()
    }

    /// Append or update the newest bar.
    ///
    /// Returns `true` only when the incoming bar opened a **new** period
    /// (strictly newer open_time than anything stored). Out-of-order and
    /// outlier bars are dropped with a `false` return.
    pub fn update_bar(&self, pair: &str, bar: Bar) -> bool {
        if !bar.time.is_finite() || !bar.close.is_finite() || bar.close <= 0.0 {
            warn!(pair, "malformed bar dropped");
            return false;
        }

        let key = normalize_pair(pair);
        let mut map = self.pairs.write();
        let data = map.entry(key.clone()).or_insert_with(PairData::new);

        if let Some(last) = data.bars.back() {
            if bar.time < last.time {
                debug!(pair = %key, incoming = bar.time, newest = last.time, "out-of-order bar rejected");
                return false;
            }
        }

        // Outlier gate against the median of recent closes.
        if data.bars.len() >= OUTLIER_WINDOW {
            let mut recent: Vec<f64> = data
                .bars
                .iter()
                .rev()
                .take(OUTLIER_WINDOW)
                .map(|b| b.close)
                .collect();
            recent.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let median = recent[recent.len() / 2];
            if median > 0.0 && ((bar.close - median).abs() / median) > OUTLIER_JUMP_PCT {
                warn!(
                    pair = %key,
                    close = bar.close,
                    median,
                    "outlier bar rejected (>20% jump vs recent median)"
                );
                return false;
            }
        }

        data.last_bar_update = Instant::now();

        match data.bars.back_mut() {
            Some(last) if last.time == bar.time => {
                *last = bar;
                false
            }
            _ => {
                data.bars.push_back(bar);
                while data.bars.len() > self.max_bars {
                    data.bars.pop_front();
                }
                if !data.warmed_up && data.bars.len() >= self.warmup_ready_bars {
                    data.warmed_up = true;
                }
                true
            }
        }
    }

    /// Update only the in-progress bar's close from a ticker print. Never
    /// creates bars; extends high/low when the print escapes the bar range.
    pub fn update_latest_close(&self, pair: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let key = normalize_pair(pair);
        let mut map = self.pairs.write();
        if let Some(data) = map.get_mut(&key) {
            data.ticker_price = price;
            if let Some(last) = data.bars.back_mut() {
                last.close = price;
                if price > last.high {
                    last.high = price;
                }
                if price < last.low {
                    last.low = price;
                }
            }
        }
    }

    /// Overwrite the latest ticker price without touching bars.
    pub fn update_ticker(&self, pair: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let key = normalize_pair(pair);
        let mut map = self.pairs.write();
        map.entry(key).or_insert_with(PairData::new).ticker_price = price;
    }

    pub fn update_order_book(&self, pair: &str, book: OrderBookSnapshot) {
        let key = normalize_pair(pair);
        let mut map = self.pairs.write();
        map.entry(key).or_insert_with(PairData::new).order_book = Some(book);
    }

    pub fn update_order_book_analysis(&self, pair: &str, analysis: BookAnalysis) {
        let key = normalize_pair(pair);
        let mut map = self.pairs.write();
        map.entry(key).or_insert_with(PairData::new).book_analysis = Some(analysis);
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn is_warmed_up(&self, pair: &str) -> bool {
        let map = self.pairs.read();
        map.get(&normalize_pair(pair)).map_or(false, |d| d.warmed_up)
    }

    /// True when no bar update landed within `max_age_seconds`.
    pub fn is_stale(&self, pair: &str, max_age_seconds: u64) -> bool {
        let map = self.pairs.read();
        match map.get(&normalize_pair(pair)) {
            Some(d) => d.last_bar_update.elapsed().as_secs() > max_age_seconds,
            None => true,
        }
    }

    pub fn bar_count(&self, pair: &str) -> usize {
        let map = self.pairs.read();
        map.get(&normalize_pair(pair)).map_or(0, |d| d.bars.len())
    }

    /// Latest traded price: ticker if available, else last bar close.
    pub fn latest_price(&self, pair: &str) -> Option<f64> {
        let map = self.pairs.read();
        let data = map.get(&normalize_pair(pair))?;
        if data.ticker_price > 0.0 {
            return Some(data.ticker_price);
        }
        data.bars.back().map(|b| b.close)
    }

    pub fn last_bar_time(&self, pair: &str) -> Option<f64> {
        let map = self.pairs.read();
        map.get(&normalize_pair(pair))?.bars.back().map(|b| b.time)
    }

    /// Column snapshot of the pair's bars.
    pub fn arrays(&self, pair: &str) -> Option<OhlcvArrays> {
        let map = self.pairs.read();
        let data = map.get(&normalize_pair(pair))?;
        let n = data.bars.len();
        let mut out = OhlcvArrays {
            times: Vec::with_capacity(n),
            opens: Vec::with_capacity(n),
            highs: Vec::with_capacity(n),
            lows: Vec::with_capacity(n),
            closes: Vec::with_capacity(n),
            volumes: Vec::with_capacity(n),
        };
        for bar in &data.bars {
            out.times.push(bar.time);
            out.opens.push(bar.open);
            out.highs.push(bar.high);
            out.lows.push(bar.low);
            out.closes.push(bar.close);
            out.volumes.push(bar.volume);
        }
        Some(out)
    }

    pub fn order_book(&self, pair: &str) -> Option<OrderBookSnapshot> {
        let map = self.pairs.read();
        map.get(&normalize_pair(pair))?.order_book.clone()
    }

    pub fn book_analysis(&self, pair: &str) -> Option<BookAnalysis> {
        let map = self.pairs.read();
        map.get(&normalize_pair(pair))?.book_analysis.clone()
    }

    /// Current spread fraction from the latest book, 0.0 when unknown.
    pub fn spread_pct(&self, pair: &str) -> f64 {
        self.order_book(pair)
            .and_then(|b| b.spread_pct())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(time: f64, close: f64) -> Bar {
        Bar {
            time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            vwap: close,
        }
    }

    fn warmed_cache(pair: &str, n: usize) -> MarketDataCache {
        let cache = MarketDataCache::new(500, 10);
        let bars: Vec<Bar> = (0..n).map(|i| bar(i as f64 * 60.0, 100.0)).collect();
        cache.warmup(pair, bars);
        cache
    }

    #[test]
    fn warmup_marks_ready() {
        let cache = warmed_cache("BTC/USD", 12);
        assert!(cache.is_warmed_up("BTC/USD"));
        assert!(cache.is_warmed_up("btc/usd"), "pair lookup is case-insensitive");
        assert_eq!(cache.bar_count("BTC/USD"), 12);
    }

    #[test]
    fn warmup_below_threshold_not_ready() {
        let cache = MarketDataCache::new(500, 100);
        cache.warmup("ETH/USD", (0..20).map(|i| bar(i as f64 * 60.0, 50.0)).collect());
        assert!(!cache.is_warmed_up("ETH/USD"));
    }

    #[test]
    fn new_bar_detection() {
        let cache = warmed_cache("BTC/USD", 12);
        // Same open_time as newest bar: in-place update, not a new bar.
        assert!(!cache.update_bar("BTC/USD", bar(11.0 * 60.0, 101.0)));
        // Strictly newer open_time: new bar.
        assert!(cache.update_bar("BTC/USD", bar(12.0 * 60.0, 101.0)));
        // Replaying it is not a new bar and leaves the count unchanged.
        let before = cache.bar_count("BTC/USD");
        assert!(!cache.update_bar("BTC/USD", bar(12.0 * 60.0, 101.5)));
        assert_eq!(cache.bar_count("BTC/USD"), before);
    }

    #[test]
    fn out_of_order_bar_rejected() {
        let cache = warmed_cache("BTC/USD", 12);
        let before = cache.bar_count("BTC/USD");
        assert!(!cache.update_bar("BTC/USD", bar(5.0 * 60.0, 100.0)));
        assert_eq!(cache.bar_count("BTC/USD"), before);
    }

    #[test]
    fn outlier_bar_rejected() {
        let cache = warmed_cache("BTC/USD", 12);
        let before = cache.bar_count("BTC/USD");
        // 200 vs a median around 100 is a >20% jump.
        assert!(!cache.update_bar("BTC/USD", bar(12.0 * 60.0, 200.0)));
        assert_eq!(cache.bar_count("BTC/USD"), before);
    }

    #[test]
    fn duplicate_updates_idempotent() {
        let cache = warmed_cache("BTC/USD", 12);
        assert!(cache.update_bar("BTC/USD", bar(12.0 * 60.0, 102.0)));
        for _ in 0..5 {
            assert!(!cache.update_bar("BTC/USD", bar(12.0 * 60.0, 102.0)));
        }
        assert_eq!(cache.bar_count("BTC/USD"), 13);
    }

    #[test]
    fn latest_close_updates_in_place() {
        let cache = warmed_cache("BTC/USD", 12);
        cache.update_latest_close("BTC/USD", 105.0);
        let arrays = cache.arrays("BTC/USD").unwrap();
        assert_eq!(*arrays.closes.last().unwrap(), 105.0);
        // High extended to cover the print.
        assert_eq!(*arrays.highs.last().unwrap(), 105.0);
        // No new bar created.
        assert_eq!(cache.bar_count("BTC/USD"), 12);
    }

    #[test]
    fn latest_price_prefers_ticker() {
        let cache = warmed_cache("BTC/USD", 12);
        assert_eq!(cache.latest_price("BTC/USD"), Some(100.0));
        cache.update_ticker("BTC/USD", 107.5);
        assert_eq!(cache.latest_price("BTC/USD"), Some(107.5));
    }

    #[test]
    fn ring_buffer_bounded() {
        let cache = MarketDataCache::new(5, 3);
        for i in 0..20 {
            cache.update_bar("X/USD", bar(i as f64 * 60.0, 100.0));
        }
        assert_eq!(cache.bar_count("X/USD"), 5);
    }

    #[test]
    fn unknown_pair_is_stale() {
        let cache = MarketDataCache::new(10, 3);
        assert!(cache.is_stale("NOPE/USD", 60));
    }

    #[test]
    fn arrays_drop_last() {
        let cache = warmed_cache("BTC/USD", 12);
        let mut arrays = cache.arrays("BTC/USD").unwrap();
        arrays.drop_last();
        assert_eq!(arrays.len(), 11);
    }
}
