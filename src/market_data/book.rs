// =============================================================================
// Order Book Snapshot + Microstructure Analysis
// =============================================================================
//
// The book score is a single [-1, 1] scalar blending order-book imbalance,
// whale (large-level) bias, and spread tightness. Positive = bid pressure.

use serde::{Deserialize, Serialize};

use crate::indicators::order_book_imbalance;

/// Depth levels considered for imbalance.
const OBI_DEPTH: usize = 10;

/// Raw order book snapshot: (price, size) levels, best first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    /// Unix seconds of the snapshot.
    pub updated_at: f64,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|(p, _)| *p)
    }

    /// Spread as a fraction of the midpoint. None without both sides.
    pub fn spread_pct(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let mid = (bid + ask) / 2.0;
        if mid <= 0.0 || ask < bid {
            return None;
        }
        Some((ask - bid) / mid)
    }
}

/// Derived microstructure view of one snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookAnalysis {
    pub obi: f64,
    pub spread_pct: f64,
    pub book_score: f64,
    pub whale_bias: f64,
    pub updated_at: f64,
}

/// Analyze a snapshot into a [`BookAnalysis`].
///
/// * `obi` — imbalance over the top [`OBI_DEPTH`] levels.
/// * `whale_bias` — imbalance computed only over levels whose notional
///   (price * size) is at least `whale_threshold_usd`.
/// * `book_score` — `0.7 * obi + 0.3 * whale_bias`, scaled down when the
///   spread is wide (a wide spread makes book pressure less trustworthy).
pub fn analyze_order_book(book: &OrderBookSnapshot, whale_threshold_usd: f64) -> BookAnalysis {
    let bid_vol: f64 = book.bids.iter().take(OBI_DEPTH).map(|(_, s)| *s).sum();
    let ask_vol: f64 = book.asks.iter().take(OBI_DEPTH).map(|(_, s)| *s).sum();
    let obi = order_book_imbalance(bid_vol, ask_vol);

    let whale_notional = |levels: &[(f64, f64)]| -> f64 {
        levels
            .iter()
            .filter(|(p, s)| p * s >= whale_threshold_usd)
            .map(|(p, s)| p * s)
            .sum()
    };
    let whale_bids = whale_notional(&book.bids);
    let whale_asks = whale_notional(&book.asks);
    let whale_bias = order_book_imbalance(whale_bids, whale_asks);

    let spread_pct = book.spread_pct().unwrap_or(f64::MAX);
    // 1.0 at <=0.05% spread, fading linearly to 0.5 at >=0.5%.
    let tightness = if spread_pct <= 0.0005 {
        1.0
    } else if spread_pct >= 0.005 {
        0.5
    } else {
        1.0 - (spread_pct - 0.0005) / 0.0045 * 0.5
    };

    let book_score = ((0.7 * obi + 0.3 * whale_bias) * tightness).clamp(-1.0, 1.0);

    BookAnalysis {
        obi,
        spread_pct: if spread_pct == f64::MAX { 0.0 } else { spread_pct },
        book_score,
        whale_bias,
        updated_at: book.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(bid_sz: f64, ask_sz: f64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            bids: vec![(100.0, bid_sz), (99.9, bid_sz)],
            asks: vec![(100.1, ask_sz), (100.2, ask_sz)],
            updated_at: 1_700_000_000.0,
        }
    }

    #[test]
    fn bid_heavy_book_scores_positive() {
        let analysis = analyze_order_book(&snapshot(30.0, 10.0), 50_000.0);
        assert!(analysis.obi > 0.0);
        assert!(analysis.book_score > 0.0);
    }

    #[test]
    fn ask_heavy_book_scores_negative() {
        let analysis = analyze_order_book(&snapshot(10.0, 30.0), 50_000.0);
        assert!(analysis.obi < 0.0);
        assert!(analysis.book_score < 0.0);
    }

    #[test]
    fn whale_bias_requires_large_notional() {
        // 100 * 30 = 3,000 USD per level: below a 50k threshold.
        let analysis = analyze_order_book(&snapshot(30.0, 10.0), 50_000.0);
        assert_eq!(analysis.whale_bias, 0.0);

        // Threshold of 1k captures all levels.
        let analysis = analyze_order_book(&snapshot(30.0, 10.0), 1_000.0);
        assert!(analysis.whale_bias > 0.0);
    }

    #[test]
    fn wide_spread_dampens_score() {
        let tight = analyze_order_book(&snapshot(30.0, 10.0), 50_000.0);
        let mut wide_book = snapshot(30.0, 10.0);
        wide_book.asks = vec![(101.0, 10.0)];
        let wide = analyze_order_book(&wide_book, 50_000.0);
        assert!(wide.book_score < tight.book_score);
    }

    #[test]
    fn spread_pct_computed() {
        let book = snapshot(10.0, 10.0);
        let pct = book.spread_pct().unwrap();
        assert!((pct - 0.1 / 100.05).abs() < 1e-9);
    }

    #[test]
    fn empty_book_neutral() {
        let analysis = analyze_order_book(&OrderBookSnapshot::default(), 50_000.0);
        assert_eq!(analysis.obi, 0.0);
        assert_eq!(analysis.book_score, 0.0);
    }
}
