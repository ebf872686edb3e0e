// =============================================================================
// Feature Extraction — fixed-order feature dict from a confluence signal
// =============================================================================
//
// The same names feed the batch trainer, the batch predictor, and the online
// learner; the predictor reorders incoming features to match the trained
// ordering, so names are the contract, not positions.

use std::collections::HashMap;

use crate::confluence::ConfluenceSignal;

/// Canonical feature names.
pub const FEATURE_NAMES: &[&str] = &[
    "strength",
    "confidence",
    "confluence_count",
    "obi",
    "book_score",
    "obi_agrees",
    "is_sure_fire",
    "hour_of_day",
    "spread_pct",
    "vol_level",
    "vol_expanding",
    "sl_distance_pct",
    "tp_distance_pct",
    "timeframe_agreement",
];

/// Build the prediction feature dict for one confluence signal.
///
/// `spread_pct` comes from the live order book; `hour_utc` from the wall
/// clock (injected for determinism in tests).
pub fn build_features(
    signal: &ConfluenceSignal,
    spread_pct: f64,
    hour_utc: u32,
) -> HashMap<String, f64> {
    let entry = signal.entry_price;
    let sl_distance_pct = if entry > 0.0 && signal.stop_loss > 0.0 {
        (entry - signal.stop_loss).abs() / entry
    } else {
        0.0
    };
    let tp_distance_pct = if entry > 0.0 && signal.take_profit > 0.0 {
        (signal.take_profit - entry).abs() / entry
    } else {
        0.0
    };

    let mut out = HashMap::with_capacity(FEATURE_NAMES.len());
    out.insert("strength".to_string(), signal.strength);
    out.insert("confidence".to_string(), signal.confidence);
    out.insert("confluence_count".to_string(), signal.confluence_count as f64);
    out.insert("obi".to_string(), signal.obi);
    out.insert("book_score".to_string(), signal.book_score);
    out.insert("obi_agrees".to_string(), signal.obi_agrees as u8 as f64);
    out.insert("is_sure_fire".to_string(), signal.is_sure_fire as u8 as f64);
    out.insert("hour_of_day".to_string(), (hour_utc % 24) as f64);
    out.insert("spread_pct".to_string(), spread_pct.max(0.0));
    out.insert("vol_level".to_string(), signal.vol_level);
    out.insert(
        "vol_expanding".to_string(),
        signal.vol_expanding as u8 as f64,
    );
    out.insert("sl_distance_pct".to_string(), sl_distance_pct);
    out.insert("tp_distance_pct".to_string(), tp_distance_pct);
    out.insert(
        "timeframe_agreement".to_string(),
        signal.timeframe_agreement as f64,
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalDirection;

    fn sample_signal() -> ConfluenceSignal {
        let mut sig = ConfluenceSignal::neutral("BTC/USD");
        sig.direction = SignalDirection::Long;
        sig.strength = 0.7;
        sig.confidence = 0.65;
        sig.confluence_count = 3;
        sig.obi = 0.2;
        sig.book_score = 0.3;
        sig.obi_agrees = true;
        sig.is_sure_fire = true;
        sig.entry_price = 100.0;
        sig.stop_loss = 98.0;
        sig.take_profit = 104.0;
        sig.vol_level = 0.6;
        sig.timeframe_agreement = 2;
        sig
    }

    #[test]
    fn all_names_present() {
        let features = build_features(&sample_signal(), 0.001, 14);
        for name in FEATURE_NAMES {
            assert!(features.contains_key(*name), "missing feature {name}");
        }
        assert_eq!(features.len(), FEATURE_NAMES.len());
    }

    #[test]
    fn distances_are_fractions_of_entry() {
        let features = build_features(&sample_signal(), 0.001, 14);
        assert!((features["sl_distance_pct"] - 0.02).abs() < 1e-12);
        assert!((features["tp_distance_pct"] - 0.04).abs() < 1e-12);
    }

    #[test]
    fn booleans_encode_as_01() {
        let features = build_features(&sample_signal(), 0.001, 14);
        assert_eq!(features["obi_agrees"], 1.0);
        assert_eq!(features["is_sure_fire"], 1.0);
        assert_eq!(features["vol_expanding"], 0.0);
    }

    #[test]
    fn hour_wraps() {
        let features = build_features(&sample_signal(), 0.001, 26);
        assert_eq!(features["hour_of_day"], 2.0);
    }

    #[test]
    fn zero_entry_gives_zero_distances() {
        let mut sig = sample_signal();
        sig.entry_price = 0.0;
        let features = build_features(&sig, 0.001, 0);
        assert_eq!(features["sl_distance_pct"], 0.0);
        assert_eq!(features["tp_distance_pct"], 0.0);
    }
}
