// =============================================================================
// Regime Detection — trend/range and volatility classification
// =============================================================================
//
//   trend_regime: "trend" when ADX >= threshold, else "range"
//   vol_regime:   "high_vol" when ATR/price >= atr_pct_high,
//                 "low_vol" when <= atr_pct_low, else "mid_vol"
//   vol_level:    percentile of current Garman-Klass vol vs rolling window
//   vol_expanding: current GK vol > 1.5x the value 10 bars back

use serde::Serialize;

use crate::config::RegimeConfig;
use crate::indicators::{adx, atr, garman_klass};
use crate::market_data::OhlcvArrays;

#[derive(Debug, Clone, Serialize)]
pub struct RegimeReading {
    pub trend_regime: String,
    pub vol_regime: String,
    pub vol_level: f64,
    pub vol_expanding: bool,
    pub adx: f64,
    pub atr_pct: f64,
}

impl Default for RegimeReading {
    fn default() -> Self {
        Self {
            trend_regime: "range".to_string(),
            vol_regime: "mid_vol".to_string(),
            vol_level: 0.5,
            vol_expanding: false,
            adx: 0.0,
            atr_pct: 0.0,
        }
    }
}

pub fn detect_regime(arrays: &OhlcvArrays, cfg: &RegimeConfig) -> RegimeReading {
    let adx_series = adx(&arrays.highs, &arrays.lows, &arrays.closes, 14);
    let atr_series = atr(&arrays.highs, &arrays.lows, &arrays.closes, 14);

    let adx_val = adx_series
        .last()
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0);
    let atr_val = atr_series
        .last()
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0);
    let price = arrays.closes.last().copied().unwrap_or(0.0);
    let atr_pct = if price > 0.0 { atr_val / price } else { 0.0 };

    let trend_regime = if adx_val >= cfg.adx_trend_threshold {
        "trend"
    } else {
        "range"
    };
    let vol_regime = if atr_pct >= cfg.atr_pct_high {
        "high_vol"
    } else if atr_pct <= cfg.atr_pct_low {
        "low_vol"
    } else {
        "mid_vol"
    };

    // Volatility percentile and expansion from the Garman-Klass series.
    let gk = garman_klass(&arrays.opens, &arrays.highs, &arrays.lows, &arrays.closes, 20);
    let valid: Vec<f64> = gk.iter().copied().filter(|v| v.is_finite()).collect();

    let vol_level = if valid.len() >= 20 {
        let curr = *valid.last().unwrap();
        let lookback: Vec<f64> = valid.iter().rev().take(100).copied().collect();
        let below = lookback.iter().filter(|v| **v < curr).count();
        below as f64 / lookback.len() as f64
    } else {
        0.5
    };

    let vol_expanding = if valid.len() >= 11 {
        let curr = valid[valid.len() - 1];
        let prev = valid[valid.len() - 11];
        prev > 0.0 && curr > 1.5 * prev
    } else {
        false
    };

    RegimeReading {
        trend_regime: trend_regime.to_string(),
        vol_regime: vol_regime.to_string(),
        vol_level,
        vol_expanding,
        adx: adx_val,
        atr_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrays_from_closes(closes: Vec<f64>, range: f64) -> OhlcvArrays {
        let n = closes.len();
        OhlcvArrays {
            times: (0..n).map(|i| i as f64 * 60.0).collect(),
            opens: closes.clone(),
            highs: closes.iter().map(|c| c + range).collect(),
            lows: closes.iter().map(|c| c - range).collect(),
            closes,
            volumes: vec![100.0; n],
        }
    }

    #[test]
    fn strong_trend_detected() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + i as f64).collect();
        let reading = detect_regime(&arrays_from_closes(closes, 1.0), &RegimeConfig::default());
        assert_eq!(reading.trend_regime, "trend");
        assert!(reading.adx >= 25.0);
    }

    #[test]
    fn quiet_range_detected() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 1.1).sin() * 0.05)
            .collect();
        let reading = detect_regime(&arrays_from_closes(closes, 0.05), &RegimeConfig::default());
        assert_eq!(reading.trend_regime, "range");
        assert_eq!(reading.vol_regime, "low_vol");
    }

    #[test]
    fn high_volatility_detected() {
        // Bar range around 6% of price pushes ATR/price over 2%.
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 2.0)
            .collect();
        let reading = detect_regime(&arrays_from_closes(closes, 3.0), &RegimeConfig::default());
        assert_eq!(reading.vol_regime, "high_vol");
    }

    #[test]
    fn short_series_defaults() {
        let closes = vec![100.0; 5];
        let reading = detect_regime(&arrays_from_closes(closes, 1.0), &RegimeConfig::default());
        assert_eq!(reading.trend_regime, "range");
        assert_eq!(reading.vol_level, 0.5);
        assert!(!reading.vol_expanding);
    }

    #[test]
    fn vol_level_in_unit_interval() {
        let closes: Vec<f64> = (0..200)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * (1.0 + i as f64 * 0.01))
            .collect();
        let reading = detect_regime(&arrays_from_closes(closes, 1.5), &RegimeConfig::default());
        assert!((0.0..=1.0).contains(&reading.vol_level));
    }
}
