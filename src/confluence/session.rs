// =============================================================================
// Session Analyzer — hour-of-day confidence multiplier
// =============================================================================
//
// Computes a per-UTC-hour multiplier (max_penalty..max_boost) from historical
// hourly win rates. Strong hours get a modest confidence boost, weak hours a
// penalty. Hours with too few trades stay neutral at 1.0. The table is
// refreshed from the database at most once per hour.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::info;

/// Aggregated trade outcome for one UTC hour.
#[derive(Debug, Clone, Copy, Default)]
pub struct HourlyStat {
    pub total: u32,
    pub wins: u32,
}

const REFRESH_INTERVAL_SECS: u64 = 3600;

pub struct SessionAnalyzer {
    min_trades: u32,
    max_boost: f64,
    max_penalty: f64,
    cache: Mutex<[f64; 24]>,
    last_refresh: Mutex<Option<Instant>>,
}

impl SessionAnalyzer {
    pub fn new(min_trades: u32, max_boost: f64, max_penalty: f64) -> Self {
        Self {
            min_trades,
            max_boost,
            max_penalty,
            cache: Mutex::new([1.0; 24]),
            last_refresh: Mutex::new(None),
        }
    }

    /// True when the cached table is older than the refresh interval.
    pub fn needs_refresh(&self) -> bool {
        match *self.last_refresh.lock() {
            Some(at) => at.elapsed().as_secs() > REFRESH_INTERVAL_SECS,
            None => true,
        }
    }

    /// Recompute multipliers from per-hour stats.
    ///
    /// Linear interpolation: win rate 0.50 is neutral, 0.80+ maps to the
    /// full boost, 0.25- maps to the full penalty.
    pub fn refresh(&self, stats: &HashMap<u32, HourlyStat>) {
        let mut table = [1.0_f64; 24];
        for (hour, mult) in table.iter_mut().enumerate() {
            let entry = stats.get(&(hour as u32));
            let Some(entry) = entry else { continue };
            if entry.total < self.min_trades {
                continue;
            }
            let win_rate = entry.wins as f64 / entry.total as f64;
            *mult = if win_rate >= 0.50 {
                let t = ((win_rate - 0.50) / 0.30).min(1.0);
                1.0 + t * (self.max_boost - 1.0)
            } else {
                let t = ((0.50 - win_rate) / 0.25).min(1.0);
                1.0 - t * (1.0 - self.max_penalty)
            };
        }

        *self.cache.lock() = table;
        *self.last_refresh.lock() = Some(Instant::now());

        let non_neutral: Vec<(usize, f64)> = table
            .iter()
            .enumerate()
            .filter(|(_, m)| (**m - 1.0).abs() > 1e-9)
            .map(|(h, m)| (h, *m))
            .collect();
        if !non_neutral.is_empty() {
            info!(hours = ?non_neutral, "session multipliers refreshed");
        }
    }

    /// Confidence multiplier for a UTC hour.
    pub fn multiplier(&self, hour: u32) -> f64 {
        self.cache.lock()[(hour % 24) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> SessionAnalyzer {
        SessionAnalyzer::new(5, 1.15, 0.70)
    }

    #[test]
    fn unknown_hour_is_neutral() {
        let a = analyzer();
        a.refresh(&HashMap::new());
        for hour in 0..24 {
            assert_eq!(a.multiplier(hour), 1.0);
        }
    }

    #[test]
    fn few_trades_stays_neutral() {
        let a = analyzer();
        let mut stats = HashMap::new();
        stats.insert(9, HourlyStat { total: 3, wins: 3 });
        a.refresh(&stats);
        assert_eq!(a.multiplier(9), 1.0);
    }

    #[test]
    fn strong_hour_boosted() {
        let a = analyzer();
        let mut stats = HashMap::new();
        stats.insert(14, HourlyStat { total: 20, wins: 16 }); // 80% WR
        a.refresh(&stats);
        assert!((a.multiplier(14) - 1.15).abs() < 1e-9);
    }

    #[test]
    fn weak_hour_penalized() {
        let a = analyzer();
        let mut stats = HashMap::new();
        stats.insert(3, HourlyStat { total: 20, wins: 4 }); // 20% WR
        a.refresh(&stats);
        assert!((a.multiplier(3) - 0.70).abs() < 1e-9);
    }

    #[test]
    fn fifty_percent_is_neutral() {
        let a = analyzer();
        let mut stats = HashMap::new();
        stats.insert(7, HourlyStat { total: 10, wins: 5 });
        a.refresh(&stats);
        assert!((a.multiplier(7) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn interpolation_between_bounds() {
        let a = analyzer();
        let mut stats = HashMap::new();
        stats.insert(10, HourlyStat { total: 20, wins: 13 }); // 65% WR: half-way
        a.refresh(&stats);
        let m = a.multiplier(10);
        assert!(m > 1.0 && m < 1.15);
    }

    #[test]
    fn hour_wraps_modulo_24() {
        let a = analyzer();
        let mut stats = HashMap::new();
        stats.insert(1, HourlyStat { total: 20, wins: 16 });
        a.refresh(&stats);
        assert_eq!(a.multiplier(25), a.multiplier(1));
    }

    #[test]
    fn needs_refresh_initially() {
        assert!(analyzer().needs_refresh());
    }
}
