// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the
// strategy set. Every series-returning function yields a Vec aligned with its
// input, with NaN in positions where the indicator has not converged, so
// callers are forced to handle warm-up and numerical-edge-case scenarios.
// Given identical inputs the outputs are bit-for-bit reproducible.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod book;
pub mod ichimoku;
pub mod keltner;
pub mod levels;
pub mod ma;
pub mod macd;
pub mod momentum;
pub mod rsi;
pub mod stochastic;
pub mod supertrend;
pub mod volatility;

pub use adx::adx;
pub use atr::atr;
pub use bollinger::bollinger_bands;
pub use book::order_book_imbalance;
pub use ichimoku::ichimoku;
pub use keltner::keltner_channels;
pub use levels::compute_sl_tp;
pub use ma::{ema, sma};
pub use macd::macd;
pub use momentum::{momentum, volume_ratio};
pub use rsi::rsi;
pub use stochastic::stochastic;
pub use supertrend::supertrend;
pub use volatility::garman_klass;

/// Last element of a series, or NaN when empty.
pub fn last(series: &[f64]) -> f64 {
    series.last().copied().unwrap_or(f64::NAN)
}

/// Last element that is finite, scanning backwards. NaN when none.
pub fn last_finite(series: &[f64]) -> f64 {
    series
        .iter()
        .rev()
        .copied()
        .find(|v| v.is_finite())
        .unwrap_or(f64::NAN)
}
