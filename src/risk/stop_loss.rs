// =============================================================================
// Stop-Loss State Machine — INITIAL -> BREAKEVEN -> TRAILING
// =============================================================================
//
// One state per open trade, created at open, mutated by the position
// management loop, destroyed on close.
//
//   INITIAL    SL at the provided level; peak = entry.
//   BREAKEVEN  entered at +breakeven_activation_pct unrealized return;
//              SL snaps to the fee-adjusted entry.
//   TRAILING   entered at +trailing_activation_pct; SL rides the peak at
//              trailing_step_pct distance.
//
// The stop only ever moves favorably: for longs it never goes down, for
// shorts it never goes up.

use serde::{Deserialize, Serialize};

use crate::types::TradeSide;

/// Tunables for the state machine, lifted from the risk config.
#[derive(Debug, Clone, Copy)]
pub struct StopLossParams {
    pub breakeven_activation_pct: f64,
    pub trailing_activation_pct: f64,
    pub trailing_step_pct: f64,
    /// Round-trip fee fraction used to adjust the breakeven stop so a
    /// breakeven exit actually nets zero.
    pub round_trip_fee_pct: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StopLossState {
    pub side: TradeSide,
    pub entry_price: f64,
    pub current_sl: f64,
    pub peak_price: f64,
    pub breakeven_activated: bool,
    pub trailing_activated: bool,
}

impl StopLossState {
    pub fn new(entry_price: f64, initial_sl: f64, side: TradeSide) -> Self {
        Self {
            side,
            entry_price,
            current_sl: initial_sl,
            peak_price: entry_price,
            breakeven_activated: false,
            trailing_activated: false,
        }
    }

    /// Unrealized return at `price`, signed so profit is positive for both
    /// sides.
    pub fn unrealized_return(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price
    }

    /// Advance the state machine with a fresh price. Returns `true` when the
    /// stop moved.
    pub fn update(&mut self, price: f64, params: &StopLossParams) -> bool {
        if price <= 0.0 || !price.is_finite() {
            return false;
        }

        // Peak tracking: highest price seen for longs, lowest for shorts.
        match self.side {
            TradeSide::Buy if price > self.peak_price => self.peak_price = price,
            TradeSide::Sell if price < self.peak_price => self.peak_price = price,
            _ => {}
        }

        let ret = self.unrealized_return(price);
        let before = self.current_sl;

        if !self.breakeven_activated && ret >= params.breakeven_activation_pct {
            self.breakeven_activated = true;
            let fee_adjust = params.round_trip_fee_pct.max(0.0);
            let breakeven = match self.side {
                TradeSide::Buy => self.entry_price * (1.0 + fee_adjust),
                TradeSide::Sell => self.entry_price * (1.0 - fee_adjust),
            };
            self.apply_candidate(breakeven);
        }

        if ret >= params.trailing_activation_pct {
            self.trailing_activated = true;
        }
        if self.trailing_activated {
            let candidate = match self.side {
                TradeSide::Buy => self.peak_price * (1.0 - params.trailing_step_pct),
                TradeSide::Sell => self.peak_price * (1.0 + params.trailing_step_pct),
            };
            self.apply_candidate(candidate);
        }

        (self.current_sl - before).abs() > f64::EPSILON
    }

    /// Move the stop only if the candidate is favorable.
    fn apply_candidate(&mut self, candidate: f64) {
        match self.side {
            TradeSide::Buy if candidate > self.current_sl => self.current_sl = candidate,
            TradeSide::Sell if candidate < self.current_sl => self.current_sl = candidate,
            _ => {}
        }
    }

    /// Whether `price` has crossed the stop.
    pub fn stop_hit(&self, price: f64) -> bool {
        if self.current_sl <= 0.0 {
            return false;
        }
        match self.side {
            TradeSide::Buy => price <= self.current_sl,
            TradeSide::Sell => price >= self.current_sl,
        }
    }
}
