//! Position snapshot for the traded instrument.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current signed position. Only the position manager replaces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    /// Signed size: positive long, negative short
    pub size: Decimal,

    /// Volume-weighted entry price, None when flat
    pub entry_price: Option<Decimal>,

    /// Last mark price used for unrealized PnL
    pub mark_price: Option<Decimal>,

    /// Unrealized PnL at the mark
    pub unrealized_pnl: Decimal,

    /// Realized PnL for the session
    pub realized_pnl: Decimal,

    /// |size| / max_position
    pub utilization: Decimal,
}

impl PositionState {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    /// Absolute notional at the mark (or entry when no mark yet).
    pub fn notional(&self) -> Decimal {
        let price = self.mark_price.or(self.entry_price).unwrap_or(Decimal::ZERO);
        self.size.abs() * price
    }
}
