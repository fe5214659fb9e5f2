//! Top-of-book market snapshot for the traded instrument.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Spreads wider than this fraction of mid are treated as a broken book.
pub const MAX_VALID_SPREAD: Decimal = dec!(0.10);

/// One observation of the instrument's top of book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    /// Instrument symbol (e.g., "HYPE")
    pub instrument: String,

    /// Best bid price
    pub best_bid: Decimal,

    /// Best ask price
    pub best_ask: Decimal,

    /// Mid price between bid and ask
    pub mid_price: Decimal,

    /// Traded volume over the recent trade window
    pub recent_volume: Decimal,

    /// Exchange timestamp of the book
    pub timestamp: DateTime<Utc>,

    /// Set when the observation is older than the freshness threshold
    pub is_stale: bool,
}

impl MarketState {
    /// Build a snapshot from bid/ask, deriving the mid.
    pub fn from_top_of_book(
        instrument: impl Into<String>,
        best_bid: Decimal,
        best_ask: Decimal,
        recent_volume: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            best_bid,
            best_ask,
            mid_price: (best_bid + best_ask) / dec!(2),
            recent_volume,
            timestamp,
            is_stale: false,
        }
    }

    /// Absolute spread.
    pub fn spread(&self) -> Decimal {
        self.best_ask - self.best_bid
    }

    /// Spread relative to mid.
    pub fn spread_pct(&self) -> Decimal {
        if self.mid_price.is_zero() {
            return Decimal::ZERO;
        }
        self.spread() / self.mid_price
    }

    /// Prices are positive, ordered, and the spread is sane.
    pub fn is_valid(&self) -> bool {
        self.best_bid > Decimal::ZERO
            && self.best_bid <= self.mid_price
            && self.mid_price <= self.best_ask
            && self.spread_pct() <= MAX_VALID_SPREAD
    }

    /// Valid and not stale: the only kind of state allowed to drive orders.
    pub fn is_tradeable(&self) -> bool {
        !self.is_stale && self.is_valid()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Flag the snapshot stale if it is older than `max_age`.
    pub fn mark_stale_if_older(mut self, max_age: Duration, now: DateTime<Utc>) -> Self {
        if self.age(now) > max_age {
            self.is_stale = true;
        }
        self
    }
}
