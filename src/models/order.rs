//! Order intents and execution results.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Side that moves a position by a signed `delta`. None for zero.
    pub fn for_delta(delta: Decimal) -> Option<Self> {
        if delta > Decimal::ZERO {
            Some(OrderSide::Buy)
        } else if delta < Decimal::ZERO {
            Some(OrderSide::Sell)
        } else {
            None
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Time-in-force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good-til-cancelled: rests on the book
    Gtc,
    /// Immediate-or-cancel: unfilled remainder is cancelled
    Ioc,
    /// Add-liquidity-only (post-only): rejected if it would cross
    Alo,
}

/// Limit price or market order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderPrice {
    Limit(Decimal),
    Market,
}

/// An order the engine wants placed. Built once per cycle, never reused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderIntent {
    /// Client-assigned id, strictly increasing
    pub correlation_id: u64,
    pub side: OrderSide,
    /// Unsigned requested size in base units
    pub size: Decimal,
    pub price: OrderPrice,
    pub time_in_force: TimeInForce,
    /// May only shrink an existing position
    pub reduce_only: bool,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn market(correlation_id: u64, side: OrderSide, size: Decimal) -> Self {
        Self {
            correlation_id,
            side,
            size,
            price: OrderPrice::Market,
            time_in_force: TimeInForce::Ioc,
            reduce_only: false,
            created_at: Utc::now(),
        }
    }

    pub fn limit(
        correlation_id: u64,
        side: OrderSide,
        size: Decimal,
        price: Decimal,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            correlation_id,
            side,
            size,
            price: OrderPrice::Limit(price),
            time_in_force,
            reduce_only: false,
            created_at: Utc::now(),
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Copy of this intent with a different size.
    pub fn with_size(&self, size: Decimal) -> Self {
        Self {
            size,
            ..self.clone()
        }
    }

    pub fn is_market(&self) -> bool {
        matches!(self.price, OrderPrice::Market)
    }

    pub fn limit_price(&self) -> Option<Decimal> {
        match self.price {
            OrderPrice::Limit(p) => Some(p),
            OrderPrice::Market => None,
        }
    }

    /// Price used for notional and deviation checks: the limit, or `mid` for market orders.
    pub fn reference_price(&self, mid: Decimal) -> Decimal {
        self.limit_price().unwrap_or(mid)
    }

    pub fn notional(&self, mid: Decimal) -> Decimal {
        self.size * self.reference_price(mid)
    }
}

/// Execution status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Unfilled,
    Partial,
    Filled,
    Rejected,
    Cancelled,
}

impl FillStatus {
    /// No further fills can arrive.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FillStatus::Filled | FillStatus::Rejected | FillStatus::Cancelled
        )
    }
}

impl fmt::Display for FillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FillStatus::Unfilled => "unfilled",
            FillStatus::Partial => "partial",
            FillStatus::Filled => "filled",
            FillStatus::Rejected => "rejected",
            FillStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of submitting (or later observing) an order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderResult {
    pub correlation_id: u64,
    /// Absent when rejected before the exchange accepted it
    pub order_id: Option<String>,
    pub status: FillStatus,
    pub side: OrderSide,
    /// Cumulative filled size (unsigned)
    pub filled_size: Decimal,
    /// Average price of the cumulative fill
    pub avg_fill_price: Option<Decimal>,
    pub error: Option<String>,
}

impl OrderResult {
    pub fn rejected(intent: &OrderIntent, order_id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            correlation_id: intent.correlation_id,
            order_id,
            status: FillStatus::Rejected,
            side: intent.side,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            error: Some(reason.into()),
        }
    }

    pub fn unfilled(intent: &OrderIntent, order_id: String) -> Self {
        Self {
            correlation_id: intent.correlation_id,
            order_id: Some(order_id),
            status: FillStatus::Unfilled,
            side: intent.side,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            error: None,
        }
    }

    /// True if any quantity has been confirmed filled.
    pub fn has_fill(&self) -> bool {
        self.filled_size > Decimal::ZERO && self.avg_fill_price.is_some()
    }
}

/// Hands out strictly increasing correlation ids.
#[derive(Debug, Default)]
pub struct CorrelationSequence {
    last: u64,
}

impl CorrelationSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}
