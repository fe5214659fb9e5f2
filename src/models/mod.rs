//! Data models for market state, signals, orders, and positions.

mod market;
mod order;
mod position;
mod signal;

pub use market::MarketState;
pub use order::{CorrelationSequence, FillStatus, OrderIntent, OrderResult, OrderSide, TimeInForce};
pub use position::PositionState;
pub use signal::{Direction, MomentumSignal, PricePoint};
