//! Exchange collaborators: market data, order entry, and rate limiting.

mod hyperliquid;
mod paper;
mod rate_limiter;
mod traits;

pub use hyperliquid::HyperliquidClient;
pub use paper::{PaperConfig, PaperExchange};
pub use rate_limiter::{RateLimiter, Throttle};
pub use traits::{
    ExchangeClient, ExchangePosition, ExchangeResult, MarketDataSource, OrderRequest,
    OrderStatusReport, PlaceOutcome,
};
