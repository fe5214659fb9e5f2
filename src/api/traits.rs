//! Collaborator interfaces for market data and order execution.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::models::{FillStatus, MarketState, OrderSide, TimeInForce};

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Order as sent to the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Correlation id of the originating intent
    pub client_id: u64,
    pub instrument: String,
    pub side: OrderSide,
    pub size: Decimal,
    /// Limit price; for market orders the protective worst price
    pub limit_price: Decimal,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub is_market: bool,
}

/// Exchange response to a placement.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaceOutcome {
    Accepted { order_id: String },
    Rejected { reason: String },
}

/// Exchange view of one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusReport {
    pub order_id: String,
    pub status: FillStatus,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// Exchange view of the account position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangePosition {
    pub size: Decimal,
    pub entry_price: Option<Decimal>,
}

/// Source of top-of-book snapshots. Must flag stale data.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn current_state(&self, instrument: &str) -> ExchangeResult<MarketState>;
}

/// Authenticated order entry. Calls are throttled by the caller.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<PlaceOutcome>;

    async fn order_status(&self, order_id: &str) -> ExchangeResult<OrderStatusReport>;

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()>;

    /// Cancel every resting order. Returns the ids cancelled.
    async fn cancel_all(&self) -> ExchangeResult<Vec<String>>;

    async fn position(&self, instrument: &str) -> ExchangeResult<ExchangePosition>;
}
