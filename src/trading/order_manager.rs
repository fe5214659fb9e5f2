//! Order lifecycle: validate, throttle, place, verify, cancel.
//!
//! A submission that is accepted but not confirmed within the fill timeout
//! is returned as unfilled (or partial) and kept as pending. Later cycles
//! pick up its final status through [`OrderExecutor::poll_pending`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ExchangeClient, OrderRequest, OrderStatusReport, PlaceOutcome, Throttle};
use crate::error::{ExchangeError, Result, TradingError};
use crate::models::{FillStatus, MarketState, OrderIntent, OrderResult, OrderSide, TimeInForce};
use crate::trading::order_utils::{
    protective_price, round_price, slippage_for, validate_intent,
};
use crate::trading::{ExecutionConfig, TradingConfig};

/// Executes intents against an exchange.
#[async_trait]
pub trait OrderExecutor: Send {
    /// Submit and wait (bounded) for confirmation.
    async fn submit(&mut self, intent: &OrderIntent, market: &MarketState) -> Result<OrderResult>;

    /// Best-effort cancel of every resting order.
    async fn cancel_all(&mut self) -> Vec<OrderResult>;

    /// Latest status of orders that timed out waiting for confirmation.
    async fn poll_pending(&mut self) -> Vec<OrderResult>;

    fn pending_count(&self) -> usize;
}

enum StatusLookup {
    Found(OrderResult),
    /// The exchange does not know the order id
    Unknown,
}

#[derive(Debug, Clone)]
struct PendingOrder {
    order_id: String,
    last: OrderResult,
}

pub struct OrderManager {
    client: Arc<dyn ExchangeClient>,
    throttle: Arc<dyn Throttle>,
    execution: ExecutionConfig,
    instrument: String,
    size_decimals: u32,
    max_price_deviation: Decimal,
    order_weight: u32,
    pending: BTreeMap<u64, PendingOrder>,
    shutdown: CancellationToken,
}

impl OrderManager {
    pub fn new(
        config: &TradingConfig,
        size_decimals: u32,
        client: Arc<dyn ExchangeClient>,
        throttle: Arc<dyn Throttle>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            throttle,
            execution: config.execution.clone(),
            instrument: config.asset.clone(),
            size_decimals,
            max_price_deviation: config.risk.max_price_deviation,
            order_weight: config.rate_limit.order_weight,
            pending: BTreeMap::new(),
            shutdown,
        }
    }

    fn build_request(&self, intent: &OrderIntent, size: Decimal, market: &MarketState) -> OrderRequest {
        let (limit_price, time_in_force) = match intent.limit_price() {
            Some(price) => (round_price(price, self.size_decimals), intent.time_in_force),
            None => {
                let slippage = slippage_for(market, intent.reduce_only, &self.execution);
                (
                    protective_price(intent.side, market, slippage, self.size_decimals),
                    TimeInForce::Ioc,
                )
            }
        };

        OrderRequest {
            client_id: intent.correlation_id,
            instrument: self.instrument.clone(),
            side: intent.side,
            size,
            limit_price,
            time_in_force,
            reduce_only: intent.reduce_only,
            is_market: intent.is_market(),
        }
    }

    /// Map a collaborator error, feeding exchange-side rate limits to the limiter.
    fn exchange_failure(&self, err: ExchangeError) -> TradingError {
        if err == ExchangeError::RateLimited {
            let cooldown = self.throttle.on_rate_limited();
            return TradingError::RateLimitExceeded {
                reason: "exchange rejected request for rate limit".to_string(),
                retry_after: cooldown,
            };
        }
        TradingError::from(err)
    }

    async fn query_status(
        &self,
        correlation_id: u64,
        side: OrderSide,
        order_id: &str,
    ) -> Result<StatusLookup> {
        self.throttle.acquire(self.order_weight).await?;
        match self.client.order_status(order_id).await {
            Ok(report) => {
                self.throttle.on_success();
                Ok(StatusLookup::Found(to_result(correlation_id, side, report)))
            }
            Err(ExchangeError::NotFound(_)) => Ok(StatusLookup::Unknown),
            Err(e) => Err(self.exchange_failure(e)),
        }
    }

    /// Cancel a single order. True once the exchange confirmed the cancel.
    async fn cancel_one(&self, order_id: &str) -> bool {
        match self.throttle.acquire(self.order_weight).await {
            Ok(()) | Err(TradingError::Cancelled) => {}
            Err(_) => return false,
        }
        match self.client.cancel_order(order_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Order cancel failed");
                false
            }
        }
    }

    async fn await_fill(&mut self, intent: &OrderIntent, order_id: String) -> OrderResult {
        let deadline = Instant::now() + self.execution.fill_timeout();
        let mut last = OrderResult::unfilled(intent, order_id.clone());

        loop {
            match self.query_status(intent.correlation_id, intent.side, &order_id).await {
                Ok(StatusLookup::Found(result)) => last = result,
                Ok(StatusLookup::Unknown) => {
                    debug!(order_id = %order_id, "Order not visible yet");
                }
                Err(e @ (TradingError::RateLimitExceeded { .. } | TradingError::Cancelled)) => {
                    debug!(error = %e, "Stopped waiting for fill");
                    break;
                }
                Err(e) => warn!(order_id = %order_id, error = %e, "Order status unavailable"),
            }

            if last.status.is_terminal() {
                return last;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.execution.fill_poll_interval().min(deadline - now);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(
            correlation_id = intent.correlation_id,
            order_id = %order_id,
            status = %last.status,
            filled = %last.filled_size,
            "Fill not confirmed in time, tracking as pending"
        );
        self.pending.insert(
            intent.correlation_id,
            PendingOrder {
                order_id,
                last: last.clone(),
            },
        );
        last
    }
}

fn to_result(correlation_id: u64, side: OrderSide, report: OrderStatusReport) -> OrderResult {
    OrderResult {
        correlation_id,
        order_id: Some(report.order_id),
        status: report.status,
        side,
        filled_size: report.filled_size,
        avg_fill_price: report.avg_fill_price,
        error: None,
    }
}

#[async_trait]
impl OrderExecutor for OrderManager {
    async fn submit(&mut self, intent: &OrderIntent, market: &MarketState) -> Result<OrderResult> {
        let size = match validate_intent(intent, market, self.size_decimals, self.max_price_deviation) {
            Ok(size) => size,
            Err(issue) => {
                warn!(
                    correlation_id = intent.correlation_id,
                    reason = %issue,
                    "Order rejected by validation"
                );
                return Ok(OrderResult::rejected(intent, None, issue.to_string()));
            }
        };

        let request = self.build_request(intent, size, market);
        self.throttle.acquire(self.order_weight).await?;

        info!(
            correlation_id = intent.correlation_id,
            side = %request.side,
            size = %request.size,
            price = %request.limit_price,
            tif = ?request.time_in_force,
            reduce_only = request.reduce_only,
            "Submitting order"
        );

        let outcome = match self.client.place_order(&request).await {
            Ok(outcome) => outcome,
            Err(ExchangeError::Rejected(reason)) => PlaceOutcome::Rejected { reason },
            Err(e) => return Err(self.exchange_failure(e)),
        };
        self.throttle.on_success();

        match outcome {
            PlaceOutcome::Rejected { reason } => {
                warn!(
                    correlation_id = intent.correlation_id,
                    reason = %reason,
                    "Order rejected by exchange"
                );
                Ok(OrderResult::rejected(intent, None, reason))
            }
            PlaceOutcome::Accepted { order_id } => {
                debug!(correlation_id = intent.correlation_id, order_id = %order_id, "Order accepted");
                Ok(self.await_fill(intent, order_id).await)
            }
        }
    }

    async fn cancel_all(&mut self) -> Vec<OrderResult> {
        let may_call = match self.throttle.acquire(self.order_weight).await {
            // Shutdown still gets its cancel.
            Ok(()) | Err(TradingError::Cancelled) => true,
            Err(e) => {
                warn!(error = %e, "Cancel-all throttled, skipping exchange call");
                false
            }
        };

        let mut bulk_cancelled = false;
        if may_call {
            match self.client.cancel_all().await {
                Ok(ids) => {
                    info!(count = ids.len(), "Cancelled resting orders");
                    bulk_cancelled = true;
                }
                Err(e) => warn!(error = %e, "Cancel-all failed, cancelling tracked orders one by one"),
            }
        }

        let ids: Vec<u64> = self.pending.keys().copied().collect();
        let mut results = Vec::with_capacity(ids.len());
        for correlation_id in ids {
            let Some(order) = self.pending.get(&correlation_id).cloned() else {
                continue;
            };

            let cancelled = bulk_cancelled || (may_call && self.cancel_one(&order.order_id).await);
            let observed = self
                .query_status(correlation_id, order.last.side, &order.order_id)
                .await;

            match observed {
                Ok(StatusLookup::Found(mut result)) => {
                    if !result.status.is_terminal() && cancelled {
                        result.status = FillStatus::Cancelled;
                    }
                    if result.status.is_terminal() {
                        self.pending.remove(&correlation_id);
                    } else if let Some(entry) = self.pending.get_mut(&correlation_id) {
                        warn!(correlation_id, "Order still live after failed cancel, keeping it tracked");
                        entry.last = result.clone();
                    }
                    results.push(result);
                }
                Ok(StatusLookup::Unknown) => {
                    warn!(correlation_id, "Pending order unknown to exchange, dropping");
                    self.pending.remove(&correlation_id);
                }
                Err(e) => {
                    // Without a final status the fill size is unknown.
                    warn!(correlation_id, error = %e, "Cancel status unavailable, keeping order tracked");
                }
            }
        }
        results
    }

    async fn poll_pending(&mut self) -> Vec<OrderResult> {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        let mut results = Vec::new();

        for correlation_id in ids {
            let Some(order) = self.pending.get(&correlation_id).cloned() else {
                continue;
            };

            match self
                .query_status(correlation_id, order.last.side, &order.order_id)
                .await
            {
                Ok(StatusLookup::Found(result)) => {
                    if result.status.is_terminal() {
                        self.pending.remove(&correlation_id);
                        info!(
                            correlation_id,
                            status = %result.status,
                            filled = %result.filled_size,
                            "Pending order resolved"
                        );
                    } else if let Some(entry) = self.pending.get_mut(&correlation_id) {
                        entry.last = result.clone();
                    }
                    results.push(result);
                }
                Err(e @ (TradingError::RateLimitExceeded { .. } | TradingError::Cancelled)) => {
                    debug!(error = %e, "Deferring pending order reconciliation");
                    break;
                }
                Ok(StatusLookup::Unknown) => {
                    warn!(correlation_id, "Pending order unknown to exchange, dropping");
                    self.pending.remove(&correlation_id);
                }
                Err(e) => warn!(correlation_id, error = %e, "Pending order status unavailable"),
            }
        }
        results
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
