//! Paper exchange: simulated order entry against live top-of-book data.
//!
//! Marketable orders fill in full at the touch (no depth model). Resting
//! orders fill at their limit once the book crosses them, checked whenever
//! their status is queried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::models::{FillStatus, MarketState, OrderSide, TimeInForce};

use super::{
    ExchangeClient, ExchangePosition, ExchangeResult, MarketDataSource, OrderRequest,
    OrderStatusReport, PlaceOutcome,
};

/// Paper account configuration.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Account equity in USD
    pub initial_equity: Decimal,

    /// Notional allowed per unit of equity
    pub leverage: u32,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_equity: dec!(10000),
            leverage: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    status: FillStatus,
    filled_size: Decimal,
    avg_fill_price: Option<Decimal>,
}

impl PaperOrder {
    fn report(&self, order_id: &str) -> OrderStatusReport {
        OrderStatusReport {
            order_id: order_id.to_string(),
            status: self.status,
            filled_size: self.filled_size,
            avg_fill_price: self.avg_fill_price,
        }
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    orders: HashMap<String, PaperOrder>,
    position: Decimal,
    entry_price: Option<Decimal>,
}

impl PaperBook {
    fn apply_fill(&mut self, side: OrderSide, size: Decimal, price: Decimal) {
        let qty = size * side.sign();
        let new_size = self.position + qty;
        let extending = self.position.is_zero() || self.position.is_sign_positive() == qty.is_sign_positive();

        self.entry_price = if new_size.is_zero() {
            None
        } else if extending {
            let entry = self.entry_price.unwrap_or(price);
            Some((self.position.abs() * entry + size * price) / new_size.abs())
        } else if new_size.is_sign_positive() == self.position.is_sign_positive() {
            self.entry_price
        } else {
            Some(price)
        };
        self.position = new_size;
    }
}

/// Simulated exchange.
pub struct PaperExchange {
    config: PaperConfig,
    market: Arc<dyn MarketDataSource>,
    instrument: String,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig, market: Arc<dyn MarketDataSource>, instrument: &str) -> Self {
        Self {
            config,
            market,
            instrument: instrument.to_string(),
            book: Mutex::new(PaperBook::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn max_notional(&self) -> Decimal {
        self.config.initial_equity * Decimal::from(self.config.leverage)
    }

    /// Touch price if the order can trade now.
    fn marketable_price(request: &OrderRequest, market: &MarketState) -> Option<Decimal> {
        match request.side {
            OrderSide::Buy if market.best_ask <= request.limit_price => Some(market.best_ask),
            OrderSide::Sell if market.best_bid >= request.limit_price => Some(market.best_bid),
            _ => None,
        }
    }

    /// Resting-order fill at the limit once the book trades through it.
    fn crossed(request: &OrderRequest, market: &MarketState) -> bool {
        match request.side {
            OrderSide::Buy => market.best_ask <= request.limit_price,
            OrderSide::Sell => market.best_bid >= request.limit_price,
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<PlaceOutcome> {
        if request.instrument != self.instrument {
            return Err(ExchangeError::Rejected(format!(
                "paper account trades {} only, got {}",
                self.instrument, request.instrument
            )));
        }
        let market = self.market.current_state(&self.instrument).await?;
        if !market.is_valid() {
            return Ok(PlaceOutcome::Rejected {
                reason: "no valid market".to_string(),
            });
        }

        let mut book = self.lock();
        let mut size = request.size;

        if request.reduce_only {
            let reduces = !book.position.is_zero()
                && book.position.is_sign_positive() != request.side.sign().is_sign_positive();
            if !reduces {
                return Ok(PlaceOutcome::Rejected {
                    reason: "reduce only order would increase position".to_string(),
                });
            }
            size = size.min(book.position.abs());
        } else {
            let after = (book.position + size * request.side.sign()).abs();
            if after * market.mid_price > self.max_notional() {
                return Ok(PlaceOutcome::Rejected {
                    reason: "insufficient margin".to_string(),
                });
            }
        }

        let touch = Self::marketable_price(request, &market);
        if request.time_in_force == TimeInForce::Alo && touch.is_some() {
            return Ok(PlaceOutcome::Rejected {
                reason: "post only order would have immediately matched".to_string(),
            });
        }

        let order_id = Uuid::new_v4().to_string();
        let mut order = PaperOrder {
            request: OrderRequest {
                size,
                ..request.clone()
            },
            status: FillStatus::Unfilled,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
        };

        match touch {
            Some(price) => {
                book.apply_fill(request.side, size, price);
                order.status = FillStatus::Filled;
                order.filled_size = size;
                order.avg_fill_price = Some(price);
                info!(
                    order_id = %order_id,
                    side = %request.side,
                    size = %size,
                    price = %price,
                    "Paper fill"
                );
            }
            None if request.time_in_force == TimeInForce::Ioc => {
                order.status = FillStatus::Cancelled;
                debug!(order_id = %order_id, "Paper IOC not marketable, cancelled");
            }
            None => {
                debug!(order_id = %order_id, price = %request.limit_price, "Paper order resting");
            }
        }

        book.orders.insert(order_id.clone(), order);
        Ok(PlaceOutcome::Accepted { order_id })
    }

    async fn order_status(&self, order_id: &str) -> ExchangeResult<OrderStatusReport> {
        let market = self.market.current_state(&self.instrument).await?;
        let mut book = self.lock();

        let order = book
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(order_id.to_string()))?;

        if order.status == FillStatus::Unfilled && market.is_valid() && Self::crossed(&order.request, &market) {
            let price = order.request.limit_price;
            book.apply_fill(order.request.side, order.request.size, price);
            let filled = PaperOrder {
                status: FillStatus::Filled,
                filled_size: order.request.size,
                avg_fill_price: Some(price),
                ..order
            };
            let report = filled.report(order_id);
            book.orders.insert(order_id.to_string(), filled);
            info!(order_id = %order_id, price = %price, "Paper resting order filled");
            return Ok(report);
        }

        Ok(order.report(order_id))
    }

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
        let mut book = self.lock();
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::NotFound(order_id.to_string()))?;
        if !order.status.is_terminal() {
            order.status = FillStatus::Cancelled;
        }
        Ok(())
    }

    async fn cancel_all(&self) -> ExchangeResult<Vec<String>> {
        let mut book = self.lock();
        let mut cancelled = Vec::new();
        for (id, order) in book.orders.iter_mut() {
            if !order.status.is_terminal() {
                order.status = FillStatus::Cancelled;
                cancelled.push(id.clone());
            }
        }
        Ok(cancelled)
    }

    async fn position(&self, instrument: &str) -> ExchangeResult<ExchangePosition> {
        if instrument != self.instrument {
            return Ok(ExchangePosition::default());
        }
        let book = self.lock();
        Ok(ExchangePosition {
            size: book.position,
            entry_price: book.entry_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct FixedMarket(Mutex<MarketState>);

    impl FixedMarket {
        fn new(bid: Decimal, ask: Decimal) -> Arc<Self> {
            Arc::new(Self(Mutex::new(MarketState::from_top_of_book(
                "HYPE",
                bid,
                ask,
                dec!(0),
                Utc::now(),
            ))))
        }

        fn set(&self, bid: Decimal, ask: Decimal) {
            *self.0.lock().unwrap() =
                MarketState::from_top_of_book("HYPE", bid, ask, dec!(0), Utc::now());
        }
    }

    #[async_trait]
    impl MarketDataSource for FixedMarket {
        async fn current_state(&self, _instrument: &str) -> ExchangeResult<MarketState> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn request(side: OrderSide, size: Decimal, limit: Decimal, tif: TimeInForce) -> OrderRequest {
        OrderRequest {
            client_id: 1,
            instrument: "HYPE".to_string(),
            side,
            size,
            limit_price: limit,
            time_in_force: tif,
            reduce_only: false,
            is_market: tif == TimeInForce::Ioc,
        }
    }

    fn accepted(outcome: PlaceOutcome) -> String {
        match outcome {
            PlaceOutcome::Accepted { order_id } => order_id,
            PlaceOutcome::Rejected { reason } => panic!("rejected: {}", reason),
        }
    }

    #[tokio::test]
    async fn test_ioc_fills_at_touch() {
        let market = FixedMarket::new(dec!(99.9), dec!(100.1));
        let ex = PaperExchange::new(PaperConfig::default(), market, "HYPE");

        let id = accepted(ex.place_order(&request(OrderSide::Buy, dec!(2), dec!(101), TimeInForce::Ioc)).await.unwrap());
        let report = ex.order_status(&id).await.unwrap();
        assert_eq!(report.status, FillStatus::Filled);
        assert_eq!(report.avg_fill_price, Some(dec!(100.1)));
        assert_eq!(ex.position("HYPE").await.unwrap().size, dec!(2));
    }

    #[tokio::test]
    async fn test_post_only_cross_rejected() {
        let market = FixedMarket::new(dec!(99.9), dec!(100.1));
        let ex = PaperExchange::new(PaperConfig::default(), market, "HYPE");

        let outcome = ex
            .place_order(&request(OrderSide::Buy, dec!(1), dec!(100.2), TimeInForce::Alo))
            .await
            .unwrap();
        assert!(matches!(outcome, PlaceOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_resting_order_fills_when_crossed() {
        let market = FixedMarket::new(dec!(99.9), dec!(100.1));
        let ex = PaperExchange::new(PaperConfig::default(), market.clone(), "HYPE");

        let id = accepted(ex.place_order(&request(OrderSide::Buy, dec!(1), dec!(99.9), TimeInForce::Alo)).await.unwrap());
        assert_eq!(ex.order_status(&id).await.unwrap().status, FillStatus::Unfilled);

        market.set(dec!(99.7), dec!(99.8));
        let report = ex.order_status(&id).await.unwrap();
        assert_eq!(report.status, FillStatus::Filled);
        assert_eq!(report.avg_fill_price, Some(dec!(99.9)));
    }

    #[tokio::test]
    async fn test_insufficient_margin_rejected() {
        let market = FixedMarket::new(dec!(99.9), dec!(100.1));
        let config = PaperConfig {
            initial_equity: dec!(100),
            leverage: 2,
        };
        let ex = PaperExchange::new(config, market, "HYPE");

        let outcome = ex
            .place_order(&request(OrderSide::Sell, dec!(3), dec!(90), TimeInForce::Ioc))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PlaceOutcome::Rejected {
                reason: "insufficient margin".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_reduce_only_and_cancel_all() {
        let market = FixedMarket::new(dec!(99.9), dec!(100.1));
        let ex = PaperExchange::new(PaperConfig::default(), market, "HYPE");

        let mut reduce = request(OrderSide::Sell, dec!(1), dec!(90), TimeInForce::Ioc);
        reduce.reduce_only = true;
        assert!(matches!(
            ex.place_order(&reduce).await.unwrap(),
            PlaceOutcome::Rejected { .. }
        ));

        accepted(ex.place_order(&request(OrderSide::Buy, dec!(1), dec!(99), TimeInForce::Gtc)).await.unwrap());
        accepted(ex.place_order(&request(OrderSide::Buy, dec!(1), dec!(98), TimeInForce::Gtc)).await.unwrap());
        assert_eq!(ex.cancel_all().await.unwrap().len(), 2);
        assert!(ex.cancel_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_instrument_is_rejected() {
        let market = FixedMarket::new(dec!(99.9), dec!(100.1));
        let ex = PaperExchange::new(PaperConfig::default(), market, "HYPE");

        let mut order = request(OrderSide::Buy, dec!(1), dec!(101), TimeInForce::Ioc);
        order.instrument = "BTC".to_string();
        let err = tokio_test::assert_err!(ex.place_order(&order).await);
        assert!(matches!(err, ExchangeError::Rejected(_)));
        assert_eq!(ex.position("HYPE").await.unwrap().size, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let market = FixedMarket::new(dec!(99.9), dec!(100.1));
        let ex = PaperExchange::new(PaperConfig::default(), market, "HYPE");

        let err = tokio_test::assert_err!(ex.order_status("paper-missing").await);
        assert_eq!(err, ExchangeError::NotFound("paper-missing".to_string()));
        tokio_test::assert_err!(ex.cancel_order("paper-missing").await);

        let id = accepted(ex.place_order(&request(OrderSide::Buy, dec!(1), dec!(99), TimeInForce::Gtc)).await.unwrap());
        tokio_test::assert_ok!(ex.cancel_order(&id).await);
        assert_eq!(ex.order_status(&id).await.unwrap().status, FillStatus::Cancelled);
    }
}
