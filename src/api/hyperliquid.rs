//! Hyperliquid public info client for top-of-book market data.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{ExchangeError, Result, TradingError};
use crate::models::MarketState;

use super::{ExchangeResult, MarketDataSource, Throttle};

const MAINNET_INFO_URL: &str = "https://api.hyperliquid.xyz/info";
const TESTNET_INFO_URL: &str = "https://api.hyperliquid-testnet.xyz/info";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct L2Level {
    pub px: Decimal,
    pub sz: Decimal,
    #[serde(default)]
    pub n: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct L2Book {
    pub coin: String,
    /// Milliseconds since epoch
    pub time: i64,
    /// [bids, asks], best first
    pub levels: Vec<Vec<L2Level>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecentTrade {
    pub px: Decimal,
    pub sz: Decimal,
    pub time: i64,
}

/// Build a market snapshot from an L2 book and recent trades.
pub fn book_to_state(
    book: &L2Book,
    trades: &[RecentTrade],
    max_age: chrono::Duration,
    volume_window: chrono::Duration,
    now: DateTime<Utc>,
) -> ExchangeResult<MarketState> {
    let best = |side: usize| book.levels.get(side).and_then(|levels| levels.first());
    let (bid, ask) = match (best(0), best(1)) {
        (Some(bid), Some(ask)) => (bid.px, ask.px),
        _ => return Err(ExchangeError::Other(format!("empty book for {}", book.coin))),
    };

    let timestamp = Utc
        .timestamp_millis_opt(book.time)
        .single()
        .ok_or_else(|| ExchangeError::Other(format!("bad book timestamp {}", book.time)))?;

    let cutoff = (now - volume_window).timestamp_millis();
    let recent_volume = trades
        .iter()
        .filter(|t| t.time >= cutoff)
        .map(|t| t.sz)
        .sum();

    Ok(MarketState::from_top_of_book(&book.coin, bid, ask, recent_volume, timestamp)
        .mark_stale_if_older(max_age, now))
}

/// Read-only market data from the Hyperliquid info endpoint.
pub struct HyperliquidClient {
    client: Client,
    info_url: String,
    throttle: Arc<dyn Throttle>,
    info_weight: u32,
    max_age: chrono::Duration,
    volume_window: chrono::Duration,
}

impl HyperliquidClient {
    pub fn new(
        testnet: bool,
        throttle: Arc<dyn Throttle>,
        info_weight: u32,
        max_age: chrono::Duration,
    ) -> Result<Self> {
        let info_url = if testnet {
            TESTNET_INFO_URL
        } else {
            MAINNET_INFO_URL
        };
        Self::with_url(info_url.to_string(), throttle, info_weight, max_age)
    }

    /// Create with a custom endpoint (for testing).
    pub fn with_url(
        info_url: String,
        throttle: Arc<dyn Throttle>,
        info_weight: u32,
        max_age: chrono::Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;

        Ok(Self {
            client,
            info_url,
            throttle,
            info_weight,
            max_age,
            volume_window: chrono::Duration::minutes(1),
        })
    }

    pub fn info_url(&self) -> &str {
        &self.info_url
    }

    async fn post_info<T: DeserializeOwned>(&self, body: serde_json::Value) -> ExchangeResult<T> {
        self.throttle
            .acquire(self.info_weight)
            .await
            .map_err(|e| match e {
                TradingError::Cancelled => ExchangeError::Cancelled,
                TradingError::RateLimitExceeded { .. } => ExchangeError::RateLimited,
                other => ExchangeError::Other(other.to_string()),
            })?;

        debug!(url = %self.info_url, body = %body, "Info request");
        let response = self.client.post(&self.info_url).json(&body).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.throttle.on_rate_limited();
            return Err(ExchangeError::RateLimited);
        }
        if !status.is_success() {
            warn!(status = %status, "Info endpoint error");
            return Err(ExchangeError::Network(format!("info endpoint returned {}", status)));
        }

        let parsed = response
            .json::<T>()
            .await
            .map_err(|e| ExchangeError::Other(format!("failed to decode info response: {}", e)))?;
        self.throttle.on_success();
        Ok(parsed)
    }

    pub async fn l2_book(&self, coin: &str) -> ExchangeResult<L2Book> {
        self.post_info(json!({ "type": "l2Book", "coin": coin })).await
    }

    pub async fn recent_trades(&self, coin: &str) -> ExchangeResult<Vec<RecentTrade>> {
        self.post_info(json!({ "type": "recentTrades", "coin": coin })).await
    }
}

#[async_trait]
impl MarketDataSource for HyperliquidClient {
    async fn current_state(&self, instrument: &str) -> ExchangeResult<MarketState> {
        let book = self.l2_book(instrument).await?;
        let trades = match self.recent_trades(instrument).await {
            Ok(trades) => trades,
            Err(e @ (ExchangeError::RateLimited | ExchangeError::Cancelled)) => return Err(e),
            Err(e) => {
                // Volume is informational; a missing trade feed does not void the book.
                warn!(error = %e, "Recent trades unavailable");
                Vec::new()
            }
        };
        book_to_state(&book, &trades, self.max_age, self.volume_window, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const BOOK: &str = r#"{
        "coin": "HYPE",
        "time": 1700000000000,
        "levels": [
            [{"px": "24.995", "sz": "120.5", "n": 4}, {"px": "24.990", "sz": "80", "n": 2}],
            [{"px": "25.005", "sz": "60.1", "n": 3}]
        ]
    }"#;

    const TRADES: &str = r#"[
        {"coin": "HYPE", "side": "B", "px": "25.0", "sz": "3.5", "time": 1699999990000, "hash": "0x0", "tid": 1},
        {"coin": "HYPE", "side": "A", "px": "25.0", "sz": "1.5", "time": 1699999000000, "hash": "0x0", "tid": 2}
    ]"#;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    #[test]
    fn test_parse_book_to_state() {
        let book: L2Book = serde_json::from_str(BOOK).unwrap();
        let trades: Vec<RecentTrade> = serde_json::from_str(TRADES).unwrap();

        let state = book_to_state(
            &book,
            &trades,
            chrono::Duration::seconds(10),
            chrono::Duration::minutes(1),
            at(1_700_000_001_000),
        )
        .unwrap();

        assert_eq!(state.instrument, "HYPE");
        assert_eq!(state.best_bid, dec!(24.995));
        assert_eq!(state.best_ask, dec!(25.005));
        assert_eq!(state.mid_price, dec!(25.000));
        // Only the trade inside the last minute counts.
        assert_eq!(state.recent_volume, dec!(3.5));
        assert!(!state.is_stale);
    }

    #[test]
    fn test_old_book_is_stale() {
        let book: L2Book = serde_json::from_str(BOOK).unwrap();
        let state = book_to_state(
            &book,
            &[],
            chrono::Duration::seconds(10),
            chrono::Duration::minutes(1),
            at(1_700_000_060_000),
        )
        .unwrap();
        assert!(state.is_stale);
    }

    #[test]
    fn test_empty_side_is_error() {
        let book = L2Book {
            coin: "HYPE".into(),
            time: 1_700_000_000_000,
            levels: vec![vec![], vec![]],
        };
        let err = book_to_state(
            &book,
            &[],
            chrono::Duration::seconds(10),
            chrono::Duration::minutes(1),
            at(1_700_000_000_000),
        )
        .unwrap_err();
        assert!(matches!(err, ExchangeError::Other(_)));
    }

    /// Throttle that refuses every request.
    struct Refusing {
        shutdown: bool,
    }

    #[async_trait]
    impl Throttle for Refusing {
        async fn acquire(&self, _weight: u32) -> Result<()> {
            if self.shutdown {
                return Err(TradingError::Cancelled);
            }
            Err(TradingError::RateLimitExceeded {
                reason: "bucket empty".into(),
                retry_after: Duration::from_secs(1),
            })
        }

        fn on_rate_limited(&self) -> Duration {
            Duration::ZERO
        }

        fn on_success(&self) {}
    }

    fn client(throttle: Refusing) -> HyperliquidClient {
        // Unroutable address: the throttle must stop the request first.
        HyperliquidClient::with_url(
            "http://127.0.0.1:9/info".to_string(),
            Arc::new(throttle),
            2,
            chrono::Duration::seconds(10),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_during_fetch_is_cancelled() {
        let client = client(Refusing { shutdown: true });
        let err = client.current_state("HYPE").await.unwrap_err();
        assert_eq!(err, ExchangeError::Cancelled);
    }

    #[tokio::test]
    async fn test_local_throttle_is_rate_limited() {
        let client = client(Refusing { shutdown: false });
        let err = client.l2_book("HYPE").await.unwrap_err();
        assert_eq!(err, ExchangeError::RateLimited);
    }
}
