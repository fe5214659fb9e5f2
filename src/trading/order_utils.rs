//! Shared order helpers: size precision, validation, spread and slippage.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::models::{MarketState, OrderIntent, OrderSide};
use crate::trading::ExecutionConfig;

/// Headroom multiplier over the exchange minimum notional.
const MIN_NOTIONAL_BUFFER: Decimal = dec!(1.2);

/// Perp price precision is `MAX_PRICE_DECIMALS - size_decimals`.
const MAX_PRICE_DECIMALS: u32 = 6;

/// Size precision (decimal places) for an asset.
pub fn size_decimals(asset: &str) -> u32 {
    match asset.to_uppercase().as_str() {
        "BTC" => 4,
        "ETH" => 3,
        "HYPE" => 2,
        "SOL" | "AVAX" => 1,
        "MATIC" | "DOGE" => 0,
        _ => 3,
    }
}

/// Round a size toward zero so a rounded order never exceeds what was approved.
pub fn round_size(size: Decimal, decimals: u32) -> Decimal {
    size.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Round a price to the precision the exchange accepts for this asset.
pub fn round_price(price: Decimal, size_decimals: u32) -> Decimal {
    let dp = MAX_PRICE_DECIMALS.saturating_sub(size_decimals);
    price.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Smallest order size clearing `min_notional` at `mark`, with a buffer.
pub fn min_size_for_notional(min_notional: Decimal, mark: Decimal, decimals: u32) -> Decimal {
    if mark <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (min_notional / mark * MIN_NOTIONAL_BUFFER)
        .round_dp_with_strategy(decimals, RoundingStrategy::AwayFromZero)
}

/// |price - reference| / reference.
pub fn price_deviation(price: Decimal, reference: Decimal) -> Decimal {
    if reference.is_zero() {
        return Decimal::MAX;
    }
    ((price - reference) / reference).abs()
}

/// Shape problems that stop an intent before it reaches the exchange.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntentIssue {
    #[error("size must be positive, got {0}")]
    NonPositiveSize(Decimal),

    #[error("size {0} rounds to zero at {1} decimals")]
    BelowSizeIncrement(Decimal, u32),

    #[error("limit price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("limit price {price} deviates {deviation} from mid {mid}")]
    PriceOutOfBand {
        price: Decimal,
        mid: Decimal,
        deviation: Decimal,
    },

    #[error("market state is not tradeable")]
    UntradeableMarket,
}

/// Check an intent and return its size rounded to the asset's precision.
pub fn validate_intent(
    intent: &OrderIntent,
    market: &MarketState,
    decimals: u32,
    max_deviation: Decimal,
) -> Result<Decimal, IntentIssue> {
    if intent.size <= Decimal::ZERO {
        return Err(IntentIssue::NonPositiveSize(intent.size));
    }

    let rounded = round_size(intent.size, decimals);
    if rounded.is_zero() {
        return Err(IntentIssue::BelowSizeIncrement(intent.size, decimals));
    }

    if !market.is_valid() {
        return Err(IntentIssue::UntradeableMarket);
    }

    if let Some(price) = intent.limit_price() {
        if price <= Decimal::ZERO {
            return Err(IntentIssue::NonPositivePrice(price));
        }
        let deviation = price_deviation(price, market.mid_price);
        if deviation > max_deviation {
            return Err(IntentIssue::PriceOutOfBand {
                price,
                mid: market.mid_price,
                deviation,
            });
        }
    }

    Ok(rounded)
}

/// Spread of a market snapshot in several units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpreadMetrics {
    pub spread: Decimal,
    pub spread_pct: Decimal,
    pub spread_bps: Decimal,
}

pub fn spread_metrics(market: &MarketState) -> SpreadMetrics {
    let spread_pct = market.spread_pct();
    SpreadMetrics {
        spread: market.spread(),
        spread_pct,
        spread_bps: spread_pct * dec!(10000),
    }
}

/// Slippage tolerance for a market order in current conditions.
pub fn slippage_for(market: &MarketState, reduce_only: bool, config: &ExecutionConfig) -> Decimal {
    let base = if reduce_only {
        config.reduce_only_slippage
    } else {
        config.base_slippage
    };

    let slippage = if market.spread_pct() > config.wide_spread_threshold {
        base * dec!(2)
    } else {
        base
    };

    slippage.min(config.max_slippage)
}

/// Worst acceptable price for a market order: through the touch by `slippage`.
pub fn protective_price(
    side: OrderSide,
    market: &MarketState,
    slippage: Decimal,
    size_decimals: u32,
) -> Decimal {
    let price = match side {
        OrderSide::Buy => market.best_ask * (Decimal::ONE + slippage),
        OrderSide::Sell => market.best_bid * (Decimal::ONE - slippage),
    };
    round_price(price, size_decimals)
}

/// Size of a proactive reduction: a fraction of the position, at least the
/// minimum tradeable size, never more than the position itself.
pub fn reduction_size(
    position_abs: Decimal,
    fraction: Decimal,
    min_notional: Decimal,
    mark: Decimal,
    decimals: u32,
) -> Decimal {
    let fractional = round_size(position_abs * fraction, decimals);
    let minimum = min_size_for_notional(min_notional, mark, decimals);
    fractional.max(minimum).min(position_abs)
}
