//! Risk gate for proposed orders.
//!
//! Checks run in a fixed order and the first failure wins:
//! 1. stale or invalid market data
//! 2. spread below the minimum
//! 3. reference price too far from the last trusted mark
//! 4. position limit (shrinks to headroom, blocks at zero headroom)
//! 5. daily realized loss limit
//! 6. consecutive loss limit
//! 7. performance throttle (scales size, never blocks)
//! 8. minimum notional

use std::collections::VecDeque;
use std::fmt;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::models::{MarketState, OrderIntent, OrderResult, PositionState};
use crate::trading::order_utils::{price_deviation, round_size};
use crate::trading::RiskLimits;

/// Why a trade was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockReason {
    StaleMarketData,
    SpreadTooTight,
    PriceDeviation,
    PositionLimitReached,
    DailyLossLimitReached,
    ConsecutiveLossLimitReached,
    NotionalTooSmall,
}

impl BlockReason {
    /// Stable reason code for logs and records.
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::StaleMarketData => "STALE_MARKET_DATA",
            BlockReason::SpreadTooTight => "SPREAD_TOO_TIGHT",
            BlockReason::PriceDeviation => "PRICE_DEVIATION",
            BlockReason::PositionLimitReached => "POSITION_LIMIT_REACHED",
            BlockReason::DailyLossLimitReached => "DAILY_LOSS_LIMIT_REACHED",
            BlockReason::ConsecutiveLossLimitReached => "CONSECUTIVE_LOSS_LIMIT_REACHED",
            BlockReason::NotionalTooSmall => "NOTIONAL_TOO_SMALL",
        }
    }

    /// Blocks after which resting orders should be pulled.
    pub fn requires_flatten(&self) -> bool {
        matches!(
            self,
            BlockReason::DailyLossLimitReached | BlockReason::ConsecutiveLossLimitReached
        )
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Outcome of a risk evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RiskDecision {
    Approve {
        adjusted_size: Decimal,
        /// Size was scaled down by the performance throttle
        throttled: bool,
    },
    Block(BlockReason),
}

/// Recent trading performance. Mutated only by confirmed fills.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceState {
    pub trading_day: NaiveDate,
    pub daily_realized_pnl: Decimal,
    pub consecutive_losses: u32,
    pub total_wins: u32,
    pub total_losses: u32,
    /// true = win, newest last
    recent: VecDeque<bool>,
    window: usize,
}

impl PerformanceState {
    pub fn new(window: usize, trading_day: NaiveDate) -> Self {
        Self {
            trading_day,
            daily_realized_pnl: Decimal::ZERO,
            consecutive_losses: 0,
            total_wins: 0,
            total_losses: 0,
            recent: VecDeque::with_capacity(window),
            window,
        }
    }

    fn record(&mut self, realized_pnl: Decimal) {
        let win = realized_pnl > Decimal::ZERO;
        self.daily_realized_pnl += realized_pnl;

        if win {
            self.total_wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.total_losses += 1;
            self.consecutive_losses += 1;
        }

        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(win);
    }

    pub fn recent_trades(&self) -> usize {
        self.recent.len()
    }

    /// Win rate over the rolling window.
    pub fn win_rate(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        let wins = self.recent.iter().filter(|w| **w).count();
        Some(wins as f64 / self.recent.len() as f64)
    }
}

/// Evaluates proposed orders and keeps the performance counters.
pub trait RiskGate: Send {
    fn evaluate(
        &self,
        intent: &OrderIntent,
        position: &PositionState,
        market: &MarketState,
    ) -> RiskDecision;

    /// Remember the mid of a cycle as the trusted mark for the next one.
    fn observe_mark(&mut self, mid: Decimal);

    /// Account for a confirmed result that realized `realized_pnl`.
    fn record_fill(&mut self, result: &OrderResult, realized_pnl: Decimal);

    fn on_day_boundary(&mut self, day: NaiveDate);

    fn performance(&self) -> &PerformanceState;
}

/// Limit-based risk manager.
pub struct RiskManager {
    limits: RiskLimits,
    size_decimals: u32,
    last_trusted_mark: Option<Decimal>,
    performance: PerformanceState,
}

impl RiskManager {
    pub fn new(limits: &RiskLimits, size_decimals: u32) -> Self {
        Self {
            limits: limits.clone(),
            size_decimals,
            last_trusted_mark: None,
            performance: PerformanceState::new(limits.performance_window, Utc::now().date_naive()),
        }
    }

    fn is_throttled(&self) -> bool {
        if self.performance.recent_trades() < self.limits.min_trades_for_throttle {
            return false;
        }
        self.performance
            .win_rate()
            .map_or(false, |rate| rate < self.limits.win_rate_floor)
    }
}

impl RiskGate for RiskManager {
    fn evaluate(
        &self,
        intent: &OrderIntent,
        position: &PositionState,
        market: &MarketState,
    ) -> RiskDecision {
        // 1. Market data
        if !market.is_tradeable() {
            return RiskDecision::Block(BlockReason::StaleMarketData);
        }

        // 2. Spread
        if market.spread_pct() < self.limits.min_spread {
            return RiskDecision::Block(BlockReason::SpreadTooTight);
        }

        // 3. Price deviation
        let reference = intent.reference_price(market.mid_price);
        let trusted = self.last_trusted_mark.unwrap_or(market.mid_price);
        if price_deviation(reference, trusted) > self.limits.max_price_deviation {
            return RiskDecision::Block(BlockReason::PriceDeviation);
        }

        // 4. Position limit
        let headroom = self.limits.max_position - intent.side.sign() * position.size;
        if headroom <= Decimal::ZERO {
            return RiskDecision::Block(BlockReason::PositionLimitReached);
        }
        let mut size = intent.size;
        if size > headroom {
            debug!(requested = %size, headroom = %headroom, "Shrinking order to position headroom");
            size = headroom;
        }

        // 5. Daily loss
        if self.performance.daily_realized_pnl <= -self.limits.max_daily_loss {
            return RiskDecision::Block(BlockReason::DailyLossLimitReached);
        }

        // 6. Loss streak
        if self.performance.consecutive_losses >= self.limits.max_consecutive_losses {
            return RiskDecision::Block(BlockReason::ConsecutiveLossLimitReached);
        }

        // 7. Performance throttle
        let throttled = self.is_throttled();
        if throttled {
            size *= self.limits.throttle_factor;
        }
        let size = round_size(size, self.size_decimals);

        // 8. Notional
        if size * reference < self.limits.min_notional {
            return RiskDecision::Block(BlockReason::NotionalTooSmall);
        }

        RiskDecision::Approve {
            adjusted_size: size,
            throttled,
        }
    }

    fn observe_mark(&mut self, mid: Decimal) {
        if mid > Decimal::ZERO {
            self.last_trusted_mark = Some(mid);
        }
    }

    fn record_fill(&mut self, result: &OrderResult, realized_pnl: Decimal) {
        if !result.has_fill() || realized_pnl.is_zero() {
            return;
        }
        self.performance.record(realized_pnl);
        debug!(
            correlation_id = result.correlation_id,
            pnl = %realized_pnl,
            daily_pnl = %self.performance.daily_realized_pnl,
            consecutive_losses = self.performance.consecutive_losses,
            "Recorded trade outcome"
        );
    }

    fn on_day_boundary(&mut self, day: NaiveDate) {
        info!(
            day = %day,
            previous_pnl = %self.performance.daily_realized_pnl,
            "Day boundary: resetting daily risk counters"
        );
        self.performance.trading_day = day;
        self.performance.daily_realized_pnl = Decimal::ZERO;
        self.performance.consecutive_losses = 0;
    }

    fn performance(&self) -> &PerformanceState {
        &self.performance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FillStatus, OrderSide};
    use rust_decimal_macros::dec;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position: dec!(5.0),
            max_daily_loss: dec!(50),
            max_consecutive_losses: 3,
            min_spread: dec!(0.0001),
            max_price_deviation: dec!(0.05),
            min_notional: dec!(12),
            ..RiskLimits::default()
        }
    }

    fn market(mid: Decimal, spread_pct: Decimal) -> MarketState {
        let half = mid * spread_pct / dec!(2);
        MarketState::from_top_of_book("HYPE", mid - half, mid + half, dec!(100), Utc::now())
    }

    fn long(size: Decimal) -> PositionState {
        PositionState {
            size,
            entry_price: Some(dec!(100)),
            ..PositionState::default()
        }
    }

    fn fill(id: u64) -> OrderResult {
        OrderResult {
            correlation_id: id,
            order_id: Some(format!("o{}", id)),
            status: FillStatus::Filled,
            side: OrderSide::Sell,
            filled_size: dec!(1),
            avg_fill_price: Some(dec!(100)),
            error: None,
        }
    }

    #[test]
    fn test_spread_too_tight() {
        let mut l = limits();
        l.min_spread = dec!(0.001);
        let rm = RiskManager::new(&l, 2);
        let intent = OrderIntent::market(1, OrderSide::Buy, dec!(1));

        let decision = rm.evaluate(&intent, &PositionState::flat(), &market(dec!(100), dec!(0.0005)));
        assert_eq!(decision, RiskDecision::Block(BlockReason::SpreadTooTight));
    }

    #[test]
    fn test_shrinks_to_headroom() {
        let rm = RiskManager::new(&limits(), 2);
        let intent = OrderIntent::market(1, OrderSide::Buy, dec!(1.0));

        let decision = rm.evaluate(&intent, &long(dec!(4.8)), &market(dec!(100), dec!(0.001)));
        assert_eq!(
            decision,
            RiskDecision::Approve {
                adjusted_size: dec!(0.2),
                throttled: false
            }
        );
    }

    #[test]
    fn test_never_exceeds_max_position() {
        let rm = RiskManager::new(&limits(), 2);
        let m = market(dec!(100), dec!(0.001));

        for (pos, side, size) in [
            (dec!(0), OrderSide::Buy, dec!(7)),
            (dec!(3), OrderSide::Buy, dec!(4)),
            (dec!(-4.5), OrderSide::Sell, dec!(2)),
            (dec!(4), OrderSide::Sell, dec!(20)),
        ] {
            let intent = OrderIntent::market(1, side, size);
            if let RiskDecision::Approve { adjusted_size, .. } = rm.evaluate(&intent, &long(pos), &m) {
                let after = pos + side.sign() * adjusted_size;
                assert!(after.abs() <= dec!(5), "pos {} side {} -> {}", pos, side, after);
            }
        }
    }

    #[test]
    fn test_zero_headroom_blocks() {
        let rm = RiskManager::new(&limits(), 2);
        let intent = OrderIntent::market(1, OrderSide::Buy, dec!(1));
        let decision = rm.evaluate(&intent, &long(dec!(5)), &market(dec!(100), dec!(0.001)));
        assert_eq!(decision, RiskDecision::Block(BlockReason::PositionLimitReached));

        // Reducing from the limit is fine.
        let sell = OrderIntent::market(2, OrderSide::Sell, dec!(1));
        assert!(matches!(
            rm.evaluate(&sell, &long(dec!(5)), &market(dec!(100), dec!(0.001))),
            RiskDecision::Approve { .. }
        ));
    }

    #[test]
    fn test_daily_loss_blocks_both_directions() {
        let mut rm = RiskManager::new(&limits(), 2);
        rm.record_fill(&fill(1), dec!(-30));
        rm.record_fill(&fill(2), dec!(10));
        rm.record_fill(&fill(3), dec!(-30));
        assert_eq!(rm.performance().daily_realized_pnl, dec!(-50));

        let m = market(dec!(100), dec!(0.001));
        for side in [OrderSide::Buy, OrderSide::Sell] {
            let decision = rm.evaluate(&OrderIntent::market(4, side, dec!(1)), &PositionState::flat(), &m);
            assert_eq!(decision, RiskDecision::Block(BlockReason::DailyLossLimitReached));
        }

        rm.on_day_boundary(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let decision = rm.evaluate(&OrderIntent::market(5, OrderSide::Buy, dec!(1)), &PositionState::flat(), &m);
        assert!(matches!(decision, RiskDecision::Approve { .. }));
    }

    #[test]
    fn test_consecutive_losses_block_until_win() {
        let mut rm = RiskManager::new(&limits(), 2);
        let m = market(dec!(100), dec!(0.001));
        let intent = OrderIntent::market(9, OrderSide::Buy, dec!(1));

        for id in 1..=3 {
            rm.record_fill(&fill(id), dec!(-1));
        }
        assert_eq!(
            rm.evaluate(&intent, &PositionState::flat(), &m),
            RiskDecision::Block(BlockReason::ConsecutiveLossLimitReached)
        );
        assert!(BlockReason::ConsecutiveLossLimitReached.requires_flatten());

        rm.record_fill(&fill(4), dec!(2));
        assert_eq!(rm.performance().consecutive_losses, 0);
    }

    #[test]
    fn test_unconfirmed_results_do_not_count() {
        let mut rm = RiskManager::new(&limits(), 2);
        let mut rejected = fill(1);
        rejected.status = FillStatus::Rejected;
        rejected.filled_size = Decimal::ZERO;
        rejected.avg_fill_price = None;

        rm.record_fill(&rejected, dec!(-10));
        assert_eq!(rm.performance().total_losses, 0);
        assert_eq!(rm.performance().daily_realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_throttle_scales_without_blocking() {
        let mut l = limits();
        l.max_consecutive_losses = 100;
        l.max_daily_loss = dec!(1000);
        let mut rm = RiskManager::new(&l, 2);
        // 1 win in 5: below the 40% floor
        rm.record_fill(&fill(1), dec!(1));
        for id in 2..=5 {
            rm.record_fill(&fill(id), dec!(-1));
        }

        let intent = OrderIntent::market(6, OrderSide::Buy, dec!(1));
        let decision = rm.evaluate(&intent, &PositionState::flat(), &market(dec!(100), dec!(0.001)));
        assert_eq!(
            decision,
            RiskDecision::Approve {
                adjusted_size: dec!(0.5),
                throttled: true
            }
        );
    }

    #[test]
    fn test_price_deviation_from_trusted_mark() {
        let mut rm = RiskManager::new(&limits(), 2);
        rm.observe_mark(dec!(100));
        let intent = OrderIntent::market(1, OrderSide::Buy, dec!(1));

        let decision = rm.evaluate(&intent, &PositionState::flat(), &market(dec!(110), dec!(0.001)));
        assert_eq!(decision, RiskDecision::Block(BlockReason::PriceDeviation));
    }

    #[test]
    fn test_stale_market_blocks_first() {
        let rm = RiskManager::new(&limits(), 2);
        let mut m = market(dec!(100), dec!(0.00001));
        m.is_stale = true;
        let decision = rm.evaluate(&OrderIntent::market(1, OrderSide::Buy, dec!(1)), &PositionState::flat(), &m);
        assert_eq!(decision, RiskDecision::Block(BlockReason::StaleMarketData));
    }

    #[test]
    fn test_notional_too_small() {
        let rm = RiskManager::new(&limits(), 2);
        let intent = OrderIntent::market(1, OrderSide::Buy, dec!(0.1));
        let decision = rm.evaluate(&intent, &PositionState::flat(), &market(dec!(100), dec!(0.001)));
        assert_eq!(decision, RiskDecision::Block(BlockReason::NotionalTooSmall));
    }
}
