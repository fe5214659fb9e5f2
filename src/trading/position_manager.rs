//! Position tracking from confirmed fills.
//!
//! Fills are applied at most once per correlation id: each result carries a
//! cumulative filled size, and only the part not yet applied moves the
//! position. Replaying the same ordered results always lands on the same
//! state.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::models::{OrderResult, PositionState};
use crate::trading::RiskLimits;

/// Result of applying one order result.
#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    pub state: PositionState,
    /// PnL realized by this application
    pub realized_pnl: Decimal,
    /// False when nothing new was applied
    pub applied: bool,
}

/// Position metrics for sizing decisions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionMetrics {
    pub size: Decimal,
    pub utilization: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    /// max_position - |size|, floored at zero
    pub remaining_capacity: Decimal,
}

/// Owns the position state.
pub trait PositionTracker: Send {
    fn update(&mut self, result: &OrderResult) -> FillOutcome;
    fn state(&self) -> &PositionState;
    fn metrics(&self) -> PositionMetrics;
    fn should_reduce(&self, limits: &RiskLimits) -> bool;
    fn mark_to_market(&mut self, mark: Decimal);
    /// Replace the position with one reported by the exchange.
    fn seed(&mut self, size: Decimal, entry_price: Option<Decimal>);
}

#[derive(Debug, Clone, Copy, Default)]
struct AppliedFill {
    size: Decimal,
    notional: Decimal,
}

pub struct PositionManager {
    max_position: Decimal,
    state: PositionState,
    /// Every correlation id ever applied. Ids are never forgotten.
    applied: HashMap<u64, AppliedFill>,
}

impl PositionManager {
    pub fn new(max_position: Decimal) -> Self {
        Self {
            max_position,
            state: PositionState::flat(),
            applied: HashMap::new(),
        }
    }

    fn remember(&mut self, id: u64, fill: AppliedFill) {
        self.applied.insert(id, fill);
    }

    /// Apply a signed quantity at `price`. Returns realized PnL.
    fn apply_fill(&mut self, qty: Decimal, price: Decimal) -> Decimal {
        let size = self.state.size;
        let same_direction = self.state.is_flat() || size.is_sign_positive() == qty.is_sign_positive();

        let realized = if same_direction {
            let new_size = size + qty;
            let entry = self.state.entry_price.unwrap_or(price);
            let cost = size.abs() * entry + qty.abs() * price;
            self.state.entry_price = Some(cost / new_size.abs());
            self.state.size = new_size;
            Decimal::ZERO
        } else {
            // Close against the existing entry first, then open any remainder.
            let entry = self.state.entry_price.unwrap_or(price);
            let closing = qty.abs().min(size.abs());
            let direction = if size > Decimal::ZERO {
                Decimal::ONE
            } else {
                Decimal::NEGATIVE_ONE
            };
            let realized = closing * (price - entry) * direction;

            let new_size = size + qty;
            self.state.entry_price = if new_size.is_zero() {
                None
            } else if new_size.is_sign_positive() == size.is_sign_positive() {
                Some(entry)
            } else {
                Some(price)
            };
            self.state.size = new_size;
            realized
        };

        self.state.realized_pnl += realized;
        self.refresh();
        realized
    }

    fn refresh(&mut self) {
        self.state.utilization = if self.max_position.is_zero() {
            Decimal::ZERO
        } else {
            self.state.size.abs() / self.max_position
        };
        self.state.unrealized_pnl = match (self.state.entry_price, self.state.mark_price) {
            (Some(entry), Some(mark)) => self.state.size * (mark - entry),
            _ => Decimal::ZERO,
        };
    }
}

impl PositionTracker for PositionManager {
    fn update(&mut self, result: &OrderResult) -> FillOutcome {
        let unchanged = |state: &PositionState| FillOutcome {
            state: state.clone(),
            realized_pnl: Decimal::ZERO,
            applied: false,
        };

        let avg_price = match result.avg_fill_price {
            Some(p) if result.filled_size > Decimal::ZERO && p > Decimal::ZERO => p,
            _ => return unchanged(&self.state),
        };

        let prior = self
            .applied
            .get(&result.correlation_id)
            .copied()
            .unwrap_or_default();
        let cumulative = AppliedFill {
            size: result.filled_size,
            notional: result.filled_size * avg_price,
        };

        let delta = cumulative.size - prior.size;
        if delta <= Decimal::ZERO {
            debug!(
                correlation_id = result.correlation_id,
                filled = %result.filled_size,
                "Fill already applied, skipping"
            );
            return unchanged(&self.state);
        }

        let delta_price = {
            let p = (cumulative.notional - prior.notional) / delta;
            if p > Decimal::ZERO {
                p
            } else {
                avg_price
            }
        };

        let realized = self.apply_fill(delta * result.side.sign(), delta_price);
        self.remember(result.correlation_id, cumulative);

        info!(
            correlation_id = result.correlation_id,
            side = %result.side,
            qty = %delta,
            price = %delta_price,
            position = %self.state.size,
            realized = %realized,
            "Applied fill"
        );

        FillOutcome {
            state: self.state.clone(),
            realized_pnl: realized,
            applied: true,
        }
    }

    fn state(&self) -> &PositionState {
        &self.state
    }

    fn metrics(&self) -> PositionMetrics {
        PositionMetrics {
            size: self.state.size,
            utilization: self.state.utilization,
            unrealized_pnl: self.state.unrealized_pnl,
            realized_pnl: self.state.realized_pnl,
            remaining_capacity: (self.max_position - self.state.size.abs()).max(Decimal::ZERO),
        }
    }

    fn should_reduce(&self, limits: &RiskLimits) -> bool {
        self.state.utilization > limits.soft_position_ratio
    }

    fn mark_to_market(&mut self, mark: Decimal) {
        if mark > Decimal::ZERO {
            self.state.mark_price = Some(mark);
            self.refresh();
        }
    }

    fn seed(&mut self, size: Decimal, entry_price: Option<Decimal>) {
        self.state.size = size;
        self.state.entry_price = if size.is_zero() { None } else { entry_price };
        self.refresh();
        info!(size = %size, entry = ?entry_price, "Position seeded from exchange");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FillStatus, OrderSide};
    use rust_decimal_macros::dec;

    fn result(id: u64, side: OrderSide, size: Decimal, price: Decimal) -> OrderResult {
        OrderResult {
            correlation_id: id,
            order_id: Some(format!("o{}", id)),
            status: FillStatus::Filled,
            side,
            filled_size: size,
            avg_fill_price: Some(price),
            error: None,
        }
    }

    #[test]
    fn test_vwap_on_same_direction() {
        let mut pm = PositionManager::new(dec!(5));
        pm.update(&result(1, OrderSide::Buy, dec!(1), dec!(100)));
        let out = pm.update(&result(2, OrderSide::Buy, dec!(3), dec!(104)));

        assert_eq!(out.state.size, dec!(4));
        assert_eq!(out.state.entry_price, Some(dec!(103)));
        assert_eq!(out.state.utilization, dec!(0.8));
        assert_eq!(out.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_partial_close_realizes_pnl() {
        let mut pm = PositionManager::new(dec!(5));
        pm.update(&result(1, OrderSide::Buy, dec!(2), dec!(100)));
        let out = pm.update(&result(2, OrderSide::Sell, dec!(1), dec!(110)));

        assert_eq!(out.realized_pnl, dec!(10));
        assert_eq!(out.state.size, dec!(1));
        assert_eq!(out.state.entry_price, Some(dec!(100)));

        let out = pm.update(&result(3, OrderSide::Sell, dec!(1), dec!(95)));
        assert_eq!(out.realized_pnl, dec!(-5));
        assert!(out.state.is_flat());
        assert_eq!(out.state.entry_price, None);
        assert_eq!(pm.metrics().realized_pnl, dec!(5));
    }

    #[test]
    fn test_flip_closes_then_opens_at_fill_price() {
        let mut pm = PositionManager::new(dec!(5));
        pm.update(&result(1, OrderSide::Sell, dec!(2), dec!(100)));
        let out = pm.update(&result(2, OrderSide::Buy, dec!(3), dec!(90)));

        // Short 2 closed at 90 from 100
        assert_eq!(out.realized_pnl, dec!(20));
        assert_eq!(out.state.size, dec!(1));
        assert_eq!(out.state.entry_price, Some(dec!(90)));
    }

    #[test]
    fn test_duplicate_result_applied_once() {
        let mut pm = PositionManager::new(dec!(5));
        let fill = result(7, OrderSide::Buy, dec!(1), dec!(100));

        assert!(pm.update(&fill).applied);
        let again = pm.update(&fill);
        assert!(!again.applied);
        assert_eq!(again.state.size, dec!(1));
    }

    #[test]
    fn test_id_reobserved_after_many_fills_is_not_reapplied() {
        let mut pm = PositionManager::new(dec!(5));
        let first = result(1, OrderSide::Buy, dec!(1), dec!(100));
        assert!(pm.update(&first).applied);

        for id in 2..=1_027u64 {
            let side = if id % 2 == 0 { OrderSide::Buy } else { OrderSide::Sell };
            assert!(pm.update(&result(id, side, dec!(1), dec!(100))).applied);
        }
        assert_eq!(pm.state().size, dec!(1));

        let again = pm.update(&first);
        assert!(!again.applied);
        assert_eq!(again.state.size, dec!(1));
    }

    #[test]
    fn test_partial_then_full_applies_delta() {
        let mut pm = PositionManager::new(dec!(5));
        let mut partial = result(3, OrderSide::Buy, dec!(0.4), dec!(100));
        partial.status = FillStatus::Partial;
        pm.update(&partial);

        let full = result(3, OrderSide::Buy, dec!(1.0), dec!(100));
        let out = pm.update(&full);
        assert!(out.applied);
        assert_eq!(out.state.size, dec!(1.0));
        assert_eq!(out.state.entry_price, Some(dec!(100)));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let fills = vec![
            result(1, OrderSide::Buy, dec!(1.5), dec!(100)),
            result(2, OrderSide::Buy, dec!(0.5), dec!(102)),
            result(3, OrderSide::Sell, dec!(3), dec!(99)),
            result(2, OrderSide::Buy, dec!(0.5), dec!(102)),
            result(4, OrderSide::Buy, dec!(0.25), dec!(98)),
        ];

        let replay = || {
            let mut pm = PositionManager::new(dec!(5));
            for f in &fills {
                pm.update(f);
            }
            pm.state().clone()
        };

        let first = replay();
        assert_eq!(first, replay());
        assert_eq!(first.size, dec!(-0.75));
    }

    #[test]
    fn test_unfilled_result_changes_nothing() {
        let mut pm = PositionManager::new(dec!(5));
        let mut r = result(1, OrderSide::Buy, Decimal::ZERO, dec!(100));
        r.status = FillStatus::Unfilled;
        r.avg_fill_price = None;
        let out = pm.update(&r);
        assert!(!out.applied);
        assert!(out.state.is_flat());
    }

    #[test]
    fn test_should_reduce_above_soft_ratio() {
        let limits = RiskLimits::default();
        let mut pm = PositionManager::new(dec!(5));
        pm.update(&result(1, OrderSide::Buy, dec!(4), dec!(100)));
        assert!(!pm.should_reduce(&limits));
        pm.update(&result(2, OrderSide::Buy, dec!(0.5), dec!(100)));
        assert!(pm.should_reduce(&limits));
    }

    #[test]
    fn test_mark_to_market_short() {
        let mut pm = PositionManager::new(dec!(5));
        pm.update(&result(1, OrderSide::Sell, dec!(2), dec!(100)));
        pm.mark_to_market(dec!(97));
        let m = pm.metrics();
        assert_eq!(m.unrealized_pnl, dec!(6));
        assert_eq!(m.remaining_capacity, dec!(3));
    }
}
