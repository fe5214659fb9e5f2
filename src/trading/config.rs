//! Trading configuration.
//!
//! Built once at startup, validated, then passed by reference into every
//! component constructor.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TradingError};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Instrument symbol
    pub asset: String,

    /// Use the exchange testnet
    pub testnet: bool,

    /// Account leverage
    pub leverage: u32,

    /// Largest position change a single cycle may request
    pub base_position: Decimal,

    pub risk: RiskLimits,
    pub momentum: MomentumConfig,
    pub rate_limit: RateLimitConfig,
    pub execution: ExecutionConfig,
    pub engine: EngineConfig,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            asset: "HYPE".to_string(),
            testnet: true,
            leverage: 3,
            base_position: dec!(1.0),
            risk: RiskLimits::default(),
            momentum: MomentumConfig::default(),
            rate_limit: RateLimitConfig::default(),
            execution: ExecutionConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl TradingConfig {
    /// Reject values that would make the engine unsafe or meaningless.
    pub fn validate(&self) -> Result<()> {
        fn fail(msg: impl Into<String>) -> Result<()> {
            Err(TradingError::Configuration(msg.into()))
        }

        if self.asset.trim().is_empty() {
            return fail("asset symbol is required");
        }
        if self.leverage == 0 || self.leverage > 50 {
            return fail(format!("leverage must be in 1..=50, got {}", self.leverage));
        }
        if self.base_position <= Decimal::ZERO {
            return fail("base_position must be positive");
        }

        let r = &self.risk;
        if r.max_position <= Decimal::ZERO {
            return fail("max_position must be positive");
        }
        if self.base_position > r.max_position {
            return fail("base_position cannot exceed max_position");
        }
        if r.max_daily_loss <= Decimal::ZERO {
            return fail("max_daily_loss must be positive");
        }
        if r.max_consecutive_losses == 0 {
            return fail("max_consecutive_losses must be at least 1");
        }
        if r.min_spread < Decimal::ZERO {
            return fail("min_spread cannot be negative");
        }
        if r.max_price_deviation <= Decimal::ZERO {
            return fail("max_price_deviation must be positive");
        }
        if r.min_notional < Decimal::ZERO {
            return fail("min_notional cannot be negative");
        }
        if r.soft_position_ratio <= Decimal::ZERO || r.soft_position_ratio > Decimal::ONE {
            return fail("soft_position_ratio must be in (0, 1]");
        }
        if r.throttle_factor <= Decimal::ZERO || r.throttle_factor > Decimal::ONE {
            return fail("throttle_factor must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&r.win_rate_floor) {
            return fail("win_rate_floor must be in [0, 1]");
        }
        if r.performance_window == 0 {
            return fail("performance_window must be at least 1");
        }

        let m = &self.momentum;
        if m.short_period == 0 || m.short_period >= m.long_period {
            return fail("short_period must be positive and below long_period");
        }
        if m.rsi_period < 2 {
            return fail("rsi_period must be at least 2");
        }
        if m.window_capacity < m.min_window() {
            return fail(format!(
                "window_capacity {} is below the {} prices the indicators need",
                m.window_capacity,
                m.min_window()
            ));
        }
        if m.crossover_threshold < 0.0 || m.full_scale_crossover <= 0.0 {
            return fail("crossover thresholds must be positive");
        }
        if m.oversold >= m.overbought || m.overbought >= 100.0 || m.oversold <= 0.0 {
            return fail("RSI bands must satisfy 0 < oversold < overbought < 100");
        }
        if !(0.0..=1.0).contains(&m.rsi_damping_floor) {
            return fail("rsi_damping_floor must be in [0, 1]");
        }
        if m.volatility_ceiling <= 0.0 {
            return fail("volatility_ceiling must be positive");
        }

        let rl = &self.rate_limit;
        if rl.capacity <= 0.0 || rl.refill_per_sec <= 0.0 {
            return fail("rate limit capacity and refill rate must be positive");
        }
        if rl.order_weight as f64 > rl.capacity || rl.info_weight as f64 > rl.capacity {
            return fail("request weights cannot exceed rate limit capacity");
        }
        if rl.initial_cooldown_ms == 0 || rl.initial_cooldown_ms > rl.max_cooldown_ms {
            return fail("cooldown must satisfy 0 < initial <= max");
        }

        let e = &self.execution;
        if e.fill_poll_interval_ms == 0 || e.fill_poll_interval_ms > e.fill_timeout_ms {
            return fail("fill poll interval must be positive and within the fill timeout");
        }
        if e.max_slippage <= Decimal::ZERO || e.base_slippage > e.max_slippage {
            return fail("slippage must satisfy 0 < base <= max");
        }

        let g = &self.engine;
        if g.cycle_interval_ms == 0 {
            return fail("cycle_interval must be positive");
        }
        if g.max_consecutive_failures == 0 {
            return fail("max_consecutive_failures must be at least 1");
        }
        if g.recovery_initial_backoff_ms == 0
            || g.recovery_initial_backoff_ms > g.recovery_max_backoff_ms
        {
            return fail("recovery backoff must satisfy 0 < initial <= max");
        }
        if g.reduction_fraction <= Decimal::ZERO || g.reduction_fraction > Decimal::ONE {
            return fail("reduction_fraction must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&g.min_confidence) {
            return fail("min_confidence must be in [0, 1]");
        }
        if g.max_momentum_entries == 0 || g.momentum_entry_window_ms == 0 {
            return fail("momentum entry cap and window must be positive");
        }

        Ok(())
    }
}

/// Hard risk limits. Immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Largest absolute position in base units
    pub max_position: Decimal,

    /// Daily realized loss (USD) at which all trading stops
    pub max_daily_loss: Decimal,

    /// Consecutive losing trades at which trading stops
    pub max_consecutive_losses: u32,

    /// Minimum relative spread required to trade
    pub min_spread: Decimal,

    /// Largest allowed move of the reference price from the last trusted mark
    pub max_price_deviation: Decimal,

    /// Minimum order notional (USD)
    pub min_notional: Decimal,

    /// Utilization above which the engine proactively reduces
    pub soft_position_ratio: Decimal,

    /// Number of recent trade outcomes in the rolling window
    pub performance_window: usize,

    /// Outcomes required before the throttle can engage
    pub min_trades_for_throttle: usize,

    /// Rolling win rate below which size is throttled
    pub win_rate_floor: f64,

    /// Size multiplier applied while throttled
    pub throttle_factor: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position: dec!(5.0),
            max_daily_loss: dec!(100),     // $100 per day
            max_consecutive_losses: 3,
            min_spread: dec!(0.0001),      // 1 bp
            max_price_deviation: dec!(0.10),
            min_notional: dec!(12),        // exchange minimum is $10
            soft_position_ratio: dec!(0.8),
            performance_window: 20,
            min_trades_for_throttle: 5,
            win_rate_floor: 0.4,
            throttle_factor: dec!(0.5),
        }
    }
}

/// Indicator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumConfig {
    /// Rolling price window size (oldest evicted)
    pub window_capacity: usize,
    pub short_period: usize,
    pub long_period: usize,

    /// Minimum |short - long| / long for a directional view
    pub crossover_threshold: f64,

    /// Crossover magnitude that maps to full base confidence
    pub full_scale_crossover: f64,

    pub rsi_period: usize,
    pub overbought: f64,
    pub oversold: f64,

    /// Damping factor reached at RSI 100 (long) or 0 (short)
    pub rsi_damping_floor: f64,

    /// Volatility above which confidence is scaled down
    pub volatility_ceiling: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            window_capacity: 50,
            short_period: 5,
            long_period: 20,
            crossover_threshold: 0.003,  // 0.3%
            full_scale_crossover: 0.02,  // 2%
            rsi_period: 14,
            overbought: 70.0,
            oversold: 30.0,
            rsi_damping_floor: 0.3,
            volatility_ceiling: 0.005,   // 0.5% per sample
        }
    }
}

impl MomentumConfig {
    /// Prices needed before any indicator is computed.
    pub fn min_window(&self) -> usize {
        self.long_period.max(self.rsi_period + 1)
    }
}

/// Token bucket and exchange-side cooldown parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity in weight units
    pub capacity: f64,

    /// Tokens refilled per second
    pub refill_per_sec: f64,

    /// Longest a caller may wait for tokens
    pub max_wait_ms: u64,

    /// First cooldown after an exchange rate-limit rejection
    pub initial_cooldown_ms: u64,

    /// Cooldown ceiling
    pub max_cooldown_ms: u64,

    /// Consecutive successes that clear the cooldown
    pub reset_after_successes: u32,

    /// Weight of an order action
    pub order_weight: u32,

    /// Weight of an info query
    pub info_weight: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 50.0,
            refill_per_sec: 16.0, // ~1000 per minute
            max_wait_ms: 5_000,
            initial_cooldown_ms: 5_000,
            max_cooldown_ms: 30_000,
            reset_after_successes: 10,
            order_weight: 1,
            info_weight: 2,
        }
    }
}

impl RateLimitConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn initial_cooldown(&self) -> Duration {
        Duration::from_millis(self.initial_cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

/// How directional entries are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStyle {
    /// IOC with a protective slippage price
    Market,
    /// Post-only limit at the touch
    PostOnly,
    /// Good-til-cancelled limit at the touch
    Limit,
}

/// Order execution parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub order_style: OrderStyle,

    /// How long to wait for a fill confirmation
    pub fill_timeout_ms: u64,

    /// Status polling period while waiting
    pub fill_poll_interval_ms: u64,

    /// Protective price offset for market orders
    pub base_slippage: Decimal,

    /// Offset for reduce-only market orders
    pub reduce_only_slippage: Decimal,

    /// Spread above which slippage is doubled
    pub wide_spread_threshold: Decimal,

    /// Slippage ceiling
    pub max_slippage: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_style: OrderStyle::Market,
            fill_timeout_ms: 5_000,
            fill_poll_interval_ms: 500,
            base_slippage: dec!(0.01),
            reduce_only_slippage: dec!(0.02),
            wide_spread_threshold: dec!(0.005),
            max_slippage: dec!(0.05),
        }
    }
}

impl ExecutionConfig {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }

    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }
}

/// Control loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub cycle_interval_ms: u64,

    /// Consecutive failed cycles that stop the engine
    pub max_consecutive_failures: u32,

    pub recovery_initial_backoff_ms: u64,
    pub recovery_max_backoff_ms: u64,

    /// Cancel resting orders when entering recovery
    pub cancel_on_recovery: bool,

    /// Signals below this confidence produce no order
    pub min_confidence: f64,

    /// Market snapshots older than this are stale
    pub market_data_max_age_ms: u64,

    /// Fraction of the position closed by a proactive reduction
    pub reduction_fraction: Decimal,

    /// Momentum entries allowed per entry window
    pub max_momentum_entries: usize,

    pub momentum_entry_window_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 10_000,
            max_consecutive_failures: 5,
            recovery_initial_backoff_ms: 5_000,
            recovery_max_backoff_ms: 60_000,
            cancel_on_recovery: true,
            min_confidence: 0.1,
            market_data_max_age_ms: 10_000,
            reduction_fraction: dec!(0.1),
            max_momentum_entries: 2,
            momentum_entry_window_ms: 3_600_000,
        }
    }
}

impl EngineConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn recovery_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_initial_backoff_ms)
    }

    pub fn recovery_max_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_max_backoff_ms)
    }

    pub fn momentum_entry_window(&self) -> Duration {
        Duration::from_millis(self.momentum_entry_window_ms)
    }

    pub fn market_data_max_age(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.market_data_max_age_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TradingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let mut config = TradingConfig::default();
        config.risk.max_position = Decimal::ZERO;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TradingError::Configuration(_)));

        let mut config = TradingConfig::default();
        config.base_position = dec!(10);
        assert!(config.validate().is_err());

        let mut config = TradingConfig::default();
        config.momentum.window_capacity = 10;
        assert!(config.validate().is_err());

        let mut config = TradingConfig::default();
        config.asset = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = TradingConfig::default();
        config.engine.max_momentum_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_window_covers_rsi() {
        let mut m = MomentumConfig::default();
        assert_eq!(m.min_window(), 20);
        m.rsi_period = 30;
        assert_eq!(m.min_window(), 31);
    }
}
