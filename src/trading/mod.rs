//! Trading logic: signals, risk, positions, and order execution.

mod config;
mod momentum;
mod order_manager;
pub mod order_utils;
mod position_manager;
mod risk;

pub use config::{
    EngineConfig, ExecutionConfig, MomentumConfig, OrderStyle, RateLimitConfig, RiskLimits,
    TradingConfig,
};
pub use momentum::{MomentumAnalyzer, PriceWindow, SignalGenerator};
pub use order_manager::{OrderExecutor, OrderManager};
pub use position_manager::{PositionManager, PositionTracker};
pub use risk::{RiskDecision, RiskGate, RiskManager};
