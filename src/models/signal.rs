//! Momentum signal produced each cycle.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A (timestamp, price) observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, price: Decimal) -> Self {
        Self { timestamp, price }
    }
}

/// Directional bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
            Direction::Flat => Decimal::ZERO,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
            Direction::Flat => write!(f, "flat"),
        }
    }
}

/// Direction with confidence and the indicators that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MomentumSignal {
    pub direction: Direction,
    /// In [0, 1]
    pub confidence: f64,
    pub short_ema: Option<f64>,
    pub long_ema: Option<f64>,
    /// (short - long) / long
    pub crossover: f64,
    pub rsi: Option<f64>,
    /// Std-dev of simple returns over the window
    pub volatility: f64,
    /// Last volume over mean volume, informational
    pub relative_volume: Option<f64>,
}

impl MomentumSignal {
    /// No view: not enough data or no edge.
    pub fn flat() -> Self {
        Self {
            direction: Direction::Flat,
            confidence: 0.0,
            short_ema: None,
            long_ema: None,
            crossover: 0.0,
            rsi: None,
            volatility: 0.0,
            relative_volume: None,
        }
    }

    pub fn is_actionable(&self, min_confidence: f64) -> bool {
        self.direction != Direction::Flat && self.confidence >= min_confidence
    }
}
