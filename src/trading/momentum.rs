//! Momentum signal generation.
//!
//! A signal combines three indicators over a rolling price window:
//! - EMA crossover (short vs long period) sets direction and base magnitude
//! - RSI damps longs when overbought and shorts when oversold
//! - realized volatility above a ceiling scales confidence down
//!
//! Everything here is pure: the same window always yields the same signal.

use std::collections::VecDeque;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{Direction, MomentumSignal, PricePoint};
use crate::trading::MomentumConfig;

/// Produces a directional signal from price and volume history.
pub trait SignalGenerator: Send + Sync {
    fn analyze(&self, prices: &[PricePoint], volumes: &[Decimal]) -> MomentumSignal;
}

/// Fixed-size rolling window of observations. Oldest entries are evicted.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    capacity: usize,
    prices: VecDeque<PricePoint>,
    volumes: VecDeque<Decimal>,
}

impl PriceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            prices: VecDeque::with_capacity(capacity),
            volumes: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: PricePoint, volume: Decimal) {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
            self.volumes.pop_front();
        }
        self.prices.push_back(point);
        self.volumes.push_back(volume);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Ordered copies of the window, oldest first.
    pub fn snapshot(&self) -> (Vec<PricePoint>, Vec<Decimal>) {
        (
            self.prices.iter().copied().collect(),
            self.volumes.iter().copied().collect(),
        )
    }
}

/// EMA crossover + RSI + volatility analyzer.
#[derive(Debug, Clone)]
pub struct MomentumAnalyzer {
    config: MomentumConfig,
}

impl MomentumAnalyzer {
    pub fn new(config: &MomentumConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Combine indicator values into a direction and confidence.
    ///
    /// Returns `(direction, confidence, crossover)`.
    pub fn combine(
        &self,
        short_ema: f64,
        long_ema: f64,
        rsi: Option<f64>,
        volatility: f64,
    ) -> (Direction, f64, f64) {
        if long_ema <= 0.0 || !short_ema.is_finite() || !long_ema.is_finite() {
            return (Direction::Flat, 0.0, 0.0);
        }

        let crossover = (short_ema - long_ema) / long_ema;
        let direction = if crossover > self.config.crossover_threshold {
            Direction::Long
        } else if crossover < -self.config.crossover_threshold {
            Direction::Short
        } else {
            return (Direction::Flat, 0.0, crossover);
        };

        let base = (crossover.abs() / self.config.full_scale_crossover).min(1.0);
        let rsi_factor = rsi.map_or(1.0, |r| self.rsi_damping(direction, r));
        let vol_factor = volatility_damping(volatility, self.config.volatility_ceiling);

        let confidence = (base * rsi_factor * vol_factor).clamp(0.0, 1.0);
        (direction, confidence, crossover)
    }

    /// Linear damping from 1 at the band edge to the floor at the extreme.
    fn rsi_damping(&self, direction: Direction, rsi: f64) -> f64 {
        let floor = self.config.rsi_damping_floor;
        let depth = match direction {
            Direction::Long if rsi > self.config.overbought => {
                (rsi - self.config.overbought) / (100.0 - self.config.overbought)
            }
            Direction::Short if rsi < self.config.oversold => {
                (self.config.oversold - rsi) / self.config.oversold
            }
            _ => return 1.0,
        };
        1.0 - depth.clamp(0.0, 1.0) * (1.0 - floor)
    }
}

impl SignalGenerator for MomentumAnalyzer {
    fn analyze(&self, prices: &[PricePoint], volumes: &[Decimal]) -> MomentumSignal {
        if prices.len() < self.config.min_window() {
            return MomentumSignal::flat();
        }

        let values: Option<Vec<f64>> = prices.iter().map(|p| p.price.to_f64()).collect();
        let values = match values {
            Some(v) if v.iter().all(|x| x.is_finite() && *x > 0.0) => v,
            _ => return MomentumSignal::flat(),
        };

        let (short_ema, long_ema) = match (
            ema(&values, self.config.short_period),
            ema(&values, self.config.long_period),
        ) {
            (Some(s), Some(l)) => (s, l),
            _ => return MomentumSignal::flat(),
        };

        let rsi = rsi(&values, self.config.rsi_period);
        let volatility = realized_volatility(&values);
        let (direction, confidence, crossover) = self.combine(short_ema, long_ema, rsi, volatility);

        MomentumSignal {
            direction,
            confidence,
            short_ema: Some(short_ema),
            long_ema: Some(long_ema),
            crossover,
            rsi,
            volatility,
            relative_volume: relative_volume(volumes),
        }
    }
}

/// 1 up to the ceiling, then falls linearly to 0 at twice the ceiling.
pub fn volatility_damping(volatility: f64, ceiling: f64) -> f64 {
    if volatility <= ceiling || ceiling <= 0.0 {
        return 1.0;
    }
    (1.0 - (volatility - ceiling) / ceiling).max(0.0)
}

/// SMA-seeded exponential moving average over the whole series.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().mean();
    Some(
        values[period..]
            .iter()
            .fold(seed, |acc, v| alpha * v + (1.0 - alpha) * acc),
    )
}

/// RSI over the last `period` price changes, simple averages.
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }
    let tail = &values[values.len() - period - 1..];
    let (gains, losses) = tail.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let change = w[1] - w[0];
        if change > 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Sample standard deviation of simple returns.
pub fn realized_volatility(values: &[f64]) -> f64 {
    let returns: Vec<f64> = values
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();

    if returns.len() < 2 {
        return 0.0;
    }
    let std_dev = returns.std_dev();
    if std_dev.is_finite() {
        std_dev
    } else {
        0.0
    }
}

/// Latest volume relative to the window mean.
fn relative_volume(volumes: &[Decimal]) -> Option<f64> {
    let values: Vec<f64> = volumes.iter().filter_map(|v| v.to_f64()).collect();
    let last = *values.last()?;
    let mean = values.iter().mean();
    if mean > 0.0 {
        Some(last / mean)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn series(prices: &[f64]) -> Vec<PricePoint> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| {
                PricePoint::new(
                    start + Duration::seconds(i as i64 * 10),
                    Decimal::try_from(*p).unwrap(),
                )
            })
            .collect()
    }

    fn geometric(start: f64, step: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| start * step.powi(i as i32)).collect()
    }

    fn analyzer() -> MomentumAnalyzer {
        MomentumAnalyzer::new(&MomentumConfig::default())
    }

    #[test]
    fn test_short_window_is_flat() {
        let a = analyzer();
        let min = MomentumConfig::default().min_window();
        for n in 0..min {
            let signal = a.analyze(&series(&geometric(100.0, 1.01, n)), &[]);
            assert_eq!(signal.direction, Direction::Flat);
            assert_eq!(signal.confidence, 0.0);
        }
    }

    #[test]
    fn test_uptrend_is_long() {
        let signal = analyzer().analyze(&series(&geometric(100.0, 1.002, 30)), &[]);
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.confidence > 0.0 && signal.confidence <= 1.0);
        assert_eq!(signal.rsi, Some(100.0));
    }

    #[test]
    fn test_downtrend_is_short() {
        let signal = analyzer().analyze(&series(&geometric(100.0, 0.998, 30)), &[]);
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.confidence > 0.0);
    }

    #[test]
    fn test_constant_prices_are_flat() {
        let signal = analyzer().analyze(&series(&[100.0; 30]), &[]);
        assert_eq!(signal.direction, Direction::Flat);
        assert_eq!(signal.confidence, 0.0);
        assert_eq!(signal.rsi, Some(50.0));
        assert_eq!(signal.volatility, 0.0);
    }

    #[test]
    fn test_overbought_damps_long() {
        let a = analyzer();
        let (undamped_dir, undamped, _) = a.combine(101.2, 100.0, Some(50.0), 0.001);
        let (dir, damped, _) = a.combine(101.2, 100.0, Some(75.0), 0.001);

        assert_eq!(undamped_dir, Direction::Long);
        assert_eq!(dir, Direction::Long);
        assert!(damped < undamped);
        assert!(damped > 0.0);
    }

    #[test]
    fn test_oversold_damps_short_only() {
        let a = analyzer();
        let (_, short_plain, _) = a.combine(98.8, 100.0, Some(50.0), 0.0);
        let (_, short_oversold, _) = a.combine(98.8, 100.0, Some(20.0), 0.0);
        assert!(short_oversold < short_plain);

        // Oversold does not touch longs.
        let (_, long_plain, _) = a.combine(101.2, 100.0, Some(50.0), 0.0);
        let (_, long_oversold, _) = a.combine(101.2, 100.0, Some(20.0), 0.0);
        assert_eq!(long_plain, long_oversold);
    }

    #[test]
    fn test_volatility_damping() {
        assert_eq!(volatility_damping(0.004, 0.005), 1.0);
        assert!((volatility_damping(0.0075, 0.005) - 0.5).abs() < 1e-9);
        assert_eq!(volatility_damping(0.02, 0.005), 0.0);

        let a = analyzer();
        let (_, calm, _) = a.combine(101.2, 100.0, None, 0.001);
        let (_, wild, _) = a.combine(101.2, 100.0, None, 0.05);
        assert!(calm > 0.0);
        assert_eq!(wild, 0.0);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let (_, confidence, _) = analyzer().combine(150.0, 100.0, None, 0.0);
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn test_analyze_is_deterministic() {
        let a = analyzer();
        let prices = series(&geometric(50.0, 1.003, 40));
        let volumes = vec![dec!(10); 40];
        assert_eq!(a.analyze(&prices, &volumes), a.analyze(&prices, &volumes));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = PriceWindow::new(3);
        for (i, p) in series(&[1.0, 2.0, 3.0, 4.0, 5.0]).into_iter().enumerate() {
            window.push(p, Decimal::from(i as u32));
        }
        let (prices, volumes) = window.snapshot();
        assert_eq!(window.len(), 3);
        assert_eq!(prices[0].price, dec!(3));
        assert_eq!(volumes, vec![dec!(2), dec!(3), dec!(4)]);
    }

    #[test]
    fn test_relative_volume() {
        assert_eq!(relative_volume(&[dec!(1), dec!(1), dec!(4)]), Some(2.0));
        assert_eq!(relative_volume(&[]), None);
    }

    #[test]
    fn test_ema_seeding() {
        assert_eq!(ema(&[1.0, 2.0, 3.0], 3), Some(2.0));
        assert_eq!(ema(&[1.0, 2.0], 3), None);
    }
}
