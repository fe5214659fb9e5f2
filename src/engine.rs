//! Trading engine: the control loop.
//!
//! One cycle at a time:
//! - FETCH the market snapshot (stale or invalid data skips the cycle)
//! - DECIDE a candidate order from the momentum signal and position
//! - EXECUTE it if the risk gate approves
//! - RECONCILE confirmed fills into position and performance state
//! - SLEEP until the next cycle
//!
//! Recoverable failures move the engine to RECOVERING with escalating
//! backoff. Too many consecutive failures stop it with a fatal error.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ExchangeClient, MarketDataSource, Throttle};
use crate::error::{ExchangeError, Result, TradingError};
use crate::metrics::{CycleOutcome, CycleRecord, MarketSnapshot, RecordSink, TracingSink};
use crate::models::{
    CorrelationSequence, FillStatus, MarketState, MomentumSignal, OrderIntent, OrderResult, OrderSide,
    PositionState, PricePoint, TimeInForce,
};
use crate::trading::order_utils::{reduction_size, round_size, size_decimals};
use crate::trading::{
    EngineConfig, MomentumAnalyzer, OrderExecutor, OrderManager, OrderStyle, PositionManager, PositionTracker,
    PriceWindow, RiskDecision, RiskGate, RiskManager, SignalGenerator, TradingConfig,
};

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Init,
    Running,
    Fetch,
    Decide,
    Execute,
    Reconcile,
    Sleep,
    Recovering,
    Stopping,
    Stopped,
}

/// Out-of-band inputs to the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A new trading day started: reset daily risk counters
    DayBoundary(NaiveDate),
    /// Pull all resting orders
    CancelAll,
}

/// Running counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub cycles: u64,
    pub skipped: u64,
    pub intents: u64,
    pub blocks: u64,
    pub fills: u64,
    pub rejections: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
}

/// Final report returned when the engine stops.
#[derive(Debug, Clone)]
pub struct EngineSummary {
    pub instrument: String,
    pub stats: EngineStats,
    pub position: PositionState,
    pub daily_realized_pnl: Decimal,
    pub wins: u32,
    pub losses: u32,
}

impl fmt::Display for EngineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Engine Summary ({}) ===", self.instrument)?;
        writeln!(f, "Cycles:          {} (skipped {})", self.stats.cycles, self.stats.skipped)?;
        writeln!(f, "Intents:         {} (blocked {})", self.stats.intents, self.stats.blocks)?;
        writeln!(f, "Fills:           {} (rejected {})", self.stats.fills, self.stats.rejections)?;
        writeln!(f, "Cycle Failures:  {}", self.stats.failures)?;
        writeln!(f, "Position:        {}", self.position.size)?;
        writeln!(f, "Notional:        ${:.2}", self.position.notional())?;
        if let Some(entry) = self.position.entry_price {
            writeln!(f, "Entry Price:     ${:.4}", entry)?;
        }
        writeln!(f, "Unrealized P&L:  ${:.2}", self.position.unrealized_pnl)?;
        writeln!(f, "Realized P&L:    ${:.2}", self.position.realized_pnl)?;
        writeln!(f, "Daily P&L:       ${:.2}", self.daily_realized_pnl)?;
        writeln!(f, "Trades:          {} won / {} lost", self.wins, self.losses)?;
        Ok(())
    }
}

/// What one cycle decided, for the record.
struct CycleTrace {
    market: Option<MarketState>,
    signal: Option<MomentumSignal>,
    intent: Option<OrderIntent>,
    decision: Option<RiskDecision>,
    results: Vec<OrderResult>,
    outcome: CycleOutcome,
}

pub struct TradingEngine {
    config: TradingConfig,
    size_decimals: u32,
    market_data: Arc<dyn MarketDataSource>,
    exchange: Arc<dyn ExchangeClient>,
    analyzer: Box<dyn SignalGenerator>,
    risk: Box<dyn RiskGate>,
    positions: Box<dyn PositionTracker>,
    orders: Box<dyn OrderExecutor>,
    sink: Box<dyn RecordSink>,
    window: PriceWindow,
    sequence: CorrelationSequence,
    /// When recent momentum entries were placed, oldest first
    momentum_entries: VecDeque<Instant>,
    control: Option<mpsc::Receiver<ControlEvent>>,
    shutdown: CancellationToken,
    state: EngineState,
    stats: EngineStats,
}

impl TradingEngine {
    /// Wire the default components. Fails on invalid configuration.
    pub fn new(
        config: TradingConfig,
        market_data: Arc<dyn MarketDataSource>,
        exchange: Arc<dyn ExchangeClient>,
        throttle: Arc<dyn Throttle>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let size_decimals = size_decimals(&config.asset);
        let orders = OrderManager::new(
            &config,
            size_decimals,
            exchange.clone(),
            throttle,
            shutdown.clone(),
        );

        Ok(Self {
            size_decimals,
            market_data,
            exchange,
            analyzer: Box::new(MomentumAnalyzer::new(&config.momentum)),
            risk: Box::new(RiskManager::new(&config.risk, size_decimals)),
            positions: Box::new(PositionManager::new(config.risk.max_position)),
            orders: Box::new(orders),
            sink: Box::new(TracingSink),
            window: PriceWindow::new(config.momentum.window_capacity),
            sequence: CorrelationSequence::new(),
            momentum_entries: VecDeque::new(),
            control: None,
            shutdown,
            state: EngineState::Init,
            stats: EngineStats::default(),
            config,
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_control(mut self, control: mpsc::Receiver<ControlEvent>) -> Self {
        self.control = Some(control);
        self
    }

    fn transition(&mut self, next: EngineState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Engine state");
            self.state = next;
        }
    }

    fn recovery_backoff(&self) -> ExponentialBackoff {
        let engine = &self.config.engine;
        ExponentialBackoff {
            initial_interval: engine.recovery_initial_backoff(),
            current_interval: engine.recovery_initial_backoff(),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: engine.recovery_max_backoff(),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run until shutdown or a fatal error.
    pub async fn run(&mut self) -> Result<EngineSummary> {
        self.transition(EngineState::Init);
        self.initialize().await?;
        self.transition(EngineState::Running);

        info!(
            instrument = %self.config.asset,
            cycle_interval_ms = self.config.engine.cycle_interval_ms,
            max_position = %self.config.risk.max_position,
            "Starting trading engine"
        );

        let mut recovery = self.recovery_backoff();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(()) => {
                    if self.stats.consecutive_failures > 0 {
                        info!(after = self.stats.consecutive_failures, "Engine recovered");
                    }
                    self.stats.consecutive_failures = 0;
                    recovery.reset();
                }
                Err(TradingError::Cancelled) => break,
                Err(e) if e.is_recoverable() => {
                    self.stats.failures += 1;
                    self.stats.consecutive_failures += 1;

                    if self.stats.consecutive_failures >= self.config.engine.max_consecutive_failures {
                        error!(
                            failures = self.stats.consecutive_failures,
                            error = %e,
                            "Too many consecutive cycle failures, stopping"
                        );
                        let failures = self.stats.consecutive_failures;
                        self.stop().await;
                        return Err(TradingError::ConsecutiveCycleFailure {
                            failures,
                            last: e.to_string(),
                        });
                    }

                    self.recover(&e, &mut recovery).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Fatal engine error");
                    self.stop().await;
                    return Err(e);
                }
            }

            if !self.sleep_until_next_cycle().await {
                break;
            }
        }

        self.stop().await;
        Ok(self.summary())
    }

    /// Load the exchange-reported position before the first cycle.
    async fn initialize(&mut self) -> Result<()> {
        info!(exchange = self.exchange.name(), "Initializing engine state");
        let position = self
            .exchange
            .position(&self.config.asset)
            .await
            .map_err(TradingError::from)?;

        if !position.size.is_zero() {
            self.positions.seed(position.size, position.entry_price);
        }
        Ok(())
    }

    async fn run_cycle(&mut self) -> Result<()> {
        self.stats.cycles += 1;
        self.drain_control().await;

        let late = self.orders.poll_pending().await;
        self.reconcile(&late);

        // FETCH
        self.transition(EngineState::Fetch);
        let market = self
            .market_data
            .current_state(&self.config.asset)
            .await
            .map_err(|e| self.fetch_failure(e))?;

        if !market.is_tradeable() {
            warn!(
                stale = market.is_stale,
                bid = %market.best_bid,
                ask = %market.best_ask,
                "Market data not tradeable, skipping cycle"
            );
            self.stats.skipped += 1;
            let reason = if market.is_stale { "stale" } else { "invalid" };
            self.emit(CycleTrace {
                market: Some(market),
                signal: None,
                intent: None,
                decision: None,
                results: late,
                outcome: CycleOutcome::Skipped {
                    reason: reason.to_string(),
                },
            });
            return Ok(());
        }

        // DECIDE
        self.transition(EngineState::Decide);
        self.positions.mark_to_market(market.mid_price);
        self.window
            .push(PricePoint::new(market.timestamp, market.mid_price), market.recent_volume);
        let (prices, volumes) = self.window.snapshot();
        let signal = self.analyzer.analyze(&prices, &volumes);

        let intent = self.propose_intent(&signal, &market);
        let decision = intent
            .as_ref()
            .map(|i| self.risk.evaluate(i, self.positions.state(), &market));
        self.risk.observe_mark(market.mid_price);

        // EXECUTE
        self.transition(EngineState::Execute);
        let mut results = Vec::new();
        let outcome = match (&intent, &decision) {
            (Some(intent), Some(RiskDecision::Approve { adjusted_size, throttled })) => {
                self.stats.intents += 1;
                if *throttled {
                    info!(size = %adjusted_size, "Order size throttled by recent performance");
                }
                let sized = intent.with_size(*adjusted_size);
                let result = self.orders.submit(&sized, &market).await?;
                if !sized.reduce_only && result.status != FillStatus::Rejected {
                    self.momentum_entries.push_back(Instant::now());
                }
                results.push(result);
                CycleOutcome::Executed
            }
            (Some(intent), Some(RiskDecision::Block(reason))) => {
                self.stats.intents += 1;
                self.stats.blocks += 1;
                warn!(
                    code = reason.code(),
                    correlation_id = intent.correlation_id,
                    side = %intent.side,
                    size = %intent.size,
                    "Trade blocked by risk"
                );
                if reason.requires_flatten() && self.orders.pending_count() > 0 {
                    results.extend(self.orders.cancel_all().await);
                }
                CycleOutcome::Blocked {
                    code: reason.code().to_string(),
                }
            }
            _ => {
                debug!(direction = %signal.direction, confidence = signal.confidence, "No order this cycle");
                CycleOutcome::NoAction
            }
        };

        // RECONCILE
        self.transition(EngineState::Reconcile);
        self.reconcile(&results);

        let mut recorded = late;
        recorded.extend(results);
        self.emit(CycleTrace {
            market: Some(market),
            signal: Some(signal),
            intent,
            decision,
            results: recorded,
            outcome,
        });
        Ok(())
    }

    /// Candidate order for this cycle, if any.
    fn propose_intent(&mut self, signal: &MomentumSignal, market: &MarketState) -> Option<OrderIntent> {
        let limits = &self.config.risk;
        let metrics = self.positions.metrics();
        let position = metrics.size;

        if self.positions.should_reduce(limits) {
            let side = OrderSide::for_delta(position)?.opposite();
            let size = reduction_size(
                position.abs(),
                self.config.engine.reduction_fraction,
                limits.min_notional,
                market.mid_price,
                self.size_decimals,
            );
            info!(
                position = %position,
                utilization = %metrics.utilization,
                unrealized_pnl = %metrics.unrealized_pnl,
                size = %size,
                "Position above soft limit, reducing"
            );
            return Some(OrderIntent::market(self.sequence.next_id(), side, size).reduce_only());
        }

        if !signal.is_actionable(self.config.engine.min_confidence) {
            return None;
        }

        if Self::momentum_entry_cap_reached(&mut self.momentum_entries, &self.config.engine) {
            debug!(
                entries = self.momentum_entries.len(),
                remaining_capacity = %metrics.remaining_capacity,
                "Momentum entry cap reached"
            );
            return None;
        }

        // Target stays inside the soft band.
        let confidence = Decimal::try_from(signal.confidence).unwrap_or(Decimal::ZERO);
        let target = round_size(
            signal.direction.sign() * limits.max_position * limits.soft_position_ratio * confidence,
            self.size_decimals,
        );
        let delta = target - position;
        let side = OrderSide::for_delta(delta)?;
        let size = round_size(delta.abs().min(self.config.base_position), self.size_decimals);
        if size.is_zero() {
            return None;
        }

        debug!(
            direction = %signal.direction,
            confidence = signal.confidence,
            target = %target,
            position = %position,
            "Proposing order"
        );

        let id = self.sequence.next_id();
        Some(match self.config.execution.order_style {
            OrderStyle::Market => OrderIntent::market(id, side, size),
            OrderStyle::PostOnly => {
                let price = match side {
                    OrderSide::Buy => market.best_bid,
                    OrderSide::Sell => market.best_ask,
                };
                OrderIntent::limit(id, side, size, price, TimeInForce::Alo)
            }
            OrderStyle::Limit => {
                let price = match side {
                    OrderSide::Buy => market.best_bid,
                    OrderSide::Sell => market.best_ask,
                };
                OrderIntent::limit(id, side, size, price, TimeInForce::Gtc)
            }
        })
    }

    /// Drop entries older than the window, then compare against the cap.
    fn momentum_entry_cap_reached(entries: &mut VecDeque<Instant>, config: &EngineConfig) -> bool {
        let window = config.momentum_entry_window();
        let now = Instant::now();
        while let Some(&oldest) = entries.front() {
            if now.duration_since(oldest) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
        entries.len() >= config.max_momentum_entries
    }

    fn fetch_failure(&self, err: ExchangeError) -> TradingError {
        match err {
            ExchangeError::RateLimited => TradingError::RateLimitExceeded {
                reason: "market data rate limited".to_string(),
                retry_after: self.config.rate_limit.initial_cooldown(),
            },
            ExchangeError::Cancelled => TradingError::Cancelled,
            other => TradingError::MarketData(other.to_string()),
        }
    }

    fn reconcile(&mut self, results: &[OrderResult]) {
        for result in results {
            if let Some(err) = &result.error {
                debug!(correlation_id = result.correlation_id, error = %err, "Result carries error");
            }
            if result.status == FillStatus::Rejected {
                self.stats.rejections += 1;
            }

            let outcome = self.positions.update(result);
            if outcome.applied {
                self.stats.fills += 1;
                self.risk.record_fill(result, outcome.realized_pnl);
            }
        }
    }

    async fn drain_control(&mut self) {
        let mut events = Vec::new();
        if let Some(rx) = self.control.as_mut() {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }

        for event in events {
            match event {
                ControlEvent::DayBoundary(day) => self.risk.on_day_boundary(day),
                ControlEvent::CancelAll => {
                    info!("Manual cancel-all requested");
                    let results = self.orders.cancel_all().await;
                    self.reconcile(&results);
                }
            }
        }
    }

    async fn recover(&mut self, err: &TradingError, backoff: &mut ExponentialBackoff) {
        self.transition(EngineState::Recovering);

        let mut wait = backoff
            .next_backoff()
            .unwrap_or(self.config.engine.recovery_max_backoff());
        if let TradingError::RateLimitExceeded { retry_after, .. } = err {
            wait = wait.max(*retry_after);
        }

        warn!(
            kind = err.kind(),
            error = %err,
            consecutive = self.stats.consecutive_failures,
            backoff_ms = wait.as_millis() as u64,
            "Cycle failed, recovering"
        );

        let mut results = Vec::new();
        if self.config.engine.cancel_on_recovery && self.orders.pending_count() > 0 {
            results = self.orders.cancel_all().await;
            self.reconcile(&results);
        }

        self.emit(CycleTrace {
            market: None,
            signal: None,
            intent: None,
            decision: None,
            results,
            outcome: CycleOutcome::Failed {
                error_kind: err.kind().to_string(),
                message: err.to_string(),
            },
        });

        self.pause(wait).await;
        self.transition(EngineState::Running);
    }

    /// Sleep, returning false if shutdown interrupted it.
    async fn pause(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    async fn sleep_until_next_cycle(&mut self) -> bool {
        self.transition(EngineState::Sleep);
        let resumed = self.pause(self.config.engine.cycle_interval()).await;
        if resumed {
            self.transition(EngineState::Running);
        }
        resumed
    }

    async fn stop(&mut self) {
        self.transition(EngineState::Stopping);
        info!("Stopping engine, cancelling resting orders");

        let results = self.orders.cancel_all().await;
        self.reconcile(&results);

        self.transition(EngineState::Stopped);
        info!(
            cycles = self.stats.cycles,
            fills = self.stats.fills,
            position = %self.positions.state().size,
            "Engine stopped"
        );
    }

    fn emit(&mut self, trace: CycleTrace) {
        let record = CycleRecord {
            cycle: self.stats.cycles,
            timestamp: Utc::now(),
            instrument: self.config.asset.clone(),
            market: trace.market.as_ref().map(MarketSnapshot::from),
            signal: trace.signal,
            intent: trace.intent,
            risk: trace.decision,
            results: trace.results,
            position: self.positions.state().clone(),
            outcome: trace.outcome,
        };
        self.sink.emit(&record);
    }

    pub fn summary(&self) -> EngineSummary {
        let performance = self.risk.performance();
        EngineSummary {
            instrument: self.config.asset.clone(),
            stats: self.stats.clone(),
            position: self.positions.state().clone(),
            daily_realized_pnl: performance.daily_realized_pnl,
            wins: performance.total_wins,
            losses: performance.total_losses,
        }
    }
}
