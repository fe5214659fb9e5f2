//! Structured record emitted once per engine cycle.

use std::io::Write;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::{MarketState, MomentumSignal, OrderIntent, OrderResult, PositionState};
use crate::trading::order_utils::spread_metrics;
use crate::trading::RiskDecision;

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// An order was sent to the exchange
    Executed,
    /// No order was needed
    NoAction,
    /// The risk gate refused the order
    Blocked { code: String },
    /// Market data could not drive a decision
    Skipped { reason: String },
    /// The cycle failed and the engine entered recovery
    Failed { error_kind: String, message: String },
}

/// Market fields worth keeping in a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub mid_price: Decimal,
    pub spread_pct: Decimal,
    pub spread_bps: Decimal,
    pub recent_volume: Decimal,
    pub is_stale: bool,
}

impl From<&MarketState> for MarketSnapshot {
    fn from(m: &MarketState) -> Self {
        let spread = spread_metrics(m);
        Self {
            best_bid: m.best_bid,
            best_ask: m.best_ask,
            mid_price: m.mid_price,
            spread_pct: spread.spread_pct,
            spread_bps: spread.spread_bps,
            recent_volume: m.recent_volume,
            is_stale: m.is_stale,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub market: Option<MarketSnapshot>,
    pub signal: Option<MomentumSignal>,
    pub intent: Option<OrderIntent>,
    pub risk: Option<RiskDecision>,
    pub results: Vec<OrderResult>,
    pub position: PositionState,
    pub outcome: CycleOutcome,
}

/// Consumer of cycle records (dashboard feed, log pipeline).
pub trait RecordSink: Send {
    fn emit(&mut self, record: &CycleRecord);
}

/// Writes each record as one JSON log line.
#[derive(Debug, Default)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn emit(&mut self, record: &CycleRecord) {
        match serde_json::to_string(record) {
            Ok(line) => info!(target: "cycle_record", cycle = record.cycle, record = %line, "Cycle record"),
            Err(e) => warn!(cycle = record.cycle, error = %e, "Failed to serialize cycle record"),
        }
    }
}

/// Appends each record as one JSON line to a writer, usually a file.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn emit(&mut self, record: &CycleRecord) {
        let written = serde_json::to_writer(&mut self.writer, record)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush());
        if let Err(e) = written {
            warn!(cycle = record.cycle, error = %e, "Failed to write cycle record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_record_serializes_outcome_tag() {
        let market = MarketState::from_top_of_book("HYPE", dec!(24.99), dec!(25.01), dec!(3), Utc::now());
        let record = CycleRecord {
            cycle: 7,
            timestamp: Utc::now(),
            instrument: "HYPE".to_string(),
            market: Some(MarketSnapshot::from(&market)),
            signal: Some(MomentumSignal::flat()),
            intent: None,
            risk: None,
            results: vec![],
            position: PositionState::flat(),
            outcome: CycleOutcome::Blocked {
                code: "SPREAD_TOO_TIGHT".to_string(),
            },
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["cycle"], 7);
        assert_eq!(value["outcome"]["kind"], "blocked");
        assert_eq!(value["outcome"]["code"], "SPREAD_TOO_TIGHT");
        assert_eq!(value["signal"]["direction"], "flat");
        assert_eq!(MarketSnapshot::from(&market).spread_bps, dec!(8));
    }

    #[test]
    fn test_json_lines_sink_writes_one_line_per_record() {
        let record = CycleRecord {
            cycle: 1,
            timestamp: Utc::now(),
            instrument: "HYPE".to_string(),
            market: None,
            signal: None,
            intent: None,
            risk: None,
            results: vec![],
            position: PositionState::flat(),
            outcome: CycleOutcome::Skipped {
                reason: "stale".to_string(),
            },
        };

        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit(&record);
        sink.emit(&CycleRecord {
            cycle: 2,
            outcome: CycleOutcome::NoAction,
            ..record.clone()
        });

        let text = String::from_utf8(sink.writer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["cycle"], 2);
        assert_eq!(second["outcome"]["kind"], "no_action");
    }
}
