//! Per-cycle observability records.

mod record;

pub use record::{CycleOutcome, CycleRecord, JsonLinesSink, MarketSnapshot, RecordSink, TracingSink};
