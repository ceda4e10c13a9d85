//! Shared data types for all backends
//!
//! Records, filters and stats used by the HTTP and in-memory backends as well
//! as the domain layer.

mod enums;
mod filters;
mod records;
mod stats;

pub use enums::{ChangeTable, SpanKind, SpanStatus};
pub use filters::{QueryFilters, TimeRange, TimeWindow};
pub use records::{
    ChangeEvent, HistorySample, Record, SessionRecord, SessionSnapshot, SpanRecord, TraceRecord,
};
pub use stats::Stats;
