//! Domain logic: entity store, session tree, liveness, stats and comparisons
//!
//! Everything here is synchronous and side-effect free apart from the store's
//! own mutation; the engine actor drives it.

pub mod builder;
pub mod comparison;
pub mod liveness;
pub mod merge;
pub mod model;
pub mod stats;

pub use builder::build_sessions;
pub use comparison::{
    ComparisonOutcome, ComparisonPolicy, SpanComparison, UnavailableReason, compare_span,
};
pub use liveness::LivenessPolicy;
pub use merge::{Provenance, TelemetryStore};
pub use model::{
    Session, SessionRole, SessionTotals, Span, SyntheticKind, Trace, find_session, find_span,
    find_trace,
};
pub use stats::{StatSample, compute_stats, percentile};
