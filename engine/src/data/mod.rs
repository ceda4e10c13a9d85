//! Data access layer
//!
//! Provides the telemetry sources the engine reads from:
//! - `http` - JSON queries plus an SSE change feed against the telemetry service
//! - `memory` - In-process store with a broadcast feed and scripted calls
//! - `decode` - Per-record decoding shared by both backends
//! - `types` - Records, filters and stats shared across the crate
//! - `traits` - The `TelemetryBackend` seam
//! - `error` - Unified error type

pub mod decode;
pub mod error;
pub mod http;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::DataError;
pub use http::HttpBackend;
pub use memory::{BackendCall, MemoryBackend, RecordedCall, Scripted};
pub use traits::{ChangeSubscription, TelemetryBackend};
