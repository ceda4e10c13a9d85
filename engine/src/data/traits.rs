//! Backend trait for telemetry sources
//!
//! A backend answers historical queries and opens a realtime change feed for
//! one store scope. The HTTP backend talks to the telemetry service; the
//! memory backend serves an in-process store for tests and demos.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use super::error::DataError;
use super::types::{ChangeEvent, HistorySample, QueryFilters, SessionSnapshot, Stats, TimeWindow};

/// Realtime change feed for one scope.
///
/// Items are decoded changes or per-record decode errors. A
/// `RealtimeDisconnect` error or the end of the stream means the feed is gone
/// and must be reopened.
pub struct ChangeSubscription {
    pub receiver: Pin<Box<dyn Stream<Item = Result<ChangeEvent, DataError>> + Send>>,
}

/// Telemetry backend trait
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Aggregate stats for a window and filter set
    async fn fetch_stats(
        &self,
        scope: &str,
        window: &TimeWindow,
        filters: &QueryFilters,
    ) -> Result<Stats, DataError>;

    /// Historical sessions, traces and spans for a window and filter set
    async fn fetch_sessions(
        &self,
        scope: &str,
        window: &TimeWindow,
        filters: &QueryFilters,
    ) -> Result<SessionSnapshot, DataError>;

    /// Historical samples of one tool since `since`
    async fn fetch_span_history(
        &self,
        scope: &str,
        tool: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>, DataError>;

    /// Open the realtime change feed
    async fn subscribe(&self, scope: &str) -> Result<ChangeSubscription, DataError>;
}
