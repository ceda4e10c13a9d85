//! Telemetry engine
//!
//! [`TelemetryEngine`] is a cheap, cloneable handle over the engine actor.
//! Mutations go through the actor's command channel and resolve once the
//! actor has applied them and published the resulting snapshot; reads are
//! lock-free loads of the latest [`EngineSnapshot`].
//!
//! ```ignore
//! let engine = TelemetryEngine::spawn(Arc::new(backend), EngineConfig::default());
//! engine.configure("store-42").await?;
//! let mut updates = engine.subscribe();
//! while updates.changed().await.is_ok() {
//!     let snap = updates.borrow_and_update().clone();
//!     println!("{} sessions", snap.sessions.len());
//! }
//! ```

mod actor;
pub mod controller;
pub mod ingest;
pub mod snapshot;


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use actor::{Ack, Command, EngineActor};
use controller::{FilterChange, QueryController};
use ingest::{IngestionClient, ReconnectPolicy};
use crate::core::constants::{
    COMPARISON_CACHE_MAX_CAPACITY, COMPARISON_FETCH_ATTEMPTS, COMPARISON_RETRY_BASE_MS,
    DEFAULT_COMPARISON_CACHE_TTL_SECS, DEFAULT_RECONNECT_BASE_DELAY_MS,
    DEFAULT_RECONNECT_MAX_DELAY_MS, DEFAULT_TIMEOUT_SECS, ENGINE_COMMAND_BUFFER,
};
use crate::data::error::DataError;
use crate::data::traits::TelemetryBackend;
use crate::data::types::{HistorySample, QueryFilters, TimeRange};
use crate::domain::comparison::{ComparisonOutcome, ComparisonPolicy, compare_span, comparable_tool};
use crate::domain::liveness::LivenessPolicy;
use crate::utils::retry::retry_with_backoff_async;

pub use snapshot::{EngineSnapshot, LoadState};

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fetch_timeout: Duration,
    pub liveness: LivenessPolicy,
    pub comparison: ComparisonPolicy,
    pub comparison_cache_ttl: Duration,
    pub reconnect: ReconnectPolicy,
    pub command_buffer: usize,
    /// Filters in effect before any mutation
    pub initial_filters: QueryFilters,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            liveness: LivenessPolicy::default(),
            comparison: ComparisonPolicy::default(),
            comparison_cache_ttl: Duration::from_secs(DEFAULT_COMPARISON_CACHE_TTL_SECS),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
                max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS),
            },
            command_buffer: ENGINE_COMMAND_BUFFER,
            initial_filters: QueryFilters::default(),
        }
    }
}

type PopulationKey = (String, String);

#[derive(Clone)]
pub struct TelemetryEngine {
    tx: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<EngineSnapshot>>,
    ingest: IngestionClient,
    populations: Cache<PopulationKey, Arc<Vec<HistorySample>>>,
    comparison: ComparisonPolicy,
    shutdown: CancellationToken,
    actor: Arc<Mutex<Option<JoinHandle<()>>>>,
    _guard: Arc<DropGuard>,
}

impl TelemetryEngine {
    /// Start the engine actor on the current runtime
    pub fn spawn(backend: Arc<dyn TelemetryBackend>, config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let initial = EngineSnapshot::idle(config.initial_filters.clone(), config.liveness);
        let (snapshot_tx, snapshots) = watch::channel(Arc::new(initial));
        let ingest = IngestionClient::new(backend, config.fetch_timeout, config.reconnect);
        let shutdown = CancellationToken::new();

        let actor = EngineActor::new(
            ingest.clone(),
            config.liveness,
            QueryController::new(config.initial_filters.clone()),
            rx,
            tx.downgrade(),
            snapshot_tx,
            shutdown.clone(),
        );
        let handle = tokio::spawn(actor.run());

        let populations = Cache::builder()
            .max_capacity(COMPARISON_CACHE_MAX_CAPACITY)
            .time_to_live(config.comparison_cache_ttl)
            .build();

        Self {
            tx,
            snapshots,
            ingest,
            populations,
            comparison: config.comparison,
            _guard: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
            actor: Arc::new(Mutex::new(Some(handle))),
        }
    }

    async fn call(&self, command: impl FnOnce(Ack) -> Command) -> Result<(), DataError> {
        let (done, applied) = oneshot::channel();
        self.tx
            .send(command(done))
            .await
            .map_err(|_| DataError::EngineClosed)?;
        applied.await.map_err(|_| DataError::EngineClosed)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Point the engine at `scope`: drops the previous scope's state, starts
    /// the realtime feed and issues the initial fetches.
    pub async fn configure(&self, scope: impl Into<String>) -> Result<(), DataError> {
        let scope = scope.into();
        if scope.trim().is_empty() {
            return Err(DataError::Config("scope must not be empty".to_string()));
        }
        self.call(|done| Command::Configure { scope, done }).await
    }

    /// Stop the feed and forget all data; filters are kept
    pub async fn teardown(&self) -> Result<(), DataError> {
        self.call(|done| Command::Teardown { done }).await
    }

    /// Stop the actor and every task it owns
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.actor.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && e.is_panic()
        {
            tracing::error!("Engine actor panicked");
        }
    }

    // ========================================================================
    // FILTERS
    // ========================================================================

    pub async fn set_time_range(&self, range: TimeRange) -> Result<(), DataError> {
        self.filter(FilterChange::TimeRange(range)).await
    }

    pub async fn set_source_filter(&self, source: Option<String>) -> Result<(), DataError> {
        self.filter(FilterChange::Source(source)).await
    }

    pub async fn set_agent_filter(&self, agent: Option<String>) -> Result<(), DataError> {
        self.filter(FilterChange::Agent(agent)).await
    }

    pub async fn set_only_errors(&self, only_errors: bool) -> Result<(), DataError> {
        self.filter(FilterChange::OnlyErrors(only_errors)).await
    }

    async fn filter(&self, change: FilterChange) -> Result<(), DataError> {
        self.call(|done| Command::Filter { change, done }).await
    }

    /// Re-issue both fetches with the current filters
    pub async fn refresh(&self) -> Result<(), DataError> {
        self.call(|done| Command::Refresh { done }).await
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Notified after every publish
    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineSnapshot>> {
        self.snapshots.clone()
    }

    /// Compare a span from the current working set with its tool's history.
    ///
    /// Reads the latest snapshot and the backend directly; the actor is not
    /// involved.
    pub async fn compare(&self, span_id: &str) -> Result<ComparisonOutcome, DataError> {
        let snapshot = self.snapshot();
        let scope = snapshot.scope.as_deref().ok_or(DataError::NotConfigured)?;
        let span = snapshot.find_span(span_id);
        let tool = match comparable_tool(span) {
            Ok((_, tool, _)) => tool.to_string(),
            Err(reason) => return Ok(ComparisonOutcome::unavailable(reason)),
        };

        let population = self.population(scope, &tool).await?;
        Ok(compare_span(span, &population, &self.comparison, Utc::now()))
    }

    async fn population(&self, scope: &str, tool: &str) -> Result<Arc<Vec<HistorySample>>, DataError> {
        let key = (scope.to_string(), tool.to_string());
        if let Some(cached) = self.populations.get(&key).await {
            return Ok(cached);
        }

        let since = Utc::now() - self.comparison.window;
        let (samples, attempts) = retry_with_backoff_async(
            COMPARISON_FETCH_ATTEMPTS,
            COMPARISON_RETRY_BASE_MS,
            DataError::is_transient,
            || self.ingest.fetch_span_history(scope, tool, since),
        )
        .await
        .map_err(|(e, attempts)| {
            tracing::warn!(scope, tool, attempts, error = %e, "Comparison population fetch failed");
            e
        })?;
        tracing::debug!(scope, tool, attempts, samples = samples.len(), "Loaded comparison population");

        let samples = Arc::new(samples);
        self.populations.insert(key, samples.clone()).await;
        Ok(samples)
    }
}
