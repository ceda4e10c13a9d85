//! In-memory backend
//!
//! Serves historical queries from an in-process store and fans realtime
//! changes out over tokio broadcast channels (one per scope).
//!
//! Calls can be scripted with delays and failures, which makes the backend
//! suitable for exercising timeouts, stale responses and reconnects.
//!
//! ## Limitations
//!
//! - Session queries apply only the time window and source filter; agent and
//!   errors-only filters are left to the session builder. Stats apply all
//!   filters, grouping spans by their root session the way the builder does.
//! - Stored records are merged field by field like the engine does, so a
//!   partial upsert never erases earlier fields.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;

use super::error::DataError;
use super::traits::{ChangeSubscription, TelemetryBackend};
use super::types::{
    ChangeEvent, HistorySample, QueryFilters, Record, SessionRecord, SessionSnapshot, SpanRecord,
    Stats, TimeWindow, TraceRecord,
};
use crate::domain::stats::{StatSample, compute_stats};

/// Default change feed capacity per scope
const DEFAULT_FEED_CAPACITY: usize = 1_024;

/// Parent hops followed when resolving a session's effective source
const MAX_SOURCE_HOPS: usize = 4;

/// Backend operation, used to script and inspect calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCall {
    Stats,
    Sessions,
    History,
    Subscribe,
}

/// Scripted behavior for the next call of one kind
#[derive(Debug, Clone, Default)]
pub struct Scripted {
    pub delay: Option<Duration>,
    pub failure: Option<DataError>,
}

impl Scripted {
    pub fn delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            failure: None,
        }
    }

    pub fn fail(error: DataError) -> Self {
        Self {
            delay: None,
            failure: Some(error),
        }
    }

    /// Fail after the delay
    pub fn then_fail(mut self, error: DataError) -> Self {
        self.failure = Some(error);
        self
    }
}

/// A call as observed by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub call: BackendCall,
    pub scope: String,
    pub filters: Option<QueryFilters>,
}

#[derive(Default)]
struct ScopeData {
    sessions: FxHashMap<String, SessionRecord>,
    traces: FxHashMap<String, TraceRecord>,
    spans: FxHashMap<String, SpanRecord>,
}

impl ScopeData {
    fn upsert(&mut self, change: ChangeEvent) {
        fn merge<R: Record + Clone>(map: &mut FxHashMap<String, R>, record: R) {
            match map.get_mut(record.id()) {
                Some(existing) => {
                    existing.merge_from(record);
                }
                None => {
                    map.insert(record.id().to_string(), record);
                }
            }
        }
        match change {
            ChangeEvent::Span(r) => merge(&mut self.spans, r),
            ChangeEvent::Trace(r) => merge(&mut self.traces, r),
            ChangeEvent::Session(r) => merge(&mut self.sessions, r),
        }
    }

    fn effective_source(&self, session_id: &str) -> Option<&str> {
        let mut current = self.sessions.get(session_id)?;
        for _ in 0..MAX_SOURCE_HOPS {
            if let Some(source) = current.source.as_deref() {
                return Some(source);
            }
            current = self
                .sessions
                .get(current.parent_conversation_id.as_deref()?)?;
        }
        None
    }

    fn span_session<'a>(&'a self, span: &'a SpanRecord) -> Option<&'a str> {
        span.session_id.as_deref().or_else(|| {
            let trace = self.traces.get(span.trace_id.as_deref()?)?;
            trace.session_id.as_deref()
        })
    }

    /// Topmost known ancestor of a session
    fn root_of<'a>(&'a self, session_id: &'a str) -> &'a str {
        let mut current = session_id;
        for _ in 0..MAX_SOURCE_HOPS {
            match self
                .sessions
                .get(current)
                .and_then(|s| s.parent_conversation_id.as_deref())
                .filter(|p| *p != current && self.sessions.contains_key(*p))
            {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Keep spans whose root session passes the agent and errors-only filters
    fn filter_stat_spans(&self, spans: Vec<SpanRecord>, filters: &QueryFilters) -> Vec<SpanRecord> {
        if filters.agent.is_none() && !filters.only_errors {
            return spans;
        }

        let mut agent_roots: FxHashSet<&str> = FxHashSet::default();
        for session in self.sessions.values() {
            if filters.matches_agent(session.agent_name.as_deref()) {
                agent_roots.insert(self.root_of(&session.id));
            }
        }
        let mut error_roots: FxHashSet<&str> = FxHashSet::default();
        for span in &spans {
            if span.status.is_some_and(|s| s.is_error())
                && let Some(session) = self.span_session(span)
            {
                error_roots.insert(self.root_of(session));
            }
        }

        let keep: Vec<bool> = spans
            .iter()
            .map(|span| {
                let Some(root) = self.span_session(span).map(|id| self.root_of(id)) else {
                    return false;
                };
                (filters.agent.is_none() || agent_roots.contains(root))
                    && (!filters.only_errors || error_roots.contains(root))
            })
            .collect();
        spans
            .into_iter()
            .zip(keep)
            .filter_map(|(span, keep)| keep.then_some(span))
            .collect()
    }

    fn session_allowed(&self, session_id: Option<&str>, filters: &QueryFilters) -> bool {
        if filters.source.is_none() {
            return true;
        }
        session_id.is_some_and(|id| filters.matches_source(self.effective_source(id)))
    }

    fn snapshot(&self, window: &TimeWindow, filters: &QueryFilters) -> SessionSnapshot {
        let in_window = |t: Option<DateTime<Utc>>| t.is_none_or(|t| window.contains(t));

        let spans: Vec<SpanRecord> = self
            .spans
            .values()
            .filter(|s| in_window(s.start_time))
            .filter(|s| self.session_allowed(self.span_session(s), filters))
            .cloned()
            .collect();
        let traces: Vec<TraceRecord> = self
            .traces
            .values()
            .filter(|t| {
                in_window(t.started_at)
                    || spans.iter().any(|s| s.trace_id.as_deref() == Some(t.id.as_str()))
            })
            .filter(|t| self.session_allowed(t.session_id.as_deref(), filters))
            .cloned()
            .collect();
        let sessions: Vec<SessionRecord> = self
            .sessions
            .values()
            .filter(|s| self.session_allowed(Some(&s.id), filters))
            .cloned()
            .collect();

        SessionSnapshot {
            sessions,
            traces,
            spans,
        }
    }
}

struct SharedState {
    scopes: RwLock<FxHashMap<String, ScopeData>>,
    feeds: RwLock<FxHashMap<String, broadcast::Sender<Result<ChangeEvent, DataError>>>>,
    script: Mutex<FxHashMap<BackendCall, VecDeque<Scripted>>>,
    calls: Mutex<Vec<RecordedCall>>,
    feed_capacity: usize,
}

/// In-memory telemetry backend
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<SharedState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// Create with a custom per-scope feed capacity
    pub fn with_feed_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(SharedState {
                scopes: RwLock::new(FxHashMap::default()),
                feeds: RwLock::new(FxHashMap::default()),
                script: Mutex::new(FxHashMap::default()),
                calls: Mutex::new(Vec::new()),
                feed_capacity: capacity.max(1),
            }),
        }
    }

    /// Store a record without notifying subscribers (historical data)
    pub fn insert(&self, scope: &str, change: ChangeEvent) {
        self.state
            .scopes
            .write()
            .entry(scope.to_string())
            .or_default()
            .upsert(change);
    }

    /// Store a record and push it to live subscribers
    pub fn publish(&self, scope: &str, change: ChangeEvent) {
        self.insert(scope, change.clone());
        self.send(scope, Ok(change));
    }

    /// Push an error item (e.g. a decode failure) to live subscribers
    pub fn publish_error(&self, scope: &str, error: DataError) {
        self.send(scope, Err(error));
    }

    /// Drop the scope's feed; open subscriptions end
    pub fn disconnect(&self, scope: &str) {
        self.state.feeds.write().remove(scope);
    }

    /// Queue scripted behavior for the next call of `call`
    pub fn script(&self, call: BackendCall, scripted: Scripted) {
        self.state
            .script
            .lock()
            .entry(call)
            .or_default()
            .push_back(scripted);
    }

    /// Calls of one kind, oldest first
    pub fn calls(&self, call: BackendCall) -> Vec<RecordedCall> {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|c| c.call == call)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, call: BackendCall) -> usize {
        self.state.calls.lock().iter().filter(|c| c.call == call).count()
    }

    /// Live subscribers on a scope's feed
    pub fn subscriber_count(&self, scope: &str) -> usize {
        self.state
            .feeds
            .read()
            .get(scope)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn send(&self, scope: &str, item: Result<ChangeEvent, DataError>) {
        if let Some(tx) = self.state.feeds.read().get(scope) {
            // No receivers is fine
            let _ = tx.send(item);
        }
    }

    fn get_or_create_feed(&self, scope: &str) -> broadcast::Sender<Result<ChangeEvent, DataError>> {
        if let Some(tx) = self.state.feeds.read().get(scope) {
            return tx.clone();
        }
        let mut feeds = self.state.feeds.write();
        feeds
            .entry(scope.to_string())
            .or_insert_with(|| broadcast::channel(self.state.feed_capacity).0)
            .clone()
    }

    async fn enter(
        &self,
        call: BackendCall,
        scope: &str,
        filters: Option<&QueryFilters>,
    ) -> Result<(), DataError> {
        self.state.calls.lock().push(RecordedCall {
            call,
            scope: scope.to_string(),
            filters: filters.cloned(),
        });
        let scripted = self
            .state
            .script
            .lock()
            .get_mut(&call)
            .and_then(VecDeque::pop_front);

        let Some(scripted) = scripted else {
            return Ok(());
        };
        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }
        match scripted.failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TelemetryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_stats(
        &self,
        scope: &str,
        window: &TimeWindow,
        filters: &QueryFilters,
    ) -> Result<Stats, DataError> {
        self.enter(BackendCall::Stats, scope, Some(filters)).await?;

        let scopes = self.state.scopes.read();
        let Some(data) = scopes.get(scope) else {
            return Ok(Stats::default());
        };
        let spans = data.filter_stat_spans(data.snapshot(window, filters).spans, filters);
        Ok(compute_stats(
            spans.iter().filter_map(StatSample::from_record),
            window,
        ))
    }

    async fn fetch_sessions(
        &self,
        scope: &str,
        window: &TimeWindow,
        filters: &QueryFilters,
    ) -> Result<SessionSnapshot, DataError> {
        self.enter(BackendCall::Sessions, scope, Some(filters)).await?;

        Ok(self
            .state
            .scopes
            .read()
            .get(scope)
            .map(|data| data.snapshot(window, filters))
            .unwrap_or_default())
    }

    async fn fetch_span_history(
        &self,
        scope: &str,
        tool: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>, DataError> {
        self.enter(BackendCall::History, scope, None).await?;

        let scopes = self.state.scopes.read();
        let Some(data) = scopes.get(scope) else {
            return Ok(Vec::new());
        };
        Ok(data
            .spans
            .values()
            .filter(|s| s.tool_name.as_deref() == Some(tool))
            .filter_map(|s| {
                let start_time = s.start_time.filter(|t| *t >= since)?;
                Some(HistorySample {
                    duration_ms: s.duration_ms,
                    status: s.status.unwrap_or_default(),
                    start_time,
                })
            })
            .collect())
    }

    async fn subscribe(&self, scope: &str) -> Result<ChangeSubscription, DataError> {
        self.enter(BackendCall::Subscribe, scope, None).await?;

        let mut receiver = self.get_or_create_feed(scope).subscribe();
        let stream = stream! {
            loop {
                match receiver.recv().await {
                    Ok(item) => yield item,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Err(DataError::RealtimeDisconnect(format!("lagged by {} events", n)));
                        break;
                    }
                }
            }
        };

        Ok(ChangeSubscription {
            receiver: Box::pin(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::StreamExt;

    use crate::data::types::{SpanStatus, TimeRange};

    const SCOPE: &str = "store-1";

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 11, min, 0).unwrap()
    }

    fn window() -> TimeWindow {
        TimeRange::LastHour.window(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap())
    }

    fn span(id: &str, trace: &str, start: DateTime<Utc>, ms: i64) -> ChangeEvent {
        ChangeEvent::Span(SpanRecord {
            id: id.into(),
            trace_id: Some(trace.into()),
            tool_name: Some("lookup".into()),
            start_time: Some(start),
            duration_ms: Some(ms),
            ..Default::default()
        })
    }

    fn session(id: &str, source: Option<&str>, parent: Option<&str>) -> ChangeEvent {
        ChangeEvent::Session(SessionRecord {
            id: id.into(),
            source: source.map(Into::into),
            parent_conversation_id: parent.map(Into::into),
            ..Default::default()
        })
    }

    fn trace(id: &str, session: &str) -> ChangeEvent {
        ChangeEvent::Trace(TraceRecord {
            id: id.into(),
            session_id: Some(session.into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_fetch_sessions_filters_window() {
        let backend = MemoryBackend::new();
        backend.insert(SCOPE, span("s1", "t1", at(10), 10));
        backend.insert(
            SCOPE,
            span("old", "t0", Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(), 10),
        );

        let snapshot = backend
            .fetch_sessions(SCOPE, &window(), &QueryFilters::default())
            .await
            .unwrap();
        assert_eq!(snapshot.spans.len(), 1);
        assert_eq!(snapshot.spans[0].id, "s1");
    }

    #[tokio::test]
    async fn test_fetch_sessions_source_follows_parent() {
        let backend = MemoryBackend::new();
        backend.insert(SCOPE, session("root", Some("pos"), None));
        backend.insert(SCOPE, session("child", None, Some("root")));
        backend.insert(SCOPE, session("other", Some("web"), None));
        backend.insert(SCOPE, trace("t1", "child"));
        backend.insert(SCOPE, trace("t2", "other"));

        let filters = QueryFilters {
            source: Some("pos".into()),
            ..Default::default()
        };
        let snapshot = backend.fetch_sessions(SCOPE, &window(), &filters).await.unwrap();

        let mut ids: Vec<_> = snapshot.sessions.iter().map(|s| s.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["child", "root"]);
        assert_eq!(snapshot.traces.len(), 1);
        assert_eq!(snapshot.traces[0].id, "t1");
    }

    #[tokio::test]
    async fn test_fetch_stats_uses_aggregator() {
        let backend = MemoryBackend::new();
        for (i, ms) in [10, 20, 30, 40].into_iter().enumerate() {
            backend.insert(SCOPE, span(&format!("s{i}"), "t1", at(i as u32), ms));
        }

        let stats = backend
            .fetch_stats(SCOPE, &window(), &QueryFilters::default())
            .await
            .unwrap();
        assert_eq!(stats.total_spans, 4);
        assert_eq!(stats.total_traces, 1);
        assert_eq!(stats.p50_ms, Some(20));
    }

    #[tokio::test]
    async fn test_fetch_stats_applies_agent_and_errors_filters() {
        let backend = MemoryBackend::new();
        backend.insert(
            SCOPE,
            ChangeEvent::Session(SessionRecord {
                id: "root".into(),
                agent_name: Some("restock".into()),
                ..Default::default()
            }),
        );
        backend.insert(SCOPE, session("child", None, Some("root")));
        backend.insert(
            SCOPE,
            ChangeEvent::Session(SessionRecord {
                id: "other".into(),
                agent_name: Some("pricing".into()),
                ..Default::default()
            }),
        );
        for (id, session_id, status) in [
            ("s1", "child", SpanStatus::Error),
            ("s2", "root", SpanStatus::Ok),
            ("s3", "other", SpanStatus::Ok),
        ] {
            backend.insert(
                SCOPE,
                ChangeEvent::Span(SpanRecord {
                    id: id.into(),
                    session_id: Some(session_id.into()),
                    start_time: Some(at(10)),
                    duration_ms: Some(10),
                    status: Some(status),
                    ..Default::default()
                }),
            );
        }

        let stats_for = |filters: QueryFilters| {
            let backend = backend.clone();
            async move { backend.fetch_stats(SCOPE, &window(), &filters).await.unwrap() }
        };

        let restock = stats_for(QueryFilters {
            agent: Some("restock".into()),
            ..Default::default()
        })
        .await;
        assert_eq!(restock.total_spans, 2);
        assert_eq!(restock.error_count, 1);

        let errors_only = stats_for(QueryFilters {
            only_errors: true,
            ..Default::default()
        })
        .await;
        assert_eq!(errors_only.total_spans, 2);

        let pricing_errors = stats_for(QueryFilters {
            agent: Some("pricing".into()),
            only_errors: true,
            ..Default::default()
        })
        .await;
        assert!(pricing_errors.is_empty());
    }

    #[tokio::test]
    async fn test_span_history_by_tool_and_since() {
        let backend = MemoryBackend::new();
        backend.insert(SCOPE, span("s1", "t1", at(10), 10));
        backend.insert(SCOPE, span("s2", "t1", at(30), 20));
        backend.insert(
            SCOPE,
            ChangeEvent::Span(SpanRecord {
                id: "s3".into(),
                tool_name: Some("other".into()),
                start_time: Some(at(40)),
                status: Some(SpanStatus::Error),
                ..Default::default()
            }),
        );

        let samples = backend
            .fetch_span_history(SCOPE, "lookup", at(20))
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].duration_ms, Some(20));
    }

    #[tokio::test]
    async fn test_insert_merges_partial_records() {
        let backend = MemoryBackend::new();
        backend.insert(SCOPE, span("s1", "t1", at(10), 10));
        backend.insert(
            SCOPE,
            ChangeEvent::Span(SpanRecord {
                id: "s1".into(),
                status: Some(SpanStatus::Error),
                ..Default::default()
            }),
        );

        let snapshot = backend
            .fetch_sessions(SCOPE, &window(), &QueryFilters::default())
            .await
            .unwrap();
        assert_eq!(snapshot.spans[0].duration_ms, Some(10));
        assert_eq!(snapshot.spans[0].status, Some(SpanStatus::Error));
    }

    #[tokio::test]
    async fn test_scripted_failure_then_success() {
        let backend = MemoryBackend::new();
        backend.script(
            BackendCall::Stats,
            Scripted::fail(DataError::Network("refused".into())),
        );

        let filters = QueryFilters::default();
        assert!(backend.fetch_stats(SCOPE, &window(), &filters).await.is_err());
        assert!(backend.fetch_stats(SCOPE, &window(), &filters).await.is_ok());
        assert_eq!(backend.call_count(BackendCall::Stats), 2);
    }

    #[tokio::test]
    async fn test_subscribe_receives_published_and_ends_on_disconnect() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe(SCOPE).await.unwrap();
        assert_eq!(backend.subscriber_count(SCOPE), 1);

        backend.publish(SCOPE, span("s1", "t1", at(10), 10));
        backend.publish_error(
            SCOPE,
            DataError::decode(crate::data::types::ChangeTable::Span, "bad"),
        );
        backend.disconnect(SCOPE);

        let first = sub.receiver.next().await.unwrap().unwrap();
        assert_eq!(first.id(), "s1");
        assert!(sub.receiver.next().await.unwrap().is_err());
        assert!(sub.receiver.next().await.is_none());
    }
}
