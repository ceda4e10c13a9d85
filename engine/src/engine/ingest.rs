//! Ingestion client
//!
//! Wraps a [`TelemetryBackend`] with the fetch timeout and runs the realtime
//! subscription loop: subscribe, forward decoded changes to the actor in
//! batches, and on disconnect resubscribe with backoff followed by a full
//! re-fetch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::actor::{Command, deliver};
use crate::data::error::DataError;
use crate::data::traits::TelemetryBackend;
use crate::data::types::{
    ChangeEvent, HistorySample, QueryFilters, SessionSnapshot, Stats, TimeWindow,
};
use crate::utils::retry::Backoff;

/// Most changes forwarded to the actor in one command
const MAX_CHANGE_BATCH: usize = 256;

/// Reconnect backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Clone)]
pub struct IngestionClient {
    backend: Arc<dyn TelemetryBackend>,
    fetch_timeout: Duration,
    reconnect: ReconnectPolicy,
}

impl IngestionClient {
    pub fn new(
        backend: Arc<dyn TelemetryBackend>,
        fetch_timeout: Duration,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self {
            backend,
            fetch_timeout,
            reconnect,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, DataError>
    where
        F: std::future::Future<Output = Result<T, DataError>>,
    {
        match tokio::time::timeout(self.fetch_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DataError::timeout(operation, self.fetch_timeout.as_secs())),
        }
    }

    pub async fn fetch_stats(
        &self,
        scope: &str,
        window: &TimeWindow,
        filters: &QueryFilters,
    ) -> Result<Stats, DataError> {
        self.bounded("fetch_stats", self.backend.fetch_stats(scope, window, filters))
            .await
    }

    pub async fn fetch_sessions(
        &self,
        scope: &str,
        window: &TimeWindow,
        filters: &QueryFilters,
    ) -> Result<SessionSnapshot, DataError> {
        self.bounded(
            "fetch_sessions",
            self.backend.fetch_sessions(scope, window, filters),
        )
        .await
    }

    pub async fn fetch_span_history(
        &self,
        scope: &str,
        tool: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>, DataError> {
        self.bounded(
            "fetch_span_history",
            self.backend.fetch_span_history(scope, tool, since),
        )
        .await
    }

    /// Run the realtime feed for `scope` until `token` is cancelled or the
    /// actor goes away.
    pub(crate) async fn run_feed(
        self,
        scope: String,
        epoch: u64,
        tx: mpsc::Sender<Command>,
        token: CancellationToken,
    ) {
        let mut backoff = Backoff::new(self.reconnect.base_delay, self.reconnect.max_delay);
        let mut needs_resync = false;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = self.bounded("subscribe", self.backend.subscribe(&scope)) => result,
            };

            let reason = match subscribed {
                Ok(subscription) => {
                    backoff.reset();
                    tracing::debug!(scope = %scope, backend = self.backend.name(), "Realtime feed connected");
                    if !deliver(&tx, Command::FeedStatus { epoch, connected: true }, &token).await {
                        return;
                    }
                    if needs_resync && !deliver(&tx, Command::Resync { epoch }, &token).await {
                        return;
                    }

                    let mut receiver = subscription.receiver;
                    loop {
                        let item = tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            item = receiver.next() => item,
                        };
                        let first = match item {
                            Some(Ok(change)) => change,
                            Some(Err(e @ DataError::Decode { .. })) => {
                                tracing::warn!(scope = %scope, error = %e, "Skipping malformed change");
                                continue;
                            }
                            Some(Err(e)) => break e.to_string(),
                            None => break "feed closed".to_string(),
                        };

                        let (changes, ended) = drain_ready(&mut receiver, first, &scope);
                        let command = Command::Changes {
                            epoch,
                            changes,
                            observed_at: Utc::now(),
                        };
                        if !deliver(&tx, command, &token).await {
                            return;
                        }
                        if let Some(reason) = ended {
                            break reason;
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            needs_resync = true;
            let delay = backoff.next_delay();
            tracing::warn!(
                scope = %scope,
                reason = %reason,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis(),
                "Realtime feed disconnected, resubscribing"
            );
            if !deliver(&tx, Command::FeedStatus { epoch, connected: false }, &token).await {
                return;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Collect changes that are already buffered behind `first`.
///
/// Returns the batch and, if the feed ended while draining, the reason.
fn drain_ready<S>(receiver: &mut S, first: ChangeEvent, scope: &str) -> (Vec<ChangeEvent>, Option<String>)
where
    S: futures::Stream<Item = Result<ChangeEvent, DataError>> + Unpin,
{
    let mut changes = vec![first];
    while changes.len() < MAX_CHANGE_BATCH {
        match receiver.next().now_or_never() {
            Some(Some(Ok(change))) => changes.push(change),
            Some(Some(Err(e @ DataError::Decode { .. }))) => {
                tracing::warn!(scope, error = %e, "Skipping malformed change");
            }
            Some(Some(Err(e))) => return (changes, Some(e.to_string())),
            Some(None) => return (changes, Some("feed closed".to_string())),
            None => break,
        }
    }
    (changes, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::{BackendCall, MemoryBackend, Scripted};
    use crate::data::types::{ChangeTable, SpanRecord, TimeRange};

    fn client(backend: &MemoryBackend, timeout_ms: u64) -> IngestionClient {
        IngestionClient::new(
            Arc::new(backend.clone()),
            Duration::from_millis(timeout_ms),
            ReconnectPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
        )
    }

    fn span(id: &str) -> ChangeEvent {
        ChangeEvent::Span(SpanRecord {
            id: id.into(),
            trace_id: Some("T1".into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_recoverable_error() {
        let backend = MemoryBackend::new();
        backend.script(BackendCall::Sessions, Scripted::delay(Duration::from_millis(300)));
        let window = TimeRange::LastHour.window(Utc::now());

        let err = client(&backend, 50)
            .fetch_sessions("store-1", &window, &QueryFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Timeout { operation: "fetch_sessions", .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_feed_forwards_changes_and_skips_decode_errors() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let task = tokio::spawn(client(&backend, 1_000).run_feed(
            "store-1".into(),
            7,
            tx,
            token.clone(),
        ));

        let Some(Command::FeedStatus { epoch: 7, connected: true }) = rx.recv().await else {
            panic!("expected connected status");
        };
        backend.publish_error("store-1", DataError::decode(ChangeTable::Span, "bad"));
        backend.publish("store-1", span("s1"));

        let mut ids = Vec::new();
        while ids.is_empty() {
            match rx.recv().await {
                Some(Command::Changes { epoch, changes, .. }) => {
                    assert_eq!(epoch, 7);
                    ids.extend(changes.iter().map(|c| c.id().to_string()));
                }
                Some(_) => {}
                None => panic!("feed stopped"),
            }
        }
        assert_eq!(ids, vec!["s1"]);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_feed_resubscribes_and_requests_resync() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let task = tokio::spawn(client(&backend, 1_000).run_feed(
            "store-1".into(),
            1,
            tx,
            token.clone(),
        ));

        assert!(matches!(
            rx.recv().await,
            Some(Command::FeedStatus { connected: true, .. })
        ));
        backend.disconnect("store-1");

        assert!(matches!(
            rx.recv().await,
            Some(Command::FeedStatus { connected: false, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(Command::FeedStatus { connected: true, .. })
        ));
        assert!(matches!(rx.recv().await, Some(Command::Resync { epoch: 1 })));
        assert_eq!(backend.call_count(BackendCall::Subscribe), 2);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_feed_retries_failed_subscribe() {
        let backend = MemoryBackend::new();
        backend.script(
            BackendCall::Subscribe,
            Scripted::fail(DataError::Network("refused".into())),
        );
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let task = tokio::spawn(client(&backend, 1_000).run_feed(
            "store-1".into(),
            1,
            tx,
            token.clone(),
        ));

        assert!(matches!(
            rx.recv().await,
            Some(Command::FeedStatus { connected: false, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(Command::FeedStatus { connected: true, .. })
        ));
        assert!(matches!(rx.recv().await, Some(Command::Resync { .. })));

        token.cancel();
        task.await.unwrap();
    }
}
