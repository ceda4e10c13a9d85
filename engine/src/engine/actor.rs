//! Engine actor
//!
//! The single writer of engine state. Control calls from handles, fetch
//! results and realtime changes all arrive as [`Command`]s on one channel;
//! the actor drains whatever is ready, applies it in order, rebuilds the
//! session tree once and publishes a new [`EngineSnapshot`].
//!
//! Every response is tagged with the scope epoch it was issued under and,
//! for fetches, the query generation. Anything older than current is dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::controller::{FilterChange, QueryController};
use super::ingest::IngestionClient;
use super::snapshot::{EngineSnapshot, LoadState};
use crate::data::error::DataError;
use crate::data::types::{ChangeEvent, SessionSnapshot, Stats, TimeWindow};
use crate::domain::builder::build_sessions;
use crate::domain::liveness::LivenessPolicy;
use crate::domain::merge::{Provenance, TelemetryStore};

/// Most commands applied before a publish
const MAX_BATCH: usize = 512;

pub(crate) type Ack = oneshot::Sender<()>;

pub(crate) enum Command {
    Configure { scope: String, done: Ack },
    Teardown { done: Ack },
    Filter { change: FilterChange, done: Ack },
    Refresh { done: Ack },
    SessionsLoaded {
        epoch: u64,
        generation: u64,
        issued_seq: u64,
        result: Result<SessionSnapshot, DataError>,
    },
    StatsLoaded {
        epoch: u64,
        generation: u64,
        result: Result<Stats, DataError>,
    },
    Changes {
        epoch: u64,
        changes: Vec<ChangeEvent>,
        observed_at: DateTime<Utc>,
    },
    FeedStatus { epoch: u64, connected: bool },
    Resync { epoch: u64 },
}

/// Send `cmd` unless `token` is cancelled first. Returns whether it was sent.
pub(crate) async fn deliver(
    tx: &mpsc::Sender<Command>,
    cmd: Command,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = tx.send(cmd) => sent.is_ok(),
    }
}

struct ActiveScope {
    scope: String,
    token: CancellationToken,
    feed: JoinHandle<()>,
}

pub(crate) struct EngineActor {
    ingest: IngestionClient,
    liveness: LivenessPolicy,
    rx: mpsc::Receiver<Command>,
    tx: mpsc::WeakSender<Command>,
    snapshots: watch::Sender<Arc<EngineSnapshot>>,
    shutdown: CancellationToken,

    store: TelemetryStore,
    controller: QueryController,
    active: Option<ActiveScope>,
    fetches: Vec<JoinHandle<()>>,
    epoch: u64,
    window: Option<TimeWindow>,
    stats: Option<Stats>,
    stats_state: LoadState,
    sessions_state: LoadState,
    realtime_connected: bool,
    version: u64,
}

impl EngineActor {
    pub(crate) fn new(
        ingest: IngestionClient,
        liveness: LivenessPolicy,
        controller: QueryController,
        rx: mpsc::Receiver<Command>,
        tx: mpsc::WeakSender<Command>,
        snapshots: watch::Sender<Arc<EngineSnapshot>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ingest,
            liveness,
            rx,
            tx,
            snapshots,
            shutdown,
            store: TelemetryStore::new(),
            controller,
            active: None,
            fetches: Vec::new(),
            epoch: 0,
            window: None,
            stats: None,
            stats_state: LoadState::Idle,
            sessions_state: LoadState::Idle,
            realtime_connected: false,
            version: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(backend = self.ingest.backend_name(), "Engine actor started");
        loop {
            let first = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            let mut acks = Vec::new();
            let mut dirty = self.handle(first, &mut acks).await;
            let mut applied = 1;
            while applied < MAX_BATCH {
                let Ok(cmd) = self.rx.try_recv() else { break };
                dirty |= self.handle(cmd, &mut acks).await;
                applied += 1;
            }

            tracing::trace!(applied, dirty, "Drained command batch");
            if dirty {
                self.publish();
            }
            for ack in acks {
                let _ = ack.send(());
            }
        }

        self.stop_scope().await;
        tracing::debug!("Engine actor stopped");
    }

    /// Apply one command. Returns whether the published view changed.
    async fn handle(&mut self, cmd: Command, acks: &mut Vec<Ack>) -> bool {
        match cmd {
            Command::Configure { scope, done } => {
                acks.push(done);
                self.configure(scope).await
            }
            Command::Teardown { done } => {
                acks.push(done);
                self.teardown().await
            }
            Command::Filter { change, done } => {
                acks.push(done);
                if !self.controller.apply(change) {
                    return false;
                }
                tracing::debug!(filters = ?self.controller.filters(), "Filters changed");
                self.start_queries();
                true
            }
            Command::Refresh { done } => {
                acks.push(done);
                self.start_queries();
                self.active.is_some()
            }
            Command::SessionsLoaded {
                epoch,
                generation,
                issued_seq,
                result,
            } => {
                if !self.accepts(epoch, Some(generation), "sessions") {
                    return false;
                }
                match result {
                    Ok(snapshot) => {
                        let empty = snapshot.is_empty();
                        self.store.replace_with(snapshot, issued_seq);
                        self.sessions_state = if empty && self.store.is_empty() {
                            LoadState::Empty
                        } else {
                            LoadState::Loaded
                        };
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Session fetch failed, keeping last data");
                        self.store.end_refetch();
                        self.sessions_state = LoadState::Failed(e);
                    }
                }
                true
            }
            Command::StatsLoaded {
                epoch,
                generation,
                result,
            } => {
                if !self.accepts(epoch, Some(generation), "stats") {
                    return false;
                }
                match result {
                    Ok(stats) => {
                        self.stats_state = if stats.is_empty() {
                            LoadState::Empty
                        } else {
                            LoadState::Loaded
                        };
                        self.stats = Some(stats);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Stats fetch failed, keeping last values");
                        self.stats_state = LoadState::Failed(e);
                    }
                }
                true
            }
            Command::Changes {
                epoch,
                changes,
                observed_at,
            } => {
                if !self.accepts(epoch, None, "changes") {
                    return false;
                }
                let mut changed = false;
                for change in changes {
                    changed |= self.store.apply(change, Provenance::Live { observed_at });
                }
                changed
            }
            Command::FeedStatus { epoch, connected } => {
                if !self.accepts(epoch, None, "feed status") {
                    return false;
                }
                let changed = self.realtime_connected != connected;
                self.realtime_connected = connected;
                changed
            }
            Command::Resync { epoch } => {
                if !self.accepts(epoch, None, "resync") {
                    return false;
                }
                tracing::info!("Realtime feed reconnected, refetching");
                self.start_queries();
                true
            }
        }
    }

    fn accepts(&self, epoch: u64, generation: Option<u64>, what: &'static str) -> bool {
        if epoch != self.epoch {
            tracing::debug!(what, epoch, current = self.epoch, "Discarding response for previous scope");
            return false;
        }
        if let Some(generation) = generation
            && !self.controller.is_current(generation)
        {
            tracing::debug!(
                what,
                generation,
                current = self.controller.generation(),
                "Discarding stale response"
            );
            return false;
        }
        true
    }

    async fn configure(&mut self, scope: String) -> bool {
        if self.active.as_ref().is_some_and(|a| a.scope == scope) {
            return false;
        }
        self.stop_scope().await;
        self.reset();

        tracing::info!(scope = %scope, "Configuring scope");
        let token = self.shutdown.child_token();
        let feed = match self.tx.upgrade() {
            Some(tx) => tokio::spawn(self.ingest.clone().run_feed(
                scope.clone(),
                self.epoch,
                tx,
                token.clone(),
            )),
            None => return false,
        };
        self.active = Some(ActiveScope { scope, token, feed });
        self.start_queries();
        true
    }

    async fn teardown(&mut self) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        tracing::info!(scope = %active.scope, "Tearing down scope");
        self.stop_scope().await;
        self.reset();
        true
    }

    /// Forget all state of the previous scope and start a new epoch
    fn reset(&mut self) {
        self.epoch += 1;
        self.store.clear();
        self.window = None;
        self.stats = None;
        self.stats_state = LoadState::Idle;
        self.sessions_state = LoadState::Idle;
        self.realtime_connected = false;
    }

    /// Cancel the feed and in-flight fetches, then wait for them to exit
    async fn stop_scope(&mut self) {
        self.controller.cancel();
        if let Some(active) = self.active.take() {
            active.token.cancel();
            if let Err(e) = active.feed.await
                && e.is_panic()
            {
                tracing::error!(scope = %active.scope, "Realtime feed task panicked");
            }
        }
        for fetch in self.fetches.drain(..) {
            let _ = fetch.await;
        }
    }

    /// Issue stats and session fetches under a fresh generation
    fn start_queries(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.fetches.retain(|h| !h.is_finished());

        let ticket = self.controller.begin(&active.token);
        let window = ticket.filters.time_range.window(Utc::now());
        let epoch = self.epoch;
        let issued_seq = self.store.begin_refetch();
        self.window = Some(window);
        self.sessions_state = LoadState::Loading;
        self.stats_state = LoadState::Loading;

        tracing::debug!(
            scope = %active.scope,
            generation = ticket.generation,
            "Issuing queries"
        );

        let sessions = {
            let ingest = self.ingest.clone();
            let scope = active.scope.clone();
            let filters = ticket.filters.clone();
            let token = ticket.token.clone();
            let tx = tx.clone();
            let generation = ticket.generation;
            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = ingest.fetch_sessions(&scope, &window, &filters) => result,
                };
                let cmd = Command::SessionsLoaded {
                    epoch,
                    generation,
                    issued_seq,
                    result,
                };
                deliver(&tx, cmd, &token).await;
            })
        };

        let stats = {
            let ingest = self.ingest.clone();
            let scope = active.scope.clone();
            let filters = ticket.filters;
            let token = ticket.token;
            let generation = ticket.generation;
            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = ingest.fetch_stats(&scope, &window, &filters) => result,
                };
                let cmd = Command::StatsLoaded {
                    epoch,
                    generation,
                    result,
                };
                deliver(&tx, cmd, &token).await;
            })
        };

        self.fetches.push(sessions);
        self.fetches.push(stats);
    }

    fn publish(&mut self) {
        let now = Utc::now();
        self.version += 1;
        let arrivals = self
            .store
            .recent_arrivals(now - self.liveness.arrival_grace)
            .map(|(table, id, at)| ((table, id.to_string()), at))
            .collect();

        let snapshot = EngineSnapshot {
            scope: self.active.as_ref().map(|a| a.scope.clone()),
            epoch: self.epoch,
            generation: self.controller.generation(),
            version: self.version,
            filters: self.controller.filters().clone(),
            window: self.window,
            sessions: build_sessions(&self.store, self.controller.filters()),
            sessions_state: self.sessions_state.clone(),
            stats: self.stats.clone(),
            stats_state: self.stats_state.clone(),
            realtime_connected: self.realtime_connected,
            built_at: now,
            liveness: self.liveness,
            arrivals,
        };
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}
