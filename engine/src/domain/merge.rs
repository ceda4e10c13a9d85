//! Entity store with idempotent field-wise merge
//!
//! The store is the single source of truth the session tree is rebuilt
//! from. Entities are keyed by id and only ever upserted:
//! - present fields overwrite, absent fields never erase
//! - attribute maps merge per key
//! - re-applying an event changes nothing (and bumps no sequence number)
//!
//! Entities referenced before they arrive (the trace of a span, the session
//! of a trace or span) are created empty so the tree can place them.
//!
//! While a snapshot fetch is outstanding, realtime changes are also kept as
//! they arrived so they can be replayed over the snapshot field by field.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

use crate::data::types::{
    ChangeEvent, ChangeTable, Record, SessionRecord, SessionSnapshot, SpanRecord, TraceRecord,
};

/// Where a change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Historical snapshot
    Backfill,
    /// Realtime feed, observed locally at `observed_at`
    Live { observed_at: DateTime<Utc> },
}

type Table<R> = FxHashMap<String, R>;

/// Working set of sessions, traces and spans for one scope
#[derive(Debug, Default, Clone)]
pub struct TelemetryStore {
    sessions: Table<SessionRecord>,
    traces: Table<TraceRecord>,
    spans: Table<SpanRecord>,
    /// First realtime observation per entity
    arrivals: FxHashMap<(ChangeTable, String), DateTime<Utc>>,
    /// Realtime changes since the outstanding fetch was issued
    live_log: Vec<(u64, ChangeEvent)>,
    capturing: bool,
    seq: u64,
}

/// Merge `record` into `table`. Returns (changed, created).
fn upsert<R: Record>(table: &mut Table<R>, record: R) -> (bool, bool) {
    match table.get_mut(record.id()) {
        Some(existing) => (existing.merge_from(record), false),
        None => {
            table.insert(record.id().to_string(), record);
            (true, true)
        }
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic change counter; only bumps when something changed
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Start recording realtime changes for a snapshot fetch issued now.
    ///
    /// Returns the sequence to pass to [`Self::replace_with`]. Changes kept for
    /// any earlier fetch are dropped, since that fetch is superseded.
    pub fn begin_refetch(&mut self) -> u64 {
        self.live_log.clear();
        self.capturing = true;
        self.seq
    }

    /// Stop recording; the outstanding fetch will not be applied
    pub fn end_refetch(&mut self) {
        self.live_log.clear();
        self.capturing = false;
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.traces.is_empty() && self.spans.is_empty()
    }

    /// Apply one change. Returns whether the store changed.
    pub fn apply(&mut self, change: ChangeEvent, provenance: Provenance) -> bool {
        let next = self.seq + 1;
        let live = matches!(provenance, Provenance::Live { .. });
        let logged = (live && self.capturing).then(|| change.clone());
        let mut changed = false;
        let mut created: Vec<(ChangeTable, String)> = Vec::new();

        match change {
            ChangeEvent::Span(span) => {
                let trace_id = span.trace_id.clone();
                let session_id = span.session_id.clone();
                let id = span.id.clone();
                let (c, new) = upsert(&mut self.spans, span);
                changed |= c;
                if new {
                    created.push((ChangeTable::Span, id));
                }
                if let Some(trace_id) = trace_id {
                    changed |=
                        self.ensure_trace(&trace_id, session_id.clone(), &mut created);
                }
                if let Some(session_id) = session_id {
                    changed |= self.ensure_session(&session_id, &mut created);
                }
            }
            ChangeEvent::Trace(trace) => {
                let session_id = trace.session_id.clone();
                let id = trace.id.clone();
                let (c, new) = upsert(&mut self.traces, trace);
                changed |= c;
                if new {
                    created.push((ChangeTable::Trace, id));
                }
                if let Some(session_id) = session_id {
                    changed |= self.ensure_session(&session_id, &mut created);
                }
            }
            ChangeEvent::Session(session) => {
                let id = session.id.clone();
                let (c, new) = upsert(&mut self.sessions, session);
                changed |= c;
                if new {
                    created.push((ChangeTable::Session, id));
                }
            }
        }

        if let Provenance::Live { observed_at } = provenance {
            for key in created {
                self.arrivals.entry(key).or_insert(observed_at);
            }
        }
        if changed {
            self.seq = next;
            if let Some(change) = logged {
                self.live_log.push((next, change));
            }
        }
        changed
    }

    fn ensure_trace(
        &mut self,
        trace_id: &str,
        session_id: Option<String>,
        created: &mut Vec<(ChangeTable, String)>,
    ) -> bool {
        if self.traces.contains_key(trace_id) {
            return false;
        }
        let record = TraceRecord {
            id: trace_id.to_string(),
            session_id,
            ..Default::default()
        };
        upsert(&mut self.traces, record);
        created.push((ChangeTable::Trace, trace_id.to_string()));
        true
    }

    fn ensure_session(
        &mut self,
        session_id: &str,
        created: &mut Vec<(ChangeTable, String)>,
    ) -> bool {
        if self.sessions.contains_key(session_id) {
            return false;
        }
        let record = SessionRecord {
            id: session_id.to_string(),
            ..Default::default()
        };
        upsert(&mut self.sessions, record);
        created.push((ChangeTable::Session, session_id.to_string()));
        true
    }

    /// Replace the working set with a historical snapshot.
    ///
    /// Realtime changes recorded after `keep_after_seq` (i.e. while the
    /// snapshot was being fetched) are applied again on top of it, carrying
    /// only the fields they set.
    pub fn replace_with(&mut self, snapshot: SessionSnapshot, keep_after_seq: u64) {
        let previous = std::mem::take(self);
        self.seq = previous.seq;
        self.arrivals = previous.arrivals;

        for change in snapshot.into_events() {
            self.apply(change, Provenance::Backfill);
        }

        // Arrival instants were recorded when these were first seen live
        let mut replayed = 0;
        for (_, change) in previous
            .live_log
            .into_iter()
            .filter(|(seq, _)| *seq > keep_after_seq)
        {
            replayed += 1;
            let next = self.seq + 1;
            if self.merge_replayed(change) {
                self.seq = next;
            }
        }

        self.arrivals.retain(|(table, id), _| match table {
            ChangeTable::Span => self.spans.contains_key(id),
            ChangeTable::Trace => self.traces.contains_key(id),
            ChangeTable::Session => self.sessions.contains_key(id),
        });
        tracing::debug!(
            sessions = self.sessions.len(),
            traces = self.traces.len(),
            spans = self.spans.len(),
            replayed,
            "Replaced working set from snapshot"
        );
    }

    /// Merge a recorded realtime change without logging it again
    fn merge_replayed(&mut self, change: ChangeEvent) -> bool {
        let mut created = Vec::new();
        match change {
            ChangeEvent::Span(span) => {
                let trace_id = span.trace_id.clone();
                let session_id = span.session_id.clone();
                let (mut changed, _) = upsert(&mut self.spans, span);
                if let Some(trace_id) = trace_id {
                    changed |= self.ensure_trace(&trace_id, session_id.clone(), &mut created);
                }
                if let Some(session_id) = session_id {
                    changed |= self.ensure_session(&session_id, &mut created);
                }
                changed
            }
            ChangeEvent::Trace(trace) => {
                let session_id = trace.session_id.clone();
                let (mut changed, _) = upsert(&mut self.traces, trace);
                if let Some(session_id) = session_id {
                    changed |= self.ensure_session(&session_id, &mut created);
                }
                changed
            }
            ChangeEvent::Session(session) => upsert(&mut self.sessions, session).0,
        }
    }

    /// Forget everything (scope switch)
    pub fn clear(&mut self) {
        let seq = self.seq;
        *self = Self::default();
        self.seq = seq;
    }

    /// First realtime observation of an entity, if it was ever seen live
    pub fn arrival(&self, table: ChangeTable, id: &str) -> Option<DateTime<Utc>> {
        self.arrivals.get(&(table, id.to_string())).copied()
    }

    /// Arrival instants not older than `since`
    pub fn recent_arrivals(
        &self,
        since: DateTime<Utc>,
    ) -> impl Iterator<Item = (ChangeTable, &str, DateTime<Utc>)> {
        self.arrivals
            .iter()
            .filter(move |(_, at)| **at >= since)
            .map(|((table, id), at)| (*table, id.as_str(), *at))
    }

    pub fn session(&self, id: &str) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    pub fn trace(&self, id: &str) -> Option<&TraceRecord> {
        self.traces.get(id)
    }

    pub fn span(&self, id: &str) -> Option<&SpanRecord> {
        self.spans.get(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionRecord> {
        self.sessions.values()
    }

    pub fn traces(&self) -> impl Iterator<Item = &TraceRecord> {
        self.traces.values()
    }

    pub fn spans(&self) -> impl Iterator<Item = &SpanRecord> {
        self.spans.values()
    }
}
