//! Read-only views of the session tree
//!
//! Views are rebuilt from the entity store after every applied batch and are
//! never mutated afterwards. Transient flags (liveness, new arrivals) are not
//! part of the views; see [`crate::domain::liveness`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::data::types::{SpanKind, SpanRecord, SpanStatus};
use crate::domain::stats::StatSample;
use crate::utils::time::add_millis;

/// Tool identities that mark a team being spawned
pub const TEAM_MARKER_TOOLS: &[&str] = &["team_create", "TeamCreate"];

// ============================================================================
// SPAN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub id: String,
    pub trace_id: String,
    pub session_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub kind: SpanKind,
    pub name: Option<String>,
    pub tool_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: SpanStatus,
    pub cost: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub attributes: BTreeMap<String, Value>,
}

impl Span {
    pub fn from_record(record: &SpanRecord, trace_id: &str) -> Self {
        Self {
            id: record.id.clone(),
            trace_id: trace_id.to_string(),
            session_id: record.session_id.clone(),
            parent_span_id: record.parent_span_id.clone(),
            kind: record.kind.unwrap_or_default(),
            name: record.name.clone(),
            tool_name: record.tool_name.clone(),
            start_time: record.start_time,
            duration_ms: record.duration_ms,
            status: record.status.unwrap_or_default(),
            cost: record.cost.unwrap_or(0.0),
            input_tokens: record.input_tokens.unwrap_or(0),
            output_tokens: record.output_tokens.unwrap_or(0),
            attributes: record.attributes.clone(),
        }
    }

    /// Still in flight
    pub fn is_open(&self) -> bool {
        self.duration_ms.is_none()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        Some(add_millis(self.start_time?, self.duration_ms?))
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.end_time().or(self.start_time)
    }

    pub fn is_team_marker(&self) -> bool {
        self.tool_name
            .as_deref()
            .is_some_and(|t| TEAM_MARKER_TOOLS.contains(&t))
    }

    pub fn stat_sample(&self) -> Option<StatSample<'_>> {
        Some(StatSample {
            trace_id: Some(&self.trace_id),
            start_time: self.start_time?,
            duration_ms: self.duration_ms,
            status: self.status,
            cost: self.cost,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }
}

/// Ordering of spans within a trace: start time, then id. Spans without a
/// start time sort last.
pub fn span_order(a: &Span, b: &Span) -> std::cmp::Ordering {
    a.start_time
        .is_none()
        .cmp(&b.start_time.is_none())
        .then(a.start_time.cmp(&b.start_time))
        .then_with(|| a.id.cmp(&b.id))
}

// ============================================================================
// TRACE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub id: String,
    pub session_id: Option<String>,
    pub name: Option<String>,
    /// Sorted by [`span_order`]
    pub spans: Vec<Span>,
    pub start_time: Option<DateTime<Utc>>,
    /// `max(end) - min(start)` over completed spans
    pub duration_ms: Option<i64>,
    pub has_errors: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Trace {
    /// Build a trace view; `spans` may arrive in any order
    pub fn new(
        id: &str,
        session_id: Option<String>,
        name: Option<String>,
        started_at: Option<DateTime<Utc>>,
        mut spans: Vec<Span>,
    ) -> Self {
        spans.sort_by(span_order);

        let completed = spans
            .iter()
            .filter_map(|s| Some((s.start_time?, s.end_time()?)));
        let (min_start, max_end) = completed.fold((None, None), |(lo, hi), (start, end)| {
            (
                Some(lo.map_or(start, |lo: DateTime<Utc>| lo.min(start))),
                Some(hi.map_or(end, |hi: DateTime<Utc>| hi.max(end))),
            )
        });
        let duration_ms = match (min_start, max_end) {
            (Some(lo), Some(hi)) => Some((hi - lo).num_milliseconds()),
            _ => None,
        };

        let start_time = spans.iter().filter_map(|s| s.start_time).min().or(started_at);
        let last_activity = spans
            .iter()
            .filter_map(Span::last_activity)
            .chain(started_at)
            .max();
        let has_errors = spans.iter().any(|s| s.status.is_error());

        Self {
            id: id.to_string(),
            session_id,
            name,
            spans,
            start_time,
            duration_ms,
            has_errors,
            last_activity,
        }
    }

    pub fn has_team_marker(&self) -> bool {
        self.spans.iter().any(Span::is_team_marker)
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Position of a session in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Root,
    Coordinator,
    Teammate,
}

impl SessionRole {
    pub fn from_depth(depth: usize) -> Self {
        match depth {
            0 => Self::Root,
            1 => Self::Coordinator,
            _ => Self::Teammate,
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Self::Root => 0,
            Self::Coordinator => 1,
            Self::Teammate => 2,
        }
    }
}

/// Placeholder nodes the builder adds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyntheticKind {
    /// Holds sessions whose parent is unknown or cannot be nested further
    OrphanGroup { parent_id: String },
    /// A team was created but no teammate has reported yet
    PendingTeam,
    /// Holds traces that name no session
    Unassigned,
}

/// Totals over a session and all its descendants
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SessionTotals {
    pub cost: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub error_count: u64,
    pub span_count: u64,
}

impl SessionTotals {
    pub fn add(&mut self, other: &SessionTotals) {
        self.cost += other.cost;
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.error_count += other.error_count;
        self.span_count += other.span_count;
    }

    pub fn from_traces(traces: &[Trace]) -> Self {
        let mut totals = Self::default();
        for span in traces.iter().flat_map(|t| &t.spans) {
            totals.cost += span.cost;
            totals.input_tokens = totals.input_tokens.saturating_add(span.input_tokens);
            totals.output_tokens = totals.output_tokens.saturating_add(span.output_tokens);
            totals.span_count += 1;
            if span.status.is_error() {
                totals.error_count += 1;
            }
        }
        totals
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub source: Option<String>,
    pub agent_name: Option<String>,
    pub model: Option<String>,
    pub parent_conversation_id: Option<String>,
    pub role: SessionRole,
    pub synthetic: Option<SyntheticKind>,
    pub started_at: Option<DateTime<Utc>>,
    pub traces: Vec<Trace>,
    pub children: Vec<Session>,
    /// Own plus descendants
    pub totals: SessionTotals,
    /// Own plus descendants
    pub last_activity: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_synthetic(&self) -> bool {
        self.synthetic.is_some()
    }

    /// This session and its descendants, depth-first (at most three levels)
    pub fn subtree(&self) -> impl Iterator<Item = &Session> {
        std::iter::once(self).chain(
            self.children
                .iter()
                .flat_map(|c| std::iter::once(c).chain(c.children.iter())),
        )
    }
}

// ============================================================================
// BOUNDED LOOKUPS
// ============================================================================

/// Every session of a forest, roots first within each subtree
pub fn walk_sessions(roots: &[Session]) -> impl Iterator<Item = &Session> {
    roots.iter().flat_map(|s| s.subtree())
}

pub fn find_session<'a>(roots: &'a [Session], id: &str) -> Option<&'a Session> {
    walk_sessions(roots).find(|s| s.id == id)
}

/// Trace plus the session that owns it
pub fn find_trace<'a>(roots: &'a [Session], id: &str) -> Option<(&'a Session, &'a Trace)> {
    walk_sessions(roots).find_map(|s| s.traces.iter().find(|t| t.id == id).map(|t| (s, t)))
}

pub fn find_span<'a>(roots: &'a [Session], id: &str) -> Option<&'a Span> {
    walk_sessions(roots)
        .flat_map(|s| &s.traces)
        .find_map(|t| t.spans.iter().find(|sp| sp.id == id))
}
