//! Session tree builder
//!
//! Folds the entity store into root → coordinator → teammate sessions. The
//! tree is rebuilt from scratch on every call, so late parents re-attach
//! their children without duplicates and no delivery order is assumed.
//!
//! Placement:
//! - depth 0: sessions without a parent reference (or referencing themselves)
//! - depth 1: sessions whose parent sits at depth 0
//! - depth 2: sessions whose parent sits at depth 1
//! - unknown parent, cycle or parent at depth 2: depth 1 inside a synthetic
//!   root-level group keyed by the referenced parent id. Their own children
//!   still nest under them at depth 2.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

use super::merge::TelemetryStore;
use super::model::{Session, SessionRole, SessionTotals, Span, SyntheticKind, Trace};
use crate::data::types::{QueryFilters, SessionRecord};

/// Id prefix of orphan groups
pub const ORPHAN_GROUP_PREFIX: &str = "orphans:";

/// Id of the group holding traces without a session
pub const UNASSIGNED_SESSION_ID: &str = "unassigned";

/// Id suffix of pending-team placeholders
pub const PENDING_TEAM_SUFFIX: &str = "#team";

/// Where a session sits in the forest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Root,
    /// Nested under its parent at the given depth
    Child(usize),
    /// Depth-1 member of the orphan group keyed by its parent id
    Orphan,
}

impl Placement {
    fn depth(self) -> usize {
        match self {
            Placement::Root => 0,
            Placement::Child(depth) => depth,
            Placement::Orphan => 1,
        }
    }
}

/// Build the filtered, ordered session forest
pub fn build_sessions(store: &TelemetryStore, filters: &QueryFilters) -> Vec<Session> {
    let (mut traces, unassigned) = group_traces(store);

    let records: Vec<&SessionRecord> = store.sessions().collect();
    let placements = place_sessions(&records);

    let mut children_of: FxHashMap<&str, Vec<&SessionRecord>> = FxHashMap::default();
    let mut orphans_of: FxHashMap<&str, Vec<&SessionRecord>> = FxHashMap::default();
    for &record in &records {
        let Some(parent) = parent_of(record) else {
            continue;
        };
        match placements.get(record.id.as_str()) {
            Some(Placement::Child(_)) => children_of.entry(parent).or_default().push(record),
            Some(Placement::Orphan) => orphans_of.entry(parent).or_default().push(record),
            _ => {}
        }
    }

    let mut roots: Vec<Session> = records
        .iter()
        .filter(|s| placements.get(s.id.as_str()) == Some(&Placement::Root))
        .map(|root| build_node(root, 0, &children_of, &mut traces))
        .collect();

    for (parent_id, members) in orphans_of {
        let mut children: Vec<Session> = members
            .into_iter()
            .map(|member| build_node(member, 1, &children_of, &mut traces))
            .collect();
        sort_children(&mut children);
        roots.push(synthetic_root(
            format!("{}{}", ORPHAN_GROUP_PREFIX, parent_id),
            SyntheticKind::OrphanGroup {
                parent_id: parent_id.to_string(),
            },
            Vec::new(),
            children,
        ));
    }

    if !unassigned.is_empty() {
        roots.push(synthetic_root(
            UNASSIGNED_SESSION_ID.to_string(),
            SyntheticKind::Unassigned,
            unassigned,
            Vec::new(),
        ));
    }

    roots.retain(|root| root_matches(root, filters));
    roots.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.id.cmp(&b.id))
    });
    roots
}

fn parent_of(record: &SessionRecord) -> Option<&str> {
    record
        .parent_conversation_id
        .as_deref()
        .filter(|p| *p != record.id)
}

/// Resolve every session's placement by walking up its parent chain.
///
/// A session nests under its parent while the parent sits above depth 2.
/// It is orphaned when the parent is missing from the store, sits at depth 2,
/// or the chain loops back on itself.
fn place_sessions<'a>(records: &[&'a SessionRecord]) -> FxHashMap<&'a str, Placement> {
    let by_id: FxHashMap<&'a str, &'a SessionRecord> =
        records.iter().map(|&s| (s.id.as_str(), s)).collect();
    let mut placed: FxHashMap<&'a str, Placement> = FxHashMap::default();

    for &record in records {
        let mut path: Vec<&'a SessionRecord> = Vec::new();
        let mut current: &'a SessionRecord = record;
        loop {
            let id = current.id.as_str();
            if placed.contains_key(id) {
                break;
            }
            if let Some(start) = path.iter().position(|s| s.id == current.id) {
                for member in path.drain(start..) {
                    placed.insert(member.id.as_str(), Placement::Orphan);
                }
                break;
            }
            match parent_of(current).map(|p| by_id.get(p)) {
                None => {
                    placed.insert(id, Placement::Root);
                    break;
                }
                Some(None) => {
                    placed.insert(id, Placement::Orphan);
                    break;
                }
                Some(Some(&parent)) => {
                    path.push(current);
                    current = parent;
                }
            }
        }

        for member in path.into_iter().rev() {
            let parent_depth = parent_of(member)
                .and_then(|p| placed.get(p))
                .map_or(0, |p| p.depth());
            let placement = if parent_depth < 2 {
                Placement::Child(parent_depth + 1)
            } else {
                Placement::Orphan
            };
            placed.insert(member.id.as_str(), placement);
        }
    }
    placed
}

fn build_node(
    record: &SessionRecord,
    depth: usize,
    children_of: &FxHashMap<&str, Vec<&SessionRecord>>,
    traces: &mut FxHashMap<String, Vec<Trace>>,
) -> Session {
    let mut children = Vec::new();
    if depth < 2
        && let Some(kids) = children_of.get(record.id.as_str())
    {
        for kid in kids {
            children.push(build_node(kid, depth + 1, children_of, traces));
        }
    }
    session_node(record, depth, traces, children)
}

/// Group traces by owning session; traces naming no session are returned apart
fn group_traces(store: &TelemetryStore) -> (FxHashMap<String, Vec<Trace>>, Vec<Trace>) {
    let mut spans_by_trace: FxHashMap<&str, Vec<Span>> = FxHashMap::default();
    for record in store.spans() {
        if let Some(trace_id) = record.trace_id.as_deref() {
            spans_by_trace
                .entry(trace_id)
                .or_default()
                .push(Span::from_record(record, trace_id));
        }
    }

    let mut by_session: FxHashMap<String, Vec<Trace>> = FxHashMap::default();
    let mut unassigned = Vec::new();
    for record in store.traces() {
        let spans = spans_by_trace.remove(record.id.as_str()).unwrap_or_default();
        let mut trace = Trace::new(
            &record.id,
            None,
            record.name.clone(),
            record.started_at,
            spans,
        );
        trace.session_id = record
            .session_id
            .clone()
            .or_else(|| trace.spans.iter().find_map(|s| s.session_id.clone()));

        match trace.session_id.clone() {
            Some(id) if store.session(&id).is_some() => {
                by_session.entry(id).or_default().push(trace)
            }
            _ => unassigned.push(trace),
        }
    }

    for traces in by_session.values_mut() {
        sort_traces(traces);
    }
    sort_traces(&mut unassigned);
    (by_session, unassigned)
}

fn sort_traces(traces: &mut [Trace]) {
    traces.sort_by(|a, b| {
        a.start_time
            .is_none()
            .cmp(&b.start_time.is_none())
            .then(a.start_time.cmp(&b.start_time))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn session_node(
    record: &SessionRecord,
    depth: usize,
    traces: &mut FxHashMap<String, Vec<Trace>>,
    mut children: Vec<Session>,
) -> Session {
    let own_traces = traces.remove(&record.id).unwrap_or_default();

    if depth < 2 && children.is_empty() && own_traces.iter().any(Trace::has_team_marker) {
        children.push(pending_team(record, depth + 1));
    }
    sort_children(&mut children);

    let started_at = record
        .started_at
        .or_else(|| own_traces.iter().filter_map(|t| t.start_time).min());

    finish(
        Session {
            id: record.id.clone(),
            source: record.source.clone(),
            agent_name: record.agent_name.clone(),
            model: record.model.clone(),
            parent_conversation_id: record.parent_conversation_id.clone(),
            role: SessionRole::from_depth(depth),
            synthetic: None,
            started_at,
            traces: own_traces,
            children,
            totals: SessionTotals::default(),
            last_activity: None,
        },
        record.updated_at,
    )
}

fn sort_children(children: &mut [Session]) {
    children.sort_by(|a, b| {
        a.started_at
            .is_none()
            .cmp(&b.started_at.is_none())
            .then(a.started_at.cmp(&b.started_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn pending_team(parent: &SessionRecord, depth: usize) -> Session {
    Session {
        id: format!("{}{}", parent.id, PENDING_TEAM_SUFFIX),
        source: None,
        agent_name: None,
        model: None,
        parent_conversation_id: Some(parent.id.clone()),
        role: SessionRole::from_depth(depth),
        synthetic: Some(SyntheticKind::PendingTeam),
        started_at: None,
        traces: Vec::new(),
        children: Vec::new(),
        totals: SessionTotals::default(),
        last_activity: None,
    }
}

fn synthetic_root(
    id: String,
    kind: SyntheticKind,
    traces: Vec<Trace>,
    children: Vec<Session>,
) -> Session {
    let started_at = traces
        .iter()
        .filter_map(|t| t.start_time)
        .chain(children.iter().filter_map(|c| c.started_at))
        .min();
    finish(
        Session {
            id,
            source: None,
            agent_name: None,
            model: None,
            parent_conversation_id: None,
            role: SessionRole::Root,
            synthetic: Some(kind),
            started_at,
            traces,
            children,
            totals: SessionTotals::default(),
            last_activity: None,
        },
        None,
    )
}

/// Roll totals and last activity up from traces and children
fn finish(mut session: Session, updated_at: Option<DateTime<Utc>>) -> Session {
    let mut totals = SessionTotals::from_traces(&session.traces);
    let mut last_activity = session
        .traces
        .iter()
        .filter_map(|t| t.last_activity)
        .chain(session.started_at)
        .chain(updated_at)
        .max();
    for child in &session.children {
        totals.add(&child.totals);
        last_activity = last_activity.max(child.last_activity);
    }
    session.totals = totals;
    session.last_activity = last_activity;
    session
}

fn root_matches(root: &Session, filters: &QueryFilters) -> bool {
    let source_ok = if filters.source.is_none() {
        true
    } else if root.is_synthetic() {
        root.subtree()
            .any(|s| !s.is_synthetic() && filters.matches_source(s.source.as_deref()))
    } else {
        filters.matches_source(root.source.as_deref())
    };
    let agent_ok = filters.agent.is_none()
        || root
            .subtree()
            .any(|s| filters.matches_agent(s.agent_name.as_deref()));
    let errors_ok = !filters.only_errors || root.totals.error_count > 0;

    source_ok && agent_ok && errors_ok
}

#[cfg(test)]
#[path = "builder_tests.rs"]
mod tests;
