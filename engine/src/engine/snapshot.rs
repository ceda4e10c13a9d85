//! Immutable view published by the engine after every state change

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::data::error::DataError;
use crate::data::types::{ChangeTable, QueryFilters, Stats, TimeWindow};
use crate::domain::liveness::LivenessPolicy;
use crate::domain::model::{Session, Span, Trace, find_session, find_span, find_trace, walk_sessions};
use crate::domain::stats::compute_stats;

/// Progress of one kind of query
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LoadState {
    /// No scope configured
    #[default]
    Idle,
    Loading,
    Loaded,
    /// Loaded, but the window holds nothing
    Empty,
    /// Last attempt failed; previously loaded data is still shown
    Failed(DataError),
}

impl LoadState {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn error(&self) -> Option<&DataError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Empty => "empty",
            Self::Failed(_) => "failed",
        }
    }
}

impl Serialize for LoadState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Failed(e) => serializer.serialize_str(&format!("failed: {e}")),
            other => serializer.serialize_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub scope: Option<String>,
    /// Bumped on every configure/teardown
    pub epoch: u64,
    /// Generation of the most recently issued query
    pub generation: u64,
    /// Bumped on every publish
    pub version: u64,
    pub filters: QueryFilters,
    /// Window of the most recently issued query
    pub window: Option<TimeWindow>,
    pub sessions: Vec<Session>,
    pub sessions_state: LoadState,
    /// Last successfully fetched stats
    pub stats: Option<Stats>,
    pub stats_state: LoadState,
    pub realtime_connected: bool,
    pub built_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) liveness: LivenessPolicy,
    #[serde(skip)]
    pub(crate) arrivals: FxHashMap<(ChangeTable, String), DateTime<Utc>>,
}

impl EngineSnapshot {
    pub fn idle(filters: QueryFilters, liveness: LivenessPolicy) -> Self {
        Self {
            scope: None,
            epoch: 0,
            generation: 0,
            version: 0,
            filters,
            window: None,
            sessions: Vec::new(),
            sessions_state: LoadState::Idle,
            stats: None,
            stats_state: LoadState::Idle,
            realtime_connected: false,
            built_at: Utc::now(),
            liveness,
            arrivals: FxHashMap::default(),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.sessions_state.is_loading() || self.stats_state.is_loading()
    }

    pub fn find_session(&self, id: &str) -> Option<&Session> {
        find_session(&self.sessions, id)
    }

    pub fn find_trace(&self, id: &str) -> Option<(&Session, &Trace)> {
        find_trace(&self.sessions, id)
    }

    pub fn find_span(&self, id: &str) -> Option<&Span> {
        find_span(&self.sessions, id)
    }

    pub fn is_session_live(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.find_session(id)
            .is_some_and(|s| self.liveness.is_session_live(s, now))
    }

    pub fn is_trace_live(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.find_trace(id)
            .is_some_and(|(s, t)| self.liveness.is_trace_live(s, t, now))
    }

    /// First seen on the realtime feed within the grace period
    pub fn is_newly_arrived(&self, table: ChangeTable, id: &str, now: DateTime<Utc>) -> bool {
        let arrived = self.arrivals.get(&(table, id.to_string())).copied();
        self.liveness.is_newly_arrived(arrived, now)
    }

    /// Ids of every live session in the tree, parents before children
    pub fn live_session_ids(&self, now: DateTime<Utc>) -> Vec<&str> {
        walk_sessions(&self.sessions)
            .filter(|s| self.liveness.is_session_live(s, now))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Stats computed from the spans in the working set
    pub fn local_stats(&self, window: &TimeWindow) -> Stats {
        let samples = walk_sessions(&self.sessions)
            .flat_map(|s| &s.traces)
            .flat_map(|t| &t.spans)
            .filter_map(Span::stat_sample);
        compute_stats(samples, window)
    }

    /// Backend stats when available, else the local rollup
    pub fn effective_stats(&self) -> Option<Stats> {
        if let Some(stats) = &self.stats
            && self.stats_state.error().is_none()
        {
            return Some(stats.clone());
        }
        let window = self.window?;
        Some(self.local_stats(&window))
    }
}
