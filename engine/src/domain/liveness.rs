//! Live-state tracking
//!
//! Liveness is a pure function of the current time and the tree; nothing is
//! stored. Thresholds are strict: an entity whose last activity is exactly
//! `window` old is no longer live.

use chrono::{DateTime, Duration, Utc};

use super::model::{Session, Trace};
use crate::core::constants::{
    DEFAULT_ARRIVAL_GRACE_MS, DEFAULT_SESSION_LIVE_SECS, DEFAULT_TRACE_LIVE_SECS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// Session (or any descendant) active within this window
    pub session_window: Duration,
    /// Trace active within this window, inside a live session
    pub trace_window: Duration,
    /// How long an entity first seen on the realtime feed counts as new
    pub arrival_grace: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            session_window: Duration::seconds(DEFAULT_SESSION_LIVE_SECS as i64),
            trace_window: Duration::seconds(DEFAULT_TRACE_LIVE_SECS as i64),
            arrival_grace: Duration::milliseconds(DEFAULT_ARRIVAL_GRACE_MS as i64),
        }
    }
}

impl LivenessPolicy {
    fn within(last: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
        last.is_some_and(|t| now - t < window)
    }

    /// `session.last_activity` already covers all descendants
    pub fn is_session_live(&self, session: &Session, now: DateTime<Utc>) -> bool {
        Self::within(session.last_activity, self.session_window, now)
    }

    /// `session` must be the session owning `trace`
    pub fn is_trace_live(&self, session: &Session, trace: &Trace, now: DateTime<Utc>) -> bool {
        self.is_session_live(session, now)
            && Self::within(trace.last_activity, self.trace_window, now)
    }

    pub fn is_newly_arrived(&self, arrived_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        Self::within(arrived_at, self.arrival_grace, now)
    }
}
