//! Raw telemetry records as delivered by a backend
//!
//! Records are partial: every field except the id may be missing, because
//! realtime upserts only carry what changed. The domain layer merges them
//! field by field into the entity store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::enums::{ChangeTable, SpanKind, SpanStatus};

/// A record type that can arrive on its own in a batch or on the change feed
pub trait Record: Sized {
    const TABLE: ChangeTable;

    fn id(&self) -> &str;

    /// Check invariants serde cannot express. Returns the reason on failure.
    fn validate(&self) -> Result<(), String>;

    /// Field-wise upsert: present fields overwrite, absent fields never erase.
    /// Returns whether anything changed.
    fn merge_from(&mut self, other: Self) -> bool;
}

fn merge_field<T: PartialEq>(dst: &mut Option<T>, src: Option<T>) -> bool {
    match src {
        Some(v) if dst.as_ref() != Some(&v) => {
            *dst = Some(v);
            true
        }
        _ => false,
    }
}

fn require_id(id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err("empty id".to_string());
    }
    Ok(())
}

// ============================================================================
// SPAN
// ============================================================================

/// One unit of work inside a trace
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpanRecord {
    #[serde(alias = "span_id")]
    pub id: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, alias = "parent_id")]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub kind: Option<SpanKind>,
    #[serde(default)]
    pub name: Option<String>,
    /// Comparison grouping key
    #[serde(default, alias = "tool")]
    pub tool_name: Option<String>,
    #[serde(default, alias = "started_at")]
    pub start_time: Option<DateTime<Utc>>,
    /// `None` while the span is still in flight
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub status: Option<SpanStatus>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Record for SpanRecord {
    const TABLE: ChangeTable = ChangeTable::Span;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        require_id(&self.id)?;
        if let Some(d) = self.duration_ms
            && d < 0
        {
            return Err(format!("negative duration {}ms", d));
        }
        for (field, value) in [
            ("input_tokens", self.input_tokens),
            ("output_tokens", self.output_tokens),
        ] {
            if let Some(v) = value
                && v < 0
            {
                return Err(format!("negative {} {}", field, v));
            }
        }
        if let Some(c) = self.cost
            && !c.is_finite()
        {
            return Err("non-finite cost".to_string());
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Self) -> bool {
        let mut changed = false;
        changed |= merge_field(&mut self.trace_id, other.trace_id);
        changed |= merge_field(&mut self.session_id, other.session_id);
        changed |= merge_field(&mut self.parent_span_id, other.parent_span_id);
        changed |= merge_field(&mut self.kind, other.kind);
        changed |= merge_field(&mut self.name, other.name);
        changed |= merge_field(&mut self.tool_name, other.tool_name);
        changed |= merge_field(&mut self.start_time, other.start_time);
        changed |= merge_field(&mut self.duration_ms, other.duration_ms);
        changed |= merge_field(&mut self.status, other.status);
        changed |= merge_field(&mut self.cost, other.cost);
        changed |= merge_field(&mut self.input_tokens, other.input_tokens);
        changed |= merge_field(&mut self.output_tokens, other.output_tokens);
        for (key, value) in other.attributes {
            if self.attributes.get(&key) != Some(&value) {
                self.attributes.insert(key, value);
                changed = true;
            }
        }
        changed
    }
}

// ============================================================================
// TRACE
// ============================================================================

/// One conversational turn
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraceRecord {
    #[serde(alias = "trace_id")]
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "start_time")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Record for TraceRecord {
    const TABLE: ChangeTable = ChangeTable::Trace;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        require_id(&self.id)
    }

    fn merge_from(&mut self, other: Self) -> bool {
        let mut changed = false;
        changed |= merge_field(&mut self.session_id, other.session_id);
        changed |= merge_field(&mut self.name, other.name);
        changed |= merge_field(&mut self.started_at, other.started_at);
        changed
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// One agent run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(alias = "session_id")]
    pub id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "agent")]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "parent_session_id")]
    pub parent_conversation_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record for SessionRecord {
    const TABLE: ChangeTable = ChangeTable::Session;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        require_id(&self.id)?;
        if self.parent_conversation_id.as_deref() == Some("") {
            return Err("empty parent_conversation_id".to_string());
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Self) -> bool {
        let mut changed = false;
        changed |= merge_field(&mut self.source, other.source);
        changed |= merge_field(&mut self.agent_name, other.agent_name);
        changed |= merge_field(&mut self.model, other.model);
        changed |= merge_field(
            &mut self.parent_conversation_id,
            other.parent_conversation_id,
        );
        changed |= merge_field(&mut self.started_at, other.started_at);
        changed |= merge_field(&mut self.updated_at, other.updated_at);
        changed
    }
}

// ============================================================================
// BATCHES AND EVENTS
// ============================================================================

/// A single upsert from the realtime feed
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Span(SpanRecord),
    Trace(TraceRecord),
    Session(SessionRecord),
}

impl ChangeEvent {
    pub fn table(&self) -> ChangeTable {
        match self {
            Self::Span(_) => ChangeTable::Span,
            Self::Trace(_) => ChangeTable::Trace,
            Self::Session(_) => ChangeTable::Session,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Span(r) => &r.id,
            Self::Trace(r) => &r.id,
            Self::Session(r) => &r.id,
        }
    }
}

/// Historical snapshot for one scope and filter set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub sessions: Vec<SessionRecord>,
    pub traces: Vec<TraceRecord>,
    pub spans: Vec<SpanRecord>,
}

impl SessionSnapshot {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.traces.is_empty() && self.spans.is_empty()
    }

    /// Flatten into change events, parents first
    pub fn into_events(self) -> impl Iterator<Item = ChangeEvent> {
        self.sessions
            .into_iter()
            .map(ChangeEvent::Session)
            .chain(self.traces.into_iter().map(ChangeEvent::Trace))
            .chain(self.spans.into_iter().map(ChangeEvent::Span))
    }
}

/// One historical span of a tool, used as a comparison sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub status: SpanStatus,
    pub start_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_span_record_partial_fields() {
        let span: SpanRecord = serde_json::from_value(json!({
            "id": "s1",
            "trace_id": "t1",
            "duration_ms": 120,
        }))
        .unwrap();
        assert_eq!(span.id, "s1");
        assert_eq!(span.trace_id.as_deref(), Some("t1"));
        assert_eq!(span.duration_ms, Some(120));
        assert!(span.status.is_none());
        assert!(span.attributes.is_empty());
        assert!(span.validate().is_ok());
    }

    #[test]
    fn test_span_record_aliases() {
        let span: SpanRecord = serde_json::from_value(json!({
            "span_id": "s1",
            "parent_id": "s0",
            "tool": "inventory_lookup",
            "started_at": "2025-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(span.parent_span_id.as_deref(), Some("s0"));
        assert_eq!(span.tool_name.as_deref(), Some("inventory_lookup"));
        assert!(span.start_time.is_some());
    }

    #[test]
    fn test_span_validate_rejects_negative_duration() {
        let span = SpanRecord {
            id: "s1".into(),
            duration_ms: Some(-5),
            ..Default::default()
        };
        let err = span.validate().unwrap_err();
        assert!(err.contains("negative duration"));
    }

    #[test]
    fn test_span_validate_rejects_negative_tokens() {
        let span = SpanRecord {
            id: "s1".into(),
            output_tokens: Some(-1),
            ..Default::default()
        };
        assert!(span.validate().unwrap_err().contains("output_tokens"));
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let trace = TraceRecord {
            id: "  ".into(),
            ..Default::default()
        };
        assert!(trace.validate().is_err());
    }

    #[test]
    fn test_session_record_aliases() {
        let session: SessionRecord = serde_json::from_value(json!({
            "session_id": "c1",
            "agent": "restock-bot",
            "parent_session_id": "root",
        }))
        .unwrap();
        assert_eq!(session.id, "c1");
        assert_eq!(session.agent_name.as_deref(), Some("restock-bot"));
        assert_eq!(session.parent_conversation_id.as_deref(), Some("root"));
    }

    #[test]
    fn test_merge_never_erases_present_fields() {
        let mut span = SpanRecord {
            id: "s1".into(),
            name: Some("lookup".into()),
            duration_ms: None,
            ..Default::default()
        };
        let changed = span.merge_from(SpanRecord {
            id: "s1".into(),
            duration_ms: Some(40),
            ..Default::default()
        });
        assert!(changed);
        assert_eq!(span.name.as_deref(), Some("lookup"));
        assert_eq!(span.duration_ms, Some(40));
    }

    #[test]
    fn test_merge_attributes_per_key() {
        let mut span = SpanRecord {
            id: "s1".into(),
            attributes: BTreeMap::from([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]),
            ..Default::default()
        };
        span.merge_from(SpanRecord {
            id: "s1".into(),
            attributes: BTreeMap::from([("b".to_string(), json!(3))]),
            ..Default::default()
        });
        assert_eq!(span.attributes["a"], json!(1));
        assert_eq!(span.attributes["b"], json!(3));
    }

    #[test]
    fn test_merge_same_record_twice_is_noop() {
        let update = SessionRecord {
            id: "c1".into(),
            source: Some("pos".into()),
            ..Default::default()
        };
        let mut session = SessionRecord {
            id: "c1".into(),
            ..Default::default()
        };
        assert!(session.merge_from(update.clone()));
        let before = session.clone();
        assert!(!session.merge_from(update));
        assert_eq!(session, before);
    }

    #[test]
    fn test_snapshot_events_parents_first() {
        let snapshot = SessionSnapshot {
            sessions: vec![SessionRecord {
                id: "a".into(),
                ..Default::default()
            }],
            traces: vec![TraceRecord {
                id: "t".into(),
                ..Default::default()
            }],
            spans: vec![SpanRecord {
                id: "s".into(),
                ..Default::default()
            }],
        };
        let tables: Vec<_> = snapshot.into_events().map(|e| e.table()).collect();
        assert_eq!(
            tables,
            vec![ChangeTable::Session, ChangeTable::Trace, ChangeTable::Span]
        );
    }
}
