//! Classification enums for telemetry records
//!
//! These enums are shared by the backends, the entity store and the views
//! handed out to consumers.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// SPAN CLASSIFICATION
// ============================================================================

/// Completion status of a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    #[default]
    Ok,
    Error,
    Timeout,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of work a span represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// Tool call made by an agent
    #[serde(alias = "tool_call")]
    Tool,
    /// Model / API request
    #[serde(alias = "llm", alias = "api", alias = "generation")]
    Model,
    /// Anything else the agent runtime records
    #[default]
    #[serde(alias = "span")]
    Internal,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Model => "model",
            Self::Internal => "internal",
        }
    }
}

// ============================================================================
// CHANGE FEED
// ============================================================================

/// Table a realtime change belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeTable {
    Span,
    Trace,
    Session,
}

impl ChangeTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Span => "span",
            Self::Trace => "trace",
            Self::Session => "session",
        }
    }

    /// Parse an SSE event name or table name (singular or plural)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "span" | "spans" => Some(Self::Span),
            "trace" | "traces" => Some(Self::Trace),
            "session" | "sessions" => Some(Self::Session),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
