//! Unified error type for the data layer
//!
//! Every backend (HTTP, in-memory) reports failures through [`DataError`].
//! The type is `Clone` so request-level failures can be kept inside the
//! published engine state next to the last-known-good data.

use thiserror::Error;

use super::types::ChangeTable;

/// Unified error type for backend and engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    /// Transport-level failure (connection refused, reset, DNS...)
    #[error("Network error: {0}")]
    Network(String),

    /// Backend answered with a non-success status
    #[error("Backend returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Request exceeded its time budget
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: &'static str,
        timeout_secs: u64,
    },

    /// A single record could not be decoded
    #[error("Malformed {table} record: {reason}")]
    Decode { table: ChangeTable, reason: String },

    /// A whole response body could not be decoded
    #[error("Malformed response: {0}")]
    InvalidResponse(String),

    /// Realtime change feed dropped
    #[error("Realtime feed disconnected: {0}")]
    RealtimeDisconnect(String),

    /// Operation needs a configured scope
    #[error("No store scope configured")]
    NotConfigured,

    /// The engine actor is gone (shutdown or panic)
    #[error("Engine is closed")]
    EngineClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DataError {
    /// Create a timeout error
    pub fn timeout(operation: &'static str, timeout_secs: u64) -> Self {
        Self::Timeout {
            operation,
            timeout_secs,
        }
    }

    /// Create a per-record decode error
    pub fn decode(table: ChangeTable, reason: impl Into<String>) -> Self {
        Self::Decode {
            table,
            reason: reason.into(),
        }
    }

    /// Check if retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } | Self::RealtimeDisconnect(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DataError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout {
                operation: "request",
                timeout_secs: 0,
            };
        }
        if e.is_decode() {
            return Self::InvalidResponse(e.to_string());
        }
        if let Some(status) = e.status() {
            return Self::Status {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        Self::Network(e.to_string())
    }
}
