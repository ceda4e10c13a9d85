//! Aggregate statistics over a query window

use serde::{Deserialize, Serialize};

/// Rollup returned by the backend `stats` query or computed locally
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub total_traces: u64,
    pub total_spans: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub p50_ms: Option<i64>,
    pub p95_ms: Option<i64>,
    pub p99_ms: Option<i64>,
    pub avg_ms: Option<f64>,
    pub total_cost: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl Stats {
    /// Nothing was recorded in the window
    pub fn is_empty(&self) -> bool {
        self.total_spans == 0 && self.total_traces == 0
    }

    pub fn total_tokens(&self) -> i64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}
