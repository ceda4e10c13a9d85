//! Span comparison against the historical population of its tool

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::model::Span;
use super::stats::{mean, percentile};
use crate::core::constants::{DEFAULT_COMPARISON_WINDOW_HOURS, DEFAULT_SLOW_PERCENTILE};
use crate::data::types::{HistorySample, SpanStatus};

/// Knobs for comparisons
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparisonPolicy {
    /// How far back the population reaches
    pub window: Duration,
    /// Rank at or above which a span is flagged slow
    pub slow_percentile: f64,
}

impl Default for ComparisonPolicy {
    fn default() -> Self {
        Self {
            window: Duration::hours(DEFAULT_COMPARISON_WINDOW_HOURS as i64),
            slow_percentile: DEFAULT_SLOW_PERCENTILE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanComparison {
    pub span_id: String,
    pub tool_name: String,
    pub duration_ms: i64,
    /// Percentage of completed samples with duration <= this span's
    pub percentile_rank: f64,
    pub sample_count: usize,
    pub avg_ms: f64,
    pub p95_ms: i64,
    /// Share of all samples (completed or not) with status `error`
    pub error_rate: f64,
    /// Samples started in the last 24 hours
    pub volume_24h: u64,
    pub slow: bool,
}

/// Why no comparison could be made
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    UnknownSpan,
    NoToolIdentity,
    StillOpen,
    EmptyPopulation,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::UnknownSpan => "span is not in the current working set",
            Self::NoToolIdentity => "span has no tool identity",
            Self::StillOpen => "span is still in flight",
            Self::EmptyPopulation => "no completed historical samples for this tool",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ComparisonOutcome {
    Available(SpanComparison),
    Unavailable { reason: UnavailableReason },
}

impl ComparisonOutcome {
    pub fn unavailable(reason: UnavailableReason) -> Self {
        Self::Unavailable { reason }
    }
}

/// Tool identity of a span that can be compared, or the reason it cannot
pub fn comparable_tool(span: Option<&Span>) -> Result<(&Span, &str, i64), UnavailableReason> {
    let span = span.ok_or(UnavailableReason::UnknownSpan)?;
    let tool = span
        .tool_name
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(UnavailableReason::NoToolIdentity)?;
    let duration = span.duration_ms.ok_or(UnavailableReason::StillOpen)?;
    Ok((span, tool, duration))
}

/// Rank `span` within `population`
pub fn compare_span(
    span: Option<&Span>,
    population: &[HistorySample],
    policy: &ComparisonPolicy,
    now: DateTime<Utc>,
) -> ComparisonOutcome {
    let (span, tool, duration) = match comparable_tool(span) {
        Ok(found) => found,
        Err(reason) => return ComparisonOutcome::unavailable(reason),
    };

    let mut durations: Vec<i64> = population.iter().filter_map(|s| s.duration_ms).collect();
    if durations.is_empty() {
        return ComparisonOutcome::unavailable(UnavailableReason::EmptyPopulation);
    }
    durations.sort_unstable();

    let n = durations.len();
    let at_or_below = durations.partition_point(|d| *d <= duration);
    let percentile_rank = at_or_below as f64 * 100.0 / n as f64;
    let avg_ms = mean(&durations).unwrap_or(duration as f64);
    let p95_ms = percentile(&durations, 95.0).unwrap_or(duration);

    let errors = population
        .iter()
        .filter(|s| s.status == SpanStatus::Error)
        .count();
    let error_rate = errors as f64 / population.len() as f64;
    let day_ago = now - Duration::hours(24);
    let volume_24h = population.iter().filter(|s| s.start_time >= day_ago).count() as u64;

    ComparisonOutcome::Available(SpanComparison {
        span_id: span.id.clone(),
        tool_name: tool.to_string(),
        duration_ms: duration,
        percentile_rank,
        sample_count: n,
        avg_ms,
        p95_ms,
        error_rate,
        volume_24h,
        slow: percentile_rank >= policy.slow_percentile,
    })
}
