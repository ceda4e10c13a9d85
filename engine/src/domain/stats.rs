//! Stats aggregation
//!
//! Percentiles use the nearest-rank method: sort ascending, take the sample
//! at `ceil(p/100 * n)` (1-based, clamped to `[1, n]`). Every percentile is
//! therefore an observed value, never an interpolation.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;

use crate::data::types::{SpanRecord, SpanStatus, Stats, TimeWindow};

/// The fields of a span the aggregator looks at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSample<'a> {
    pub trace_id: Option<&'a str>,
    pub start_time: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub status: SpanStatus,
    pub cost: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl<'a> StatSample<'a> {
    /// `None` when the record has no start time (cannot be windowed)
    pub fn from_record(record: &'a SpanRecord) -> Option<Self> {
        Some(Self {
            trace_id: record.trace_id.as_deref(),
            start_time: record.start_time?,
            duration_ms: record.duration_ms,
            status: record.status.unwrap_or_default(),
            cost: record.cost.unwrap_or(0.0),
            input_tokens: record.input_tokens.unwrap_or(0),
            output_tokens: record.output_tokens.unwrap_or(0),
        })
    }
}

/// Nearest-rank percentile over ascending `sorted` samples
pub fn percentile(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    let rank = rank.clamp(1, n);
    Some(sorted[rank - 1])
}

/// Arithmetic mean, summed wide so large durations cannot overflow
pub fn mean(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum: i128 = values.iter().map(|&v| i128::from(v)).sum();
    Some(sum as f64 / values.len() as f64)
}

/// Aggregate samples whose start time lies in `window`.
///
/// Only completed samples (with a duration) contribute to latency figures.
pub fn compute_stats<'a, I>(samples: I, window: &TimeWindow) -> Stats
where
    I: IntoIterator<Item = StatSample<'a>>,
{
    let mut stats = Stats::default();
    let mut traces: FxHashSet<&str> = FxHashSet::default();
    let mut latencies: Vec<i64> = Vec::new();

    for sample in samples {
        if !window.contains(sample.start_time) {
            continue;
        }
        stats.total_spans += 1;
        if let Some(trace_id) = sample.trace_id {
            traces.insert(trace_id);
        }
        match sample.status {
            SpanStatus::Error => stats.error_count += 1,
            SpanStatus::Timeout => stats.timeout_count += 1,
            SpanStatus::Ok => {}
        }
        stats.total_cost += sample.cost;
        stats.input_tokens = stats.input_tokens.saturating_add(sample.input_tokens);
        stats.output_tokens = stats.output_tokens.saturating_add(sample.output_tokens);
        if let Some(d) = sample.duration_ms {
            latencies.push(d);
        }
    }

    stats.total_traces = traces.len() as u64;
    latencies.sort_unstable();
    stats.p50_ms = percentile(&latencies, 50.0);
    stats.p95_ms = percentile(&latencies, 95.0);
    stats.p99_ms = percentile(&latencies, 99.0);
    stats.avg_ms = mean(&latencies);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::data::types::TimeRange;

    fn window() -> TimeWindow {
        TimeRange::LastHour.window(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap())
    }

    fn sample(trace: &str, min: u32, ms: Option<i64>, status: SpanStatus) -> StatSample<'_> {
        StatSample {
            trace_id: Some(trace),
            start_time: Utc.with_ymd_and_hms(2025, 3, 1, 11, min, 0).unwrap(),
            duration_ms: ms,
            status,
            cost: 0.5,
            input_tokens: 10,
            output_tokens: 5,
        }
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let samples = [10, 20, 30, 40];
        assert_eq!(percentile(&samples, 50.0), Some(20));
        assert_eq!(percentile(&samples, 95.0), Some(40));
        assert_eq!(percentile(&samples, 99.0), Some(40));
        assert_eq!(percentile(&samples, 25.0), Some(10));
        assert_eq!(percentile(&samples, 0.0), Some(10));
    }

    #[test]
    fn test_percentile_empty_and_single() {
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[7], 99.0), Some(7));
    }

    #[test]
    fn test_compute_stats_totals() {
        let samples = vec![
            sample("t1", 1, Some(10), SpanStatus::Ok),
            sample("t1", 2, Some(20), SpanStatus::Error),
            sample("t2", 3, Some(30), SpanStatus::Timeout),
            sample("t2", 4, Some(40), SpanStatus::Ok),
        ];
        let stats = compute_stats(samples, &window());

        assert_eq!(stats.total_spans, 4);
        assert_eq!(stats.total_traces, 2);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.p50_ms, Some(20));
        assert_eq!(stats.p95_ms, Some(40));
        assert_eq!(stats.p99_ms, Some(40));
        assert_eq!(stats.avg_ms, Some(25.0));
        assert_eq!(stats.total_cost, 2.0);
        assert_eq!(stats.input_tokens, 40);
        assert_eq!(stats.output_tokens, 20);
    }

    #[test]
    fn test_open_spans_count_but_have_no_latency() {
        let samples = vec![
            sample("t1", 1, None, SpanStatus::Ok),
            sample("t1", 2, Some(50), SpanStatus::Ok),
        ];
        let stats = compute_stats(samples, &window());
        assert_eq!(stats.total_spans, 2);
        assert_eq!(stats.p50_ms, Some(50));
        assert_eq!(stats.avg_ms, Some(50.0));
    }

    #[test]
    fn test_samples_outside_window_ignored() {
        let mut late = sample("t1", 0, Some(10), SpanStatus::Ok);
        late.start_time = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let stats = compute_stats(vec![late], &window());
        assert!(stats.is_empty());
        assert_eq!(stats.p50_ms, None);
        assert_eq!(stats.avg_ms, None);
    }

    #[test]
    fn test_extreme_durations_do_not_overflow() {
        let huge = i64::MAX / 2 + 10;
        let mut first = sample("t1", 1, Some(huge), SpanStatus::Ok);
        first.input_tokens = i64::MAX;
        let second = sample("t1", 2, Some(huge), SpanStatus::Ok);
        let stats = compute_stats(vec![first, second], &window());

        assert_eq!(stats.total_spans, 2);
        assert_eq!(stats.p99_ms, Some(huge));
        assert_eq!(stats.avg_ms, Some(huge as f64));
        assert_eq!(stats.input_tokens, i64::MAX);
    }

    #[test]
    fn test_from_record_requires_start_time() {
        let record = SpanRecord {
            id: "s1".into(),
            ..Default::default()
        };
        assert!(StatSample::from_record(&record).is_none());
    }
}
