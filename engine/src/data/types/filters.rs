//! Query filters and time windows

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// TIME RANGE
// ============================================================================

/// Relative or absolute range a query covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeRange {
    LastHour,
    #[default]
    Last24Hours,
    Last7Days,
    Custom {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

impl TimeRange {
    /// Resolve into a concrete half-open window ending at `now`
    pub fn window(&self, now: DateTime<Utc>) -> TimeWindow {
        match *self {
            Self::LastHour => TimeWindow::ending_at(now, Duration::hours(1)),
            Self::Last24Hours => TimeWindow::ending_at(now, Duration::hours(24)),
            Self::Last7Days => TimeWindow::ending_at(now, Duration::days(7)),
            Self::Custom { from, to } => TimeWindow { from, to },
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastHour => f.write_str("1h"),
            Self::Last24Hours => f.write_str("24h"),
            Self::Last7Days => f.write_str("7d"),
            Self::Custom { from, to } => write!(f, "{}..{}", from.to_rfc3339(), to.to_rfc3339()),
        }
    }
}

impl FromStr for TimeRange {
    type Err = String;

    /// Accepts `1h`, `24h`, `7d` or `<rfc3339>..<rfc3339>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1h" | "hour" => return Ok(Self::LastHour),
            "24h" | "1d" | "day" => return Ok(Self::Last24Hours),
            "7d" | "week" => return Ok(Self::Last7Days),
            _ => {}
        }

        let (from, to) = s
            .trim()
            .split_once("..")
            .ok_or_else(|| format!("Invalid time range '{}': expected 1h, 24h, 7d or FROM..TO", s))?;
        let parse = |v: &str| {
            DateTime::parse_from_rfc3339(v.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| format!("Invalid timestamp '{}': {}", v, e))
        };
        let (from, to) = (parse(from)?, parse(to)?);
        if from >= to {
            return Err(format!("Invalid time range '{}': start must precede end", s));
        }
        Ok(Self::Custom { from, to })
    }
}

impl TryFrom<String> for TimeRange {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeRange> for String {
    fn from(value: TimeRange) -> Self {
        value.to_string()
    }
}

/// Concrete half-open window `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn ending_at(to: DateTime<Utc>, span: Duration) -> Self {
        Self { from: to - span, to }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.from <= t && t < self.to
    }
}

// ============================================================================
// FILTERS
// ============================================================================

/// Filter set shared by stats and session queries
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub only_errors: bool,
}

impl QueryFilters {
    /// Blank strings mean "no filter"
    pub fn normalize(value: Option<String>) -> Option<String> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn matches_source(&self, source: Option<&str>) -> bool {
        match &self.source {
            None => true,
            Some(wanted) => source.is_some_and(|s| s.eq_ignore_ascii_case(wanted)),
        }
    }

    pub fn matches_agent(&self, agent: Option<&str>) -> bool {
        match &self.agent {
            None => true,
            Some(wanted) => agent.is_some_and(|a| a.eq_ignore_ascii_case(wanted)),
        }
    }

    /// Query-string pairs for a backend request over `window`
    pub fn query_pairs(&self, window: &TimeWindow) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("from", crate::utils::time::to_query_timestamp(window.from)),
            ("to", crate::utils::time::to_query_timestamp(window.to)),
        ];
        if let Some(source) = &self.source {
            pairs.push(("source", source.clone()));
        }
        if let Some(agent) = &self.agent {
            pairs.push(("agent", agent.clone()));
        }
        if self.only_errors {
            pairs.push(("only_errors", "true".to_string()));
        }
        pairs
    }
}
