//! HTTP backend
//!
//! Talks to the telemetry service over plain JSON endpoints plus a
//! Server-Sent Events change feed:
//! - `GET /stats`, `GET /sessions`: filtered historical queries
//! - `GET /spans/history`: comparison population for one tool
//! - `GET /realtime`: SSE events named `span` / `trace` / `session`

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{RequestBuilder, Response, Url, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::decode::{decode_batch, decode_change};
use super::error::DataError;
use super::traits::{ChangeSubscription, TelemetryBackend};
use super::types::{
    HistorySample, QueryFilters, SessionRecord, SessionSnapshot, SpanRecord, Stats, TimeWindow,
    TraceRecord,
};
use crate::core::constants::HTTP_CONNECT_TIMEOUT_SECS;
use crate::utils::time::to_query_timestamp;

/// Wire shape of `GET /sessions`; records are decoded one by one afterwards
#[derive(Debug, Default, Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    sessions: Vec<Value>,
    #[serde(default)]
    traces: Vec<Value>,
    #[serde(default)]
    spans: Vec<Value>,
}

/// Wire shape of `GET /spans/history`
#[derive(Debug, Default, Deserialize)]
struct RawHistory {
    #[serde(default)]
    spans: Vec<Value>,
}

/// HTTP + SSE telemetry backend
#[derive(Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl HttpBackend {
    /// Create a backend for `base_url`.
    ///
    /// `request_timeout` bounds the JSON queries only; the realtime feed is a
    /// long-lived response and is bounded by the connect timeout alone.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, DataError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| DataError::Config(format!("Invalid backend URL '{}': {}", base_url, e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS).min(request_timeout))
            .build()
            .map_err(|e| DataError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            api_key,
            request_timeout,
        })
    }

    // --------------------------------------------------------------------
    // Private HTTP helpers
    // --------------------------------------------------------------------

    fn url(&self, path: &str, pairs: &[(&str, String)]) -> Result<Url, DataError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| DataError::Config(format!("Invalid endpoint URL: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in pairs {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn get(&self, url: Url) -> RequestBuilder {
        let req = self.http.get(url);
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn check_status(response: Response) -> Result<Response, DataError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            body.chars().take(200).collect()
        };
        Err(DataError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: Url,
    ) -> Result<T, DataError> {
        let response = self
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_err(operation, e))?;
        Self::check_status(response)
            .await?
            .json::<T>()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    self.map_err(operation, e)
                } else {
                    DataError::InvalidResponse(e.to_string())
                }
            })
    }

    fn map_err(&self, operation: &'static str, e: reqwest::Error) -> DataError {
        if e.is_timeout() {
            DataError::timeout(operation, self.request_timeout.as_secs())
        } else {
            DataError::from(e)
        }
    }

    fn query_pairs(scope: &str, window: &TimeWindow, filters: &QueryFilters) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("scope", scope.to_string())];
        pairs.extend(filters.query_pairs(window));
        pairs
    }
}

#[async_trait]
impl TelemetryBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_stats(
        &self,
        scope: &str,
        window: &TimeWindow,
        filters: &QueryFilters,
    ) -> Result<Stats, DataError> {
        let url = self.url("/stats", &Self::query_pairs(scope, window, filters))?;
        self.get_json("fetch_stats", url).await
    }

    async fn fetch_sessions(
        &self,
        scope: &str,
        window: &TimeWindow,
        filters: &QueryFilters,
    ) -> Result<SessionSnapshot, DataError> {
        let url = self.url("/sessions", &Self::query_pairs(scope, window, filters))?;
        let raw: RawSnapshot = self.get_json("fetch_sessions", url).await?;

        Ok(SessionSnapshot {
            sessions: decode_batch::<SessionRecord>(raw.sessions),
            traces: decode_batch::<TraceRecord>(raw.traces),
            spans: decode_batch::<SpanRecord>(raw.spans),
        })
    }

    async fn fetch_span_history(
        &self,
        scope: &str,
        tool: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>, DataError> {
        let url = self.url(
            "/spans/history",
            &[
                ("scope", scope.to_string()),
                ("tool", tool.to_string()),
                ("since", to_query_timestamp(since)),
            ],
        )?;
        let raw: RawHistory = self.get_json("fetch_span_history", url).await?;

        let total = raw.spans.len();
        let samples: Vec<HistorySample> = raw
            .spans
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<HistorySample>(value) {
                Ok(sample) if sample.duration_ms.is_none_or(|d| d >= 0) => Some(sample),
                Ok(_) => {
                    tracing::warn!(tool, "Skipping history sample with negative duration");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, tool, "Skipping malformed history sample");
                    None
                }
            })
            .collect();
        tracing::debug!(tool, total, kept = samples.len(), "Fetched span history");
        Ok(samples)
    }

    async fn subscribe(&self, scope: &str) -> Result<ChangeSubscription, DataError> {
        let url = self.url("/realtime", &[("scope", scope.to_string())])?;
        let response = self
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| DataError::RealtimeDisconnect(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let mut events = response.bytes_stream().eventsource();
        let scope = scope.to_string();

        let stream = stream! {
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => match decode_change(&event.event, &event.data) {
                        Ok(Some(change)) => yield Ok(change),
                        Ok(None) => {
                            tracing::trace!(scope = %scope, event = %event.event, "Ignoring feed event");
                        }
                        Err(e) => yield Err(e),
                    },
                    Err(e) => {
                        yield Err(DataError::RealtimeDisconnect(e.to_string()));
                        break;
                    }
                }
            }
        };

        Ok(ChangeSubscription {
            receiver: Box::pin(stream),
        })
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
