//! Ingest health monitor
//!
//! Advisory connection-strength indicator for feeds that are LIVE. Polled
//! from the upstream health endpoint on its own slot; the result only feeds
//! the stats display and never drives a state transition. Anything short of
//! a clean answer (endpoint unconfigured, error, missing data) reads as
//! Unknown rather than breaking the dashboard.

use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::UpstreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    Excellent,
    Good,
    Poor,
    #[default]
    Unknown,
}

impl HealthStatus {
    fn from_upstream(status: Option<&str>) -> Self {
        match status {
            Some("excellent") => Self::Excellent,
            Some("good") => Self::Good,
            Some("poor") => Self::Poor,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: Option<String>,
}

/// Per-feed health cache plus the client that refreshes it.
pub struct HealthMonitor {
    client: Client,
    endpoint: String,
    statuses: DashMap<usize, HealthStatus>,
}

impl HealthMonitor {
    pub fn new(upstream: &UpstreamConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(upstream.connect_timeout_seconds))
            .timeout(Duration::from_secs(upstream.request_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/stream-health",
                upstream.api_base.trim_end_matches('/')
            ),
            statuses: DashMap::new(),
        })
    }

    /// Refresh the cached health for a feed. Every failure path stores
    /// Unknown.
    pub async fn refresh(&self, feed_index: usize, live_stream_id: Option<&str>) {
        let status = match live_stream_id.filter(|id| !id.is_empty()) {
            Some(id) => self.check(id).await,
            None => HealthStatus::Unknown,
        };
        debug!(feed = feed_index, ?status, "Health refreshed");
        self.statuses.insert(feed_index, status);
    }

    async fn check(&self, live_stream_id: &str) -> HealthStatus {
        let response = match self
            .client
            .get(&self.endpoint)
            .query(&[("liveStreamId", live_stream_id)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(_) => return HealthStatus::Unknown,
        };
        if !response.status().is_success() {
            return HealthStatus::Unknown;
        }
        match response.json::<HealthResponse>().await {
            Ok(body) => HealthStatus::from_upstream(body.status.as_deref()),
            Err(_) => HealthStatus::Unknown,
        }
    }

    #[must_use]
    pub fn status(&self, feed_index: usize) -> HealthStatus {
        self.statuses
            .get(&feed_index)
            .map_or(HealthStatus::Unknown, |entry| *entry)
    }

    pub fn clear(&self, feed_index: usize) {
        self.statuses.remove(&feed_index);
    }
}
