//! Encoder status oracle
//!
//! Answers "is this feed's encoder currently active?" by querying the
//! upstream status endpoint. The mapping is fail-closed: only a literal
//! `"active"` status counts as live; every other value, error, timeout, or
//! unparseable body maps to not-live. Showing "not live" when uncertain is
//! safer than playing stale content to a live audience.
//!
//! The status endpoint keeps reporting `"active"` for up to ~60s after the
//! encoder actually disconnects (the provider's reconnect window). The
//! manifest verifier, not this oracle, makes the final live/recorded call.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;

/// Sentinel left in configs before a real encoder id has been filled in.
pub const PLACEHOLDER_STATUS_ID: &str = "ENTER_LIVE_STREAM_ID";

/// Where the status endpoint sourced its answer from.
///
/// `Webhook` state is instant (pushed by the provider on encoder events);
/// `Api` state lags by the provider's reconnect window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    Webhook,
    Api,
    Unknown,
}

/// Normalized result of one status check. Never an error shape: failure
/// paths fold into `is_live = false` with the cause recorded in `error`.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub is_live: bool,
    pub raw_status: Option<String>,
    /// First playback id advertised by the endpoint, if any. Feeds
    /// configured without a content id discover one through this.
    pub playback_id: Option<String>,
    pub source: StatusSource,
    pub error: Option<String>,
}

impl StreamStatus {
    fn not_live(error: impl Into<String>) -> Self {
        Self {
            is_live: false,
            raw_status: None,
            playback_id: None,
            source: StatusSource::Unknown,
            error: Some(error.into()),
        }
    }
}

/// Status probe trait for abstraction and testing
///
/// Allows feed state machines to be driven by scripted statuses in tests
/// without a live endpoint.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn check_status(&self, live_stream_id: Option<&str>) -> StreamStatus;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: Option<String>,
    #[serde(default, rename = "playbackIds")]
    playback_ids: Vec<String>,
    source: Option<String>,
}

/// HTTP status oracle against the upstream status endpoint.
pub struct StatusOracle {
    client: Client,
    endpoint: String,
}

impl StatusOracle {
    pub fn new(upstream: &UpstreamConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(upstream.connect_timeout_seconds))
            .timeout(Duration::from_secs(upstream.request_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/stream-status",
                upstream.api_base.trim_end_matches('/')
            ),
        })
    }
}

#[async_trait]
impl StatusProbe for StatusOracle {
    async fn check_status(&self, live_stream_id: Option<&str>) -> StreamStatus {
        // No id (or the config placeholder) means not-live without a call.
        let Some(id) = live_stream_id.filter(|id| !id.is_empty() && *id != PLACEHOLDER_STATUS_ID)
        else {
            return StreamStatus::not_live("no live stream id configured");
        };

        // Must never be served stale by an intermediate cache.
        let response = match self
            .client
            .get(&self.endpoint)
            .query(&[("liveStreamId", id)])
            .header(reqwest::header::CACHE_CONTROL, "no-cache, no-store")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(live_stream_id = %id, "Status check request failed: {e}");
                return StreamStatus::not_live(e.to_string());
            }
        };

        if !response.status().is_success() {
            let http_status = response.status();
            warn!(live_stream_id = %id, %http_status, "Status endpoint returned non-success");
            return StreamStatus::not_live(format!("HTTP {http_status}"));
        }

        let body: StatusResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(live_stream_id = %id, "Status response did not parse: {e}");
                return StreamStatus::not_live(e.to_string());
            }
        };

        // Strict check: only "active" means the encoder is actually streaming.
        let is_live = body.status.as_deref() == Some("active");
        let source = match body.source.as_deref() {
            Some("webhook") => StatusSource::Webhook,
            Some("api") => StatusSource::Api,
            _ => StatusSource::Unknown,
        };

        debug!(
            live_stream_id = %id,
            status = ?body.status,
            is_live,
            source = ?source,
            "Status check completed"
        );

        StreamStatus {
            is_live,
            raw_status: body.status,
            playback_id: body.playback_ids.into_iter().next(),
            source,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oracle_for(server: &MockServer) -> StatusOracle {
        StatusOracle::new(&UpstreamConfig {
            api_base: format!("{}/api", server.uri()),
            ..UpstreamConfig::default()
        })
        .expect("client builds")
    }

    #[tokio::test]
    async fn test_active_status_is_live() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/stream-status"))
            .and(query_param("liveStreamId", "ls-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "active",
                "playbackIds": ["pb-1", "pb-2"],
                "source": "api"
            })))
            .mount(&server)
            .await;

        let status = oracle_for(&server).check_status(Some("ls-1")).await;
        assert!(status.is_live);
        assert_eq!(status.raw_status.as_deref(), Some("active"));
        assert_eq!(status.playback_id.as_deref(), Some("pb-1"));
        assert_eq!(status.source, StatusSource::Api);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_idle_status_is_not_live() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/stream-status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "idle",
                "playbackIds": [],
                "source": "webhook"
            })))
            .mount(&server)
            .await;

        let status = oracle_for(&server).check_status(Some("ls-1")).await;
        assert!(!status.is_live);
        assert_eq!(status.raw_status.as_deref(), Some("idle"));
        assert_eq!(status.source, StatusSource::Webhook);
    }

    #[tokio::test]
    async fn test_http_error_maps_to_not_live() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/stream-status"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let status = oracle_for(&server).check_status(Some("ls-1")).await;
        assert!(!status.is_live);
        assert!(status.error.expect("error recorded").contains("502"));
    }

    #[tokio::test]
    async fn test_unparseable_body_maps_to_not_live() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/stream-status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let status = oracle_for(&server).check_status(Some("ls-1")).await;
        assert!(!status.is_live);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_missing_id_skips_network_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let oracle = oracle_for(&server);
        assert!(!oracle.check_status(None).await.is_live);
        assert!(!oracle.check_status(Some("")).await.is_live);
        assert!(!oracle.check_status(Some(PLACEHOLDER_STATUS_ID)).await.is_live);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_maps_to_not_live() {
        let oracle = StatusOracle::new(&UpstreamConfig {
            api_base: "http://127.0.0.1:9/api".to_string(),
            connect_timeout_seconds: 1,
            request_timeout_seconds: 1,
            ..UpstreamConfig::default()
        })
        .expect("client builds");

        let status = oracle.check_status(Some("ls-1")).await;
        assert!(!status.is_live);
        assert!(status.error.is_some());
    }
}
