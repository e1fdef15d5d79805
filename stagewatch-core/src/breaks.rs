//! Break-mode coordination
//!
//! The break state lives server-side; every dashboard instance polls it and
//! holds a cached copy. Reconciliation is by value diff: each poll compares
//! the fresh per-feed on-break boolean against the cache and invokes the
//! feed's BREAK-entry or BREAK-exit transition exactly once per detected
//! flip. A local producer toggle applies optimistically and writes through;
//! the POST echo is trusted as the new cached truth, and a concurrent
//! producer's change is corrected by the next poll (last writer wins).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::UpstreamConfig;
use crate::error::Error;
use crate::feed::FeedSet;
use crate::scheduler::{PollSlot, BREAK_POLL_INTERVAL};

/// Which of a feed's two assigned fallback videos a break plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakSlot {
    One,
    Two,
}

impl BreakSlot {
    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    #[must_use]
    pub fn from_number(number: u64) -> Option<Self> {
        match number {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            _ => None,
        }
    }

    /// Index into a feed's per-slot break video assignments.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
        }
    }
}

/// Break state for one feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakEntry {
    pub on_break: bool,
    pub active_slot: Option<BreakSlot>,
}

/// Per-feed break state as fetched from (or echoed by) the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakSnapshot {
    entries: HashMap<usize, BreakEntry>,
}

impl BreakSnapshot {
    /// Break state for a feed; feeds the server has never seen are off break.
    #[must_use]
    pub fn entry(&self, feed_index: usize) -> BreakEntry {
        self.entries.get(&feed_index).copied().unwrap_or_default()
    }

    pub fn set_entry(&mut self, feed_index: usize, entry: BreakEntry) {
        self.entries.insert(feed_index, entry);
    }

    /// Parse the server's break map. Keys are stringified feed indexes;
    /// non-numeric keys (`lastUpdated`, `updatedBy`) are metadata and
    /// skipped. Values are either the current object shape or the legacy
    /// plain boolean, which maps to slot 1 when on break.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Self {
        let mut entries = HashMap::new();
        let Some(map) = value.as_object() else {
            return Self::default();
        };

        for (key, entry) in map {
            let Ok(feed_index) = key.parse::<usize>() else {
                continue;
            };
            let parsed = match entry {
                serde_json::Value::Bool(on_break) => BreakEntry {
                    on_break: *on_break,
                    active_slot: on_break.then_some(BreakSlot::One),
                },
                serde_json::Value::Object(fields) => {
                    let on_break = fields
                        .get("onBreak")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false);
                    let active_slot = fields
                        .get("activeSlot")
                        .and_then(serde_json::Value::as_u64)
                        .and_then(BreakSlot::from_number);
                    BreakEntry {
                        on_break,
                        active_slot,
                    }
                }
                _ => continue,
            };
            entries.insert(feed_index, parsed);
        }

        Self { entries }
    }
}

/// Break endpoint trait for abstraction and testing
#[async_trait]
pub trait BreakApi: Send + Sync {
    async fn fetch(&self) -> crate::Result<BreakSnapshot>;
    async fn set(
        &self,
        feed_index: usize,
        on_break: bool,
        slot: Option<BreakSlot>,
    ) -> crate::Result<BreakSnapshot>;
}

#[derive(Debug, Deserialize)]
struct BreakModeResponse {
    success: bool,
    #[serde(rename = "breakMode", default)]
    break_mode: serde_json::Value,
}

/// HTTP client for the break-state endpoint.
pub struct BreakClient {
    client: Client,
    endpoint: String,
}

impl BreakClient {
    pub fn new(upstream: &UpstreamConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(upstream.connect_timeout_seconds))
            .timeout(Duration::from_secs(upstream.request_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/break-mode", upstream.api_base.trim_end_matches('/')),
        })
    }

    fn parse(body: BreakModeResponse) -> crate::Result<BreakSnapshot> {
        if !body.success {
            return Err(Error::Internal(
                "break endpoint reported failure".to_string(),
            ));
        }
        Ok(BreakSnapshot::from_value(&body.break_mode))
    }
}

#[async_trait]
impl BreakApi for BreakClient {
    async fn fetch(&self) -> crate::Result<BreakSnapshot> {
        let body: BreakModeResponse = self
            .client
            .get(&self.endpoint)
            .header(reqwest::header::CACHE_CONTROL, "no-store, no-cache")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Self::parse(body)
    }

    async fn set(
        &self,
        feed_index: usize,
        on_break: bool,
        slot: Option<BreakSlot>,
    ) -> crate::Result<BreakSnapshot> {
        let mut payload = serde_json::json!({
            "streamIndex": feed_index,
            "isOnBreak": on_break,
            "updatedBy": "producer",
        });
        if let Some(slot) = slot {
            payload["slot"] = slot.number().into();
        }

        let body: BreakModeResponse = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Self::parse(body)
    }
}

/// Cross-feed break coordinator.
///
/// Owns the single global break poll slot and the cached server snapshot.
pub struct BreakCoordinator {
    api: Arc<dyn BreakApi>,
    cached: tokio::sync::Mutex<BreakSnapshot>,
    poll: parking_lot::Mutex<PollSlot>,
}

impl BreakCoordinator {
    #[must_use]
    pub fn new(api: Arc<dyn BreakApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            cached: tokio::sync::Mutex::new(BreakSnapshot::default()),
            poll: parking_lot::Mutex::new(PollSlot::new()),
        })
    }

    /// Start the global break poll: one immediate fetch, then every 5s.
    pub fn start(self: Arc<Self>, feeds: FeedSet) {
        let initial = Arc::clone(&self);
        let initial_feeds = Arc::clone(&feeds);
        tokio::spawn(async move {
            initial.poll_once(&initial_feeds).await;
        });

        let coordinator = Arc::clone(&self);
        self.poll.lock().arm(BREAK_POLL_INTERVAL, move || {
            let coordinator = Arc::clone(&coordinator);
            let feeds = Arc::clone(&feeds);
            async move {
                coordinator.poll_once(&feeds).await;
            }
        });
    }

    pub fn stop(&self) {
        self.poll.lock().cancel();
    }

    /// One poll cycle: fetch the server snapshot and reconcile. A failed
    /// fetch keeps the cache; the next tick retries.
    pub async fn poll_once(&self, feeds: &FeedSet) {
        match self.api.fetch().await {
            Ok(snapshot) => self.reconcile(snapshot, feeds).await,
            Err(e) => warn!("Break state fetch failed: {e}"),
        }
    }

    /// Producer toggle: apply the transition immediately (optimistic), then
    /// write through. The POST echo becomes the new cached truth; if the
    /// write fails the optimistic state stands until the next poll corrects
    /// it.
    pub async fn set_break(
        &self,
        feeds: &FeedSet,
        feed_index: usize,
        on_break: bool,
        slot: Option<BreakSlot>,
    ) -> crate::Result<()> {
        let feed = feeds
            .read()
            .await
            .get(feed_index)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("no feed at index {feed_index}")))?;

        let slot = on_break.then(|| slot.unwrap_or(BreakSlot::One));
        {
            let mut cached = self.cached.lock().await;
            cached.set_entry(
                feed_index,
                BreakEntry {
                    on_break,
                    active_slot: slot,
                },
            );
        }

        if let Some(slot) = slot {
            feed.enter_break(slot).await;
        } else {
            feed.exit_break().await;
        }

        match self.api.set(feed_index, on_break, slot).await {
            Ok(echo) => {
                self.reconcile(echo, feeds).await;
                Ok(())
            }
            Err(e) => {
                warn!(
                    feed = feed_index,
                    "Break write-through failed, next poll reconciles: {e}"
                );
                Err(e)
            }
        }
    }

    /// Diff the snapshot against the cache and apply each flip exactly once.
    async fn reconcile(&self, snapshot: BreakSnapshot, feeds: &FeedSet) {
        let feeds = feeds.read().await.clone();
        let mut cached = self.cached.lock().await;

        for feed in &feeds {
            let index = feed.index();
            let previous = cached.entry(index);
            let next = snapshot.entry(index);
            if previous.on_break == next.on_break {
                continue;
            }

            info!(feed = index, on_break = next.on_break, "Break state flipped");
            if next.on_break {
                feed.enter_break(next.active_slot.unwrap_or(BreakSlot::One))
                    .await;
            } else {
                feed.exit_break().await;
            }
        }

        *cached = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_snapshot_parses_current_format() {
        let snapshot = BreakSnapshot::from_value(&serde_json::json!({
            "0": { "onBreak": true, "activeSlot": 2 },
            "1": { "onBreak": false, "activeSlot": null },
            "lastUpdated": "2025-01-26T10:00:00Z",
            "updatedBy": "producer",
        }));

        assert_eq!(
            snapshot.entry(0),
            BreakEntry {
                on_break: true,
                active_slot: Some(BreakSlot::Two)
            }
        );
        assert_eq!(snapshot.entry(1), BreakEntry::default());
        // Unknown feeds default to off-break.
        assert_eq!(snapshot.entry(7), BreakEntry::default());
    }

    #[test]
    fn test_snapshot_parses_legacy_boolean_format() {
        let snapshot = BreakSnapshot::from_value(&serde_json::json!({
            "0": true,
            "1": false,
        }));

        assert_eq!(
            snapshot.entry(0),
            BreakEntry {
                on_break: true,
                active_slot: Some(BreakSlot::One)
            }
        );
        assert!(!snapshot.entry(1).on_break);
    }

    #[test]
    fn test_snapshot_ignores_junk() {
        let snapshot = BreakSnapshot::from_value(&serde_json::json!({
            "0": "garbage",
            "not-a-number": { "onBreak": true },
        }));
        assert_eq!(snapshot, BreakSnapshot::default());

        assert_eq!(
            BreakSnapshot::from_value(&serde_json::json!(null)),
            BreakSnapshot::default()
        );
    }

    #[test]
    fn test_slot_numbers() {
        assert_eq!(BreakSlot::from_number(1), Some(BreakSlot::One));
        assert_eq!(BreakSlot::from_number(2), Some(BreakSlot::Two));
        assert_eq!(BreakSlot::from_number(3), None);
        assert_eq!(BreakSlot::One.index(), 0);
        assert_eq!(BreakSlot::Two.number(), 2);
    }

    #[tokio::test]
    async fn test_client_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/break-mode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "breakMode": {
                    "0": { "onBreak": true, "activeSlot": 1 },
                }
            })))
            .mount(&server)
            .await;

        let client = BreakClient::new(&UpstreamConfig {
            api_base: format!("{}/api", server.uri()),
            ..UpstreamConfig::default()
        })
        .expect("client builds");

        let snapshot = client.fetch().await.expect("fetch succeeds");
        assert!(snapshot.entry(0).on_break);
        assert_eq!(snapshot.entry(0).active_slot, Some(BreakSlot::One));
    }

    #[tokio::test]
    async fn test_client_set_posts_slot_and_trusts_echo() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/break-mode"))
            .and(body_partial_json(serde_json::json!({
                "streamIndex": 2,
                "isOnBreak": true,
                "slot": 2,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "breakMode": {
                    "2": { "onBreak": true, "activeSlot": 2 },
                }
            })))
            .mount(&server)
            .await;

        let client = BreakClient::new(&UpstreamConfig {
            api_base: format!("{}/api", server.uri()),
            ..UpstreamConfig::default()
        })
        .expect("client builds");

        let echo = client
            .set(2, true, Some(BreakSlot::Two))
            .await
            .expect("set succeeds");
        assert_eq!(echo.entry(2).active_slot, Some(BreakSlot::Two));
    }

    #[tokio::test]
    async fn test_client_surfaces_unsuccessful_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/break-mode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "error": "storage unavailable"
            })))
            .mount(&server)
            .await;

        let client = BreakClient::new(&UpstreamConfig {
            api_base: format!("{}/api", server.uri()),
            ..UpstreamConfig::default()
        })
        .expect("client builds");

        assert!(client.fetch().await.is_err());
    }
}
