//! Top-level dashboard coordinator
//!
//! Exclusively owns every per-feed runtime (no free-floating global maps):
//! builds the feed set from configuration, rebuilds it wholesale on a
//! settings save, and tears everything down in order on shutdown. Failures
//! never cross a feed boundary; the only hard startup errors are a dead
//! configuration and an expired event.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::breaks::{BreakApi, BreakClient, BreakCoordinator, BreakSlot};
use crate::config::Config;
use crate::error::Error;
use crate::feed::{FeedRuntime, FeedSet, FeedSnapshot};
use crate::health::HealthMonitor;
use crate::oracle::{StatusOracle, StatusProbe};
use crate::playback::{HlsProbe, PlaybackLayer};
use crate::prefs::{Preferences, PreferencesStore};

pub struct Dashboard {
    config: tokio::sync::Mutex<Config>,
    feeds: FeedSet,
    breaks: Arc<BreakCoordinator>,
    probe: Arc<dyn StatusProbe>,
    playback: Arc<dyn PlaybackLayer>,
    health: Arc<HealthMonitor>,
    prefs: PreferencesStore,
}

impl Dashboard {
    /// Build a dashboard with injected collaborators (tests script these).
    pub fn new(
        config: Config,
        probe: Arc<dyn StatusProbe>,
        playback: Arc<dyn PlaybackLayer>,
        break_api: Arc<dyn BreakApi>,
    ) -> crate::Result<Arc<Self>> {
        let health = Arc::new(HealthMonitor::new(&config.upstream)?);
        let prefs = PreferencesStore::new(config.prefs.path.clone());
        Ok(Arc::new(Self {
            config: tokio::sync::Mutex::new(config),
            feeds: Arc::new(tokio::sync::RwLock::new(Vec::new())),
            breaks: BreakCoordinator::new(break_api),
            probe,
            playback,
            health,
            prefs,
        }))
    }

    /// Build a dashboard wired to the real HTTP upstream.
    pub fn connect(config: Config) -> crate::Result<Arc<Self>> {
        let probe = Arc::new(StatusOracle::new(&config.upstream)?);
        let playback = Arc::new(HlsProbe::new(&config.upstream)?);
        let break_api = Arc::new(BreakClient::new(&config.upstream)?);
        Self::new(config, probe, playback, break_api)
    }

    /// Start monitoring: build the feed set, kick off each feed's initial
    /// check, and start the global break poll.
    pub async fn start(&self) -> crate::Result<()> {
        let config = self.config.lock().await.clone();

        if config.event.is_expired(Utc::now()) {
            let expired_at = config
                .event
                .expires_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default();
            return Err(Error::EventExpired {
                name: config.event.name,
                expired_at,
            });
        }

        if let Err(errors) = config.validate() {
            for error in &errors {
                warn!("Config problem: {error}");
            }
        }

        self.build_feeds(&config).await;
        self.begin_all().await;
        Arc::clone(&self.breaks).start(Arc::clone(&self.feeds));

        info!(
            event = %config.event.name,
            feeds = config.feeds.len(),
            "Dashboard started"
        );
        Ok(())
    }

    /// Settings save: swap in the new configuration and rebuild the entire
    /// feed set. Every existing feed is torn down (pollers cancelled,
    /// session destroyed) before the new runtimes are created.
    pub async fn apply_settings(&self, new_config: Config) {
        if let Err(errors) = new_config.validate() {
            for error in &errors {
                warn!("Config problem: {error}");
            }
        }

        *self.config.lock().await = new_config.clone();
        self.build_feeds(&new_config).await;
        self.begin_all().await;
        info!(feeds = new_config.feeds.len(), "Feed set rebuilt from saved settings");
    }

    pub async fn shutdown(&self) {
        self.breaks.stop();
        let feeds = self.feeds.read().await.clone();
        for feed in feeds {
            feed.teardown().await;
        }
        info!("Dashboard stopped");
    }

    pub async fn snapshots(&self) -> Vec<FeedSnapshot> {
        let feeds = self.feeds.read().await.clone();
        let mut snapshots = Vec::with_capacity(feeds.len());
        for feed in feeds {
            snapshots.push(feed.snapshot().await);
        }
        snapshots
    }

    /// Producer break toggle: optimistic local apply plus write-through.
    pub async fn set_break(
        &self,
        feed_index: usize,
        on_break: bool,
        slot: Option<BreakSlot>,
    ) -> crate::Result<()> {
        self.breaks
            .set_break(&self.feeds, feed_index, on_break, slot)
            .await
    }

    /// Gate for producer actions arriving from the display layer.
    pub async fn verify_producer_secret(&self, secret: &str) -> bool {
        let config = self.config.lock().await;
        !config.producer.secret.is_empty() && config.producer.secret == secret
    }

    #[must_use]
    pub fn load_preferences(&self) -> Preferences {
        self.prefs.load()
    }

    pub fn save_preferences(&self, prefs: &Preferences) -> crate::Result<()> {
        self.prefs.save(prefs)
    }

    async fn build_feeds(&self, config: &Config) {
        let mut feeds = self.feeds.write().await;
        for feed in feeds.iter() {
            feed.teardown().await;
        }
        feeds.clear();

        for (index, feed_config) in config.feeds.iter().enumerate() {
            let break_videos = [
                feed_config
                    .break_video_1
                    .as_deref()
                    .and_then(|id| config.break_video(id))
                    .map(|video| video.playback_id.clone()),
                feed_config
                    .break_video_2
                    .as_deref()
                    .and_then(|id| config.break_video(id))
                    .map(|video| video.playback_id.clone()),
            ];
            feeds.push(FeedRuntime::new(
                index,
                feed_config.clone(),
                config.upstream.clone(),
                break_videos,
                Arc::clone(&self.probe),
                Arc::clone(&self.playback),
                Arc::clone(&self.health),
            ));
        }
    }

    async fn begin_all(&self) {
        let feeds = self.feeds.read().await.clone();
        for feed in feeds {
            tokio::spawn(async move {
                feed.begin().await;
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn break_coordinator(&self) -> &Arc<BreakCoordinator> {
        &self.breaks
    }

    #[cfg(test)]
    pub(crate) fn feeds(&self) -> &FeedSet {
        &self.feeds
    }
}
