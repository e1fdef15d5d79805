//! Playback layer boundary
//!
//! The state machine never talks to a player directly. It loads manifests
//! through the [`PlaybackLayer`] trait and reacts to the typed events the
//! returned handle emits; tests drive the machine with scripted events, and
//! the binary uses [`HlsProbe`], a headless implementation that fetches and
//! parses the playlists itself.
//!
//! A live playlist has no end marker; a finished recording does. That single
//! bit, carried on the first-playlist event, is what the manifest verifier
//! rules on.

use async_trait::async_trait;
use m3u8_rs::Playlist;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::Error;
use crate::manifest::PlaylistDetails;

/// Consecutive load failures tolerated before an error is unrecoverable.
const MAX_TRANSIENT_FAILURES: u32 = 3;

/// Event emitted by the playback layer for one loaded manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The manifest was parsed and its first-level playlist loaded.
    FirstPlaylistLoaded(PlaylistDetails),
    /// Fatal player error. Recoverable (network-class) errors are retried in
    /// place via [`PlaybackControl::reload`]; unrecoverable ones end the
    /// session.
    FatalError { recoverable: bool, detail: String },
}

/// One request to load a manifest URL.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub feed_index: usize,
    pub manifest_url: String,
    /// True only for break-mode fallback content.
    pub looping: bool,
}

/// A loaded manifest: a control handle plus the event stream.
pub struct LoadedPlayback {
    pub control: Arc<dyn PlaybackControl>,
    pub events: mpsc::Receiver<PlaybackEvent>,
}

/// Playback layer trait for abstraction and testing
#[async_trait]
pub trait PlaybackLayer: Send + Sync {
    async fn load(&self, request: LoadRequest) -> crate::Result<LoadedPlayback>;
}

/// Control surface of one loaded manifest.
#[async_trait]
pub trait PlaybackControl: Send + Sync {
    async fn play(&self);
    async fn pause(&self);
    /// Reload the same manifest in place (transient-network recovery, no
    /// state transition).
    async fn reload(&self);
    /// Full teardown. Must be idempotent.
    async fn destroy(&self);
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One playback session: exactly one per feed at any time.
///
/// Creating a new session for a feed requires destroying the previous one
/// first; [`PlaybackSession::destroy`] is idempotent so teardown paths can
/// overlap safely.
pub struct PlaybackSession {
    id: u64,
    feed_index: usize,
    manifest_url: String,
    looping: bool,
    live_confirmed: bool,
    control: Arc<dyn PlaybackControl>,
    pump: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    pub fn new(
        feed_index: usize,
        manifest_url: String,
        looping: bool,
        control: Arc<dyn PlaybackControl>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            feed_index,
            manifest_url,
            looping,
            live_confirmed: false,
            control,
            pump: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn feed_index(&self) -> usize {
        self.feed_index
    }

    pub fn manifest_url(&self) -> &str {
        &self.manifest_url
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn live_confirmed(&self) -> bool {
        self.live_confirmed
    }

    pub fn confirm_live(&mut self) {
        self.live_confirmed = true;
    }

    pub fn control(&self) -> Arc<dyn PlaybackControl> {
        Arc::clone(&self.control)
    }

    /// Attach the event pump task so teardown can stop it.
    pub fn attach_pump(&mut self, pump: JoinHandle<()>) {
        self.pump = Some(pump);
    }

    /// Tear the session down: destroy the underlying playback, then stop the
    /// event pump. Safe to call more than once.
    ///
    /// The pump abort comes last and is the final suspension-free step, so a
    /// teardown running inside the pump task itself (an event that ends the
    /// session) still applies every mutation before the task winds down.
    pub async fn destroy(&mut self) {
        self.control.destroy().await;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Headless HLS playback implementation.
///
/// Fetches the manifest, resolves the best variant of a master playlist, and
/// loads the media playlist. While the playlist is live it keeps refreshing
/// it at the playlist's target duration, so encoder stalls and playlist
/// endings surface as events the same way a real player's would.
pub struct HlsProbe {
    client: Client,
}

impl HlsProbe {
    pub fn new(upstream: &UpstreamConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(upstream.connect_timeout_seconds))
            .timeout(Duration::from_secs(upstream.request_timeout_seconds))
            .build()?;
        Ok(Self { client })
    }
}

struct ProbeControl {
    playing: AtomicBool,
    reload: Notify,
    shutdown: CancellationToken,
}

#[async_trait]
impl PlaybackControl for ProbeControl {
    async fn play(&self) {
        self.playing.store(true, Ordering::SeqCst);
    }

    async fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    async fn reload(&self) {
        self.reload.notify_one();
    }

    async fn destroy(&self) {
        self.playing.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

struct LoadedPlaylist {
    details: PlaylistDetails,
    media_url: Url,
    refresh: Duration,
}

#[async_trait]
impl PlaybackLayer for HlsProbe {
    async fn load(&self, request: LoadRequest) -> crate::Result<LoadedPlayback> {
        let url = Url::parse(&request.manifest_url)
            .map_err(|e| Error::Playback(format!("invalid manifest url: {e}")))?;

        let (event_tx, event_rx) = mpsc::channel(8);
        let control = Arc::new(ProbeControl {
            playing: AtomicBool::new(false),
            reload: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let client = self.client.clone();
        let task_control = Arc::clone(&control);
        tokio::spawn(async move {
            run_probe(client, request.feed_index, url, event_tx, task_control).await;
        });

        Ok(LoadedPlayback {
            control,
            events: event_rx,
        })
    }
}

async fn run_probe(
    client: Client,
    feed_index: usize,
    url: Url,
    events: mpsc::Sender<PlaybackEvent>,
    control: Arc<ProbeControl>,
) {
    let mut failures: u32 = 0;

    'load: loop {
        let loaded = match load_playlist(&client, &url).await {
            Ok(loaded) => loaded,
            Err(e) => {
                failures += 1;
                let recoverable = failures < MAX_TRANSIENT_FAILURES;
                warn!(feed = feed_index, failures, "Manifest load failed: {e}");
                if events
                    .send(PlaybackEvent::FatalError {
                        recoverable,
                        detail: e.to_string(),
                    })
                    .await
                    .is_err()
                    || !recoverable
                {
                    return;
                }
                tokio::select! {
                    () = control.shutdown.cancelled() => return,
                    () = control.reload.notified() => continue 'load,
                }
            }
        };
        failures = 0;

        debug!(
            feed = feed_index,
            live = loaded.details.live,
            bitrate = ?loaded.details.bitrate_bps,
            "First playlist loaded"
        );
        if events
            .send(PlaybackEvent::FirstPlaylistLoaded(loaded.details.clone()))
            .await
            .is_err()
        {
            return;
        }

        if !loaded.details.live {
            // Finished content: nothing to refresh. Idle until teardown, or
            // reload if the owner retries in place.
            tokio::select! {
                () = control.shutdown.cancelled() => return,
                () = control.reload.notified() => continue 'load,
            }
        }

        // Live playlist: keep it fresh until it ends, errors out, or the
        // session is destroyed.
        loop {
            tokio::select! {
                () = control.shutdown.cancelled() => return,
                () = control.reload.notified() => continue 'load,
                () = tokio::time::sleep(loaded.refresh) => {}
            }

            match fetch_media_playlist(&client, &loaded.media_url).await {
                Ok(media) if media.end_list => {
                    debug!(feed = feed_index, "Live playlist gained an end marker");
                    let _ = events
                        .send(PlaybackEvent::FatalError {
                            recoverable: false,
                            detail: "playlist ended".to_string(),
                        })
                        .await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    let recoverable = failures < MAX_TRANSIENT_FAILURES;
                    warn!(feed = feed_index, failures, "Playlist refresh failed: {e}");
                    if events
                        .send(PlaybackEvent::FatalError {
                            recoverable,
                            detail: e.to_string(),
                        })
                        .await
                        .is_err()
                        || !recoverable
                    {
                        return;
                    }
                    tokio::select! {
                        () = control.shutdown.cancelled() => return,
                        () = control.reload.notified() => continue 'load,
                    }
                }
            }
        }
    }
}

async fn load_playlist(client: &Client, url: &Url) -> crate::Result<LoadedPlaylist> {
    let bytes = client
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    match m3u8_rs::parse_playlist_res(&bytes) {
        Ok(Playlist::MasterPlaylist(master)) => {
            let variant = master
                .variants
                .iter()
                .max_by_key(|variant| variant.bandwidth)
                .ok_or_else(|| Error::Playback("master playlist has no variants".to_string()))?;
            let media_url = url
                .join(&variant.uri)
                .map_err(|e| Error::Playback(format!("invalid variant uri: {e}")))?;
            let media = fetch_media_playlist(client, &media_url).await?;
            Ok(LoadedPlaylist {
                details: PlaylistDetails {
                    live: !media.end_list,
                    bitrate_bps: Some(variant.bandwidth),
                },
                refresh: refresh_interval(media.target_duration as u64),
                media_url,
            })
        }
        Ok(Playlist::MediaPlaylist(media)) => Ok(LoadedPlaylist {
            details: PlaylistDetails {
                live: !media.end_list,
                bitrate_bps: None,
            },
            refresh: refresh_interval(media.target_duration as u64),
            media_url: url.clone(),
        }),
        Err(e) => Err(Error::Playback(format!("playlist parse failed: {e:?}"))),
    }
}

async fn fetch_media_playlist(client: &Client, url: &Url) -> crate::Result<m3u8_rs::MediaPlaylist> {
    let bytes = client
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    m3u8_rs::parse_media_playlist_res(&bytes)
        .map_err(|e| Error::Playback(format!("media playlist parse failed: {e:?}")))
}

fn refresh_interval(target_duration: u64) -> Duration {
    Duration::from_secs(target_duration.clamp(1, 5))
}
