//! Per-feed state machine
//!
//! One `FeedRuntime` per configured feed. Each runtime exclusively owns its
//! feed's playback session and poll slots, and every transition path runs
//! under the feed's state lock, so transitions for one feed are never
//! concurrent with each other. Network calls (status checks) happen before
//! the lock is taken; ticks re-check the phase under the lock so a late
//! callback from a cancelled poller observes the transition and backs off.
//!
//! Lifecycle: OFFLINE → CHECKING → LIVE → (ENDED → OFFLINE), with BREAK
//! pre-empting any state. ENDED is transient: the teardown it names happens
//! inside the transition and the feed lands back in OFFLINE with the
//! offline poller armed.
//!
//! The "confirmed not live" block flag guards the provider's reconnect
//! window: after the manifest verifier rejects a load (or the encoder
//! stops), the oracle may keep reporting "active" for up to a minute while
//! serving the recorded tail. While the flag is set, an active status is
//! ignored; the flag clears once a poll observes the upstream truly idle,
//! or on the next confirmed-live load.

use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::breaks::BreakSlot;
use crate::config::{FeedConfig, UpstreamConfig};
use crate::health::{HealthMonitor, HealthStatus};
use crate::manifest::{self, Verdict};
use crate::oracle::StatusProbe;
use crate::playback::{LoadRequest, PlaybackEvent, PlaybackLayer, PlaybackSession};
use crate::scheduler::{
    PollSlot, HEALTH_POLL_INTERVAL, LIVENESS_POLL_INTERVAL, OFFLINE_POLL_INTERVAL,
};

/// The indexed collection of feed runtimes, owned by the dashboard.
pub type FeedSet = Arc<tokio::sync::RwLock<Vec<Arc<FeedRuntime>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    Offline,
    Checking,
    Live,
    Break,
}

/// Point-in-time view of a feed for the display layer.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub index: usize,
    pub name: String,
    pub phase: FeedPhase,
    pub blocked: bool,
    pub bitrate_bps: Option<u64>,
    pub break_slot: Option<BreakSlot>,
    pub health: HealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArmedPollers {
    pub offline: bool,
    pub liveness: bool,
    pub health: bool,
}

struct FeedState {
    phase: FeedPhase,
    confirmed_not_live: bool,
    session: Option<PlaybackSession>,
    offline_poll: PollSlot,
    liveness_poll: PollSlot,
    health_poll: PollSlot,
    break_slot: Option<BreakSlot>,
    bitrate_bps: Option<u64>,
    /// Playback id surfaced by the status endpoint for feeds configured
    /// without one.
    discovered_playback_id: Option<String>,
}

pub struct FeedRuntime {
    index: usize,
    config: FeedConfig,
    upstream: UpstreamConfig,
    /// Playback ids resolved from the break video library, one per slot.
    break_videos: [Option<String>; 2],
    probe: Arc<dyn StatusProbe>,
    playback: Arc<dyn PlaybackLayer>,
    health: Arc<HealthMonitor>,
    state: tokio::sync::Mutex<FeedState>,
    /// Self-handle for the tasks this runtime spawns (pollers, event pump).
    me: Weak<FeedRuntime>,
}

impl FeedRuntime {
    pub fn new(
        index: usize,
        config: FeedConfig,
        upstream: UpstreamConfig,
        break_videos: [Option<String>; 2],
        probe: Arc<dyn StatusProbe>,
        playback: Arc<dyn PlaybackLayer>,
        health: Arc<HealthMonitor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            index,
            config,
            upstream,
            break_videos,
            probe,
            playback,
            health,
            state: tokio::sync::Mutex::new(FeedState {
                phase: FeedPhase::Offline,
                confirmed_not_live: false,
                session: None,
                offline_poll: PollSlot::new(),
                liveness_poll: PollSlot::new(),
                health_poll: PollSlot::new(),
                break_slot: None,
                bitrate_bps: None,
                discovered_playback_id: None,
            }),
            me: me.clone(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        let state = self.state.lock().await;
        FeedSnapshot {
            index: self.index,
            name: self.config.name.clone(),
            phase: state.phase,
            blocked: state.confirmed_not_live,
            bitrate_bps: state.bitrate_bps,
            break_slot: state.break_slot,
            health: self.health.status(self.index),
        }
    }

    pub(crate) async fn armed_pollers(&self) -> ArmedPollers {
        let state = self.state.lock().await;
        ArmedPollers {
            offline: state.offline_poll.is_armed(),
            liveness: state.liveness_poll.is_armed(),
            health: state.health_poll.is_armed(),
        }
    }

    /// Initial check: one immediate status probe, then either a live attempt
    /// or offline polling. Also re-entered after leaving break.
    pub async fn begin(&self) {
        let status = self
            .probe
            .check_status(self.config.live_stream_id.as_deref())
            .await;

        let mut state = self.state.lock().await;
        if state.phase != FeedPhase::Offline {
            return;
        }
        if let Some(id) = &status.playback_id {
            state.discovered_playback_id = Some(id.clone());
        }

        if status.is_live && !state.confirmed_not_live {
            info!(feed = self.index, "Upstream reports live, attempting playback");
            self.attempt_live(&mut state).await;
        } else {
            debug!(feed = self.index, raw_status = ?status.raw_status, "Feed not live, polling");
            self.arm_offline_poll(&mut state);
        }
    }

    /// Full teardown: cancel every poller, destroy the session, clear stats.
    /// Called on feed-set rebuild and shutdown.
    pub async fn teardown(&self) {
        let mut state = self.state.lock().await;
        state.offline_poll.cancel();
        state.liveness_poll.cancel();
        state.health_poll.cancel();
        self.health.clear(self.index);
        if let Some(mut session) = state.session.take() {
            session.destroy().await;
        }
        state.bitrate_bps = None;
        state.break_slot = None;
        state.phase = FeedPhase::Offline;
    }

    /// Force this feed into break mode, playing the fallback video assigned
    /// to `slot` on a loop. Normal polling stops entirely while on break.
    pub async fn enter_break(&self, slot: BreakSlot) {
        let mut state = self.state.lock().await;
        if state.phase == FeedPhase::Break && state.break_slot == Some(slot) {
            return;
        }

        state.offline_poll.cancel();
        state.liveness_poll.cancel();
        state.health_poll.cancel();
        self.health.clear(self.index);
        if let Some(mut session) = state.session.take() {
            session.destroy().await;
        }
        state.bitrate_bps = None;
        state.phase = FeedPhase::Break;
        state.break_slot = Some(slot);
        info!(feed = self.index, slot = slot.number(), "Entering break");

        let Some(playback_id) = self.break_videos[slot.index()].clone() else {
            warn!(
                feed = self.index,
                slot = slot.number(),
                "No break video assigned, holding without playback"
            );
            return;
        };
        let manifest_url = self.upstream.manifest_url(&playback_id);
        self.open_session(&mut state, manifest_url, true).await;
    }

    /// Leave break mode and re-enter the normal cycle as if freshly offline.
    pub async fn exit_break(&self) {
        {
            let mut state = self.state.lock().await;
            if state.phase != FeedPhase::Break {
                return;
            }
            if let Some(mut session) = state.session.take() {
                session.destroy().await;
            }
            state.break_slot = None;
            state.confirmed_not_live = false;
            state.phase = FeedPhase::Offline;
            info!(feed = self.index, "Leaving break, re-checking live status");
        }
        self.begin().await;
    }

    /// Offline poll tick (10s): waiting for the feed to go live.
    async fn offline_tick(&self) {
        let status = self
            .probe
            .check_status(self.config.live_stream_id.as_deref())
            .await;

        let mut state = self.state.lock().await;
        if state.phase != FeedPhase::Offline {
            return;
        }
        if let Some(id) = &status.playback_id {
            state.discovered_playback_id = Some(id.clone());
        }

        if !status.is_live {
            // Upstream truly idle: any reconnect window is over.
            if state.confirmed_not_live {
                info!(feed = self.index, "Upstream now idle, clearing block flag");
                state.confirmed_not_live = false;
            }
            return;
        }

        if state.confirmed_not_live {
            debug!(
                feed = self.index,
                "Upstream active but blocked, likely reconnect window"
            );
            return;
        }

        info!(feed = self.index, "Upstream reports live, attempting playback");
        self.attempt_live(&mut state).await;
    }

    /// Liveness poll tick (5s): detect the encoder stopping while LIVE.
    async fn liveness_tick(&self) {
        let status = self
            .probe
            .check_status(self.config.live_stream_id.as_deref())
            .await;

        let mut state = self.state.lock().await;
        if state.phase != FeedPhase::Live {
            return;
        }
        if !status.is_live {
            info!(feed = self.index, "Encoder stopped, ending playback");
            self.handle_ended(&mut state).await;
        }
    }

    async fn health_tick(&self) {
        self.health
            .refresh(self.index, self.config.live_stream_id.as_deref())
            .await;
    }

    /// Playback event dispatch. Events carry the id of the session that
    /// produced them; events from an already-destroyed session are dropped.
    pub async fn on_playback_event(&self, session_id: u64, event: PlaybackEvent) {
        let mut state = self.state.lock().await;
        let (current, looping) = match state.session.as_ref() {
            Some(session) => (session.id() == session_id, session.looping()),
            None => (false, false),
        };
        if !current {
            debug!(feed = self.index, session_id, "Dropping event from stale session");
            return;
        }

        if looping {
            // Fallback content is never verified: play whatever loaded.
            match event {
                PlaybackEvent::FirstPlaylistLoaded(_) => {
                    let control = state.session.as_ref().map(PlaybackSession::control);
                    if let Some(control) = control {
                        control.play().await;
                    }
                    debug!(feed = self.index, "Fallback video playing");
                }
                PlaybackEvent::FatalError { detail, .. } => {
                    warn!(feed = self.index, "Fallback video error: {detail}");
                }
            }
            return;
        }

        match event {
            PlaybackEvent::FirstPlaylistLoaded(details) => {
                match manifest::verify(self.index, &details) {
                    Verdict::Live { bitrate_bps } => {
                        state.bitrate_bps = bitrate_bps;
                        if state.phase == FeedPhase::Live {
                            // Re-confirmation after an in-place reload.
                            return;
                        }
                        state.confirmed_not_live = false;
                        let control = state.session.as_mut().map(|session| {
                            session.confirm_live();
                            session.control()
                        });
                        if let Some(control) = control {
                            control.play().await;
                        }
                        state.phase = FeedPhase::Live;
                        self.arm_liveness_poll(&mut state);
                        self.arm_health_poll(&mut state);
                        info!(feed = self.index, bitrate = ?bitrate_bps, "Feed is LIVE");
                    }
                    Verdict::Finished => {
                        // Recorded content sneaking through the reconnect
                        // window: stop immediately and block reloads.
                        let control = state.session.as_ref().map(PlaybackSession::control);
                        if let Some(control) = control {
                            control.pause().await;
                        }
                        self.handle_ended(&mut state).await;
                    }
                }
            }
            PlaybackEvent::FatalError {
                recoverable: true,
                detail,
            } => {
                debug!(feed = self.index, "Transient playback error, reloading: {detail}");
                let control = state.session.as_ref().map(PlaybackSession::control);
                if let Some(control) = control {
                    control.reload().await;
                }
            }
            PlaybackEvent::FatalError {
                recoverable: false,
                detail,
            } => {
                warn!(feed = self.index, "Unrecoverable playback error: {detail}");
                self.handle_ended(&mut state).await;
            }
        }
    }

    /// OFFLINE → CHECKING: open a session and let the verifier decide.
    async fn attempt_live(&self, state: &mut FeedState) {
        let Some(playback_id) = self.playback_id(state) else {
            debug!(feed = self.index, "No playback id known yet, staying offline");
            self.arm_offline_poll(state);
            return;
        };

        state.offline_poll.cancel();
        state.phase = FeedPhase::Checking;
        let manifest_url = self.upstream.manifest_url(&playback_id);
        self.open_session(state, manifest_url, false).await;
    }

    /// Open a playback session for this feed, destroying any previous one
    /// first, and start pumping its events into the machine.
    async fn open_session(&self, state: &mut FeedState, manifest_url: String, looping: bool) {
        if let Some(mut old) = state.session.take() {
            old.destroy().await;
        }

        let request = LoadRequest {
            feed_index: self.index,
            manifest_url: manifest_url.clone(),
            looping,
        };
        match self.playback.load(request).await {
            Ok(loaded) => {
                let mut session =
                    PlaybackSession::new(self.index, manifest_url, looping, loaded.control);
                let session_id = session.id();
                if let Some(feed) = self.me.upgrade() {
                    let mut events = loaded.events;
                    let pump = tokio::spawn(async move {
                        while let Some(event) = events.recv().await {
                            feed.on_playback_event(session_id, event).await;
                        }
                    });
                    session.attach_pump(pump);
                }
                state.session = Some(session);
            }
            Err(e) => {
                warn!(feed = self.index, "Failed to load manifest: {e}");
                if looping {
                    // Fallback failures leave the feed holding in BREAK.
                    return;
                }
                self.handle_ended(state).await;
            }
        }
    }

    /// ENDED: destroy the session, set the block flag, land in OFFLINE with
    /// the offline poller as the only armed timer.
    async fn handle_ended(&self, state: &mut FeedState) {
        state.liveness_poll.cancel();
        state.health_poll.cancel();
        self.health.clear(self.index);
        if let Some(mut session) = state.session.take() {
            session.destroy().await;
        }
        state.bitrate_bps = None;
        state.confirmed_not_live = true;
        state.phase = FeedPhase::Offline;
        self.arm_offline_poll(state);
        info!(feed = self.index, "Feed offline, polling for return");
    }

    fn playback_id(&self, state: &FeedState) -> Option<String> {
        self.config
            .playback_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| state.discovered_playback_id.clone())
    }

    fn arm_offline_poll(&self, state: &mut FeedState) {
        state.liveness_poll.cancel();
        let Some(feed) = self.me.upgrade() else {
            return;
        };
        state.offline_poll.arm(OFFLINE_POLL_INTERVAL, move || {
            let feed = Arc::clone(&feed);
            async move { feed.offline_tick().await }
        });
    }

    fn arm_liveness_poll(&self, state: &mut FeedState) {
        state.offline_poll.cancel();
        let Some(feed) = self.me.upgrade() else {
            return;
        };
        state.liveness_poll.arm(LIVENESS_POLL_INTERVAL, move || {
            let feed = Arc::clone(&feed);
            async move { feed.liveness_tick().await }
        });
    }

    fn arm_health_poll(&self, state: &mut FeedState) {
        let Some(feed) = self.me.upgrade() else {
            return;
        };
        state.health_poll.arm(HEALTH_POLL_INTERVAL, move || {
            let feed = Arc::clone(&feed);
            async move { feed.health_tick().await }
        });
    }
}
