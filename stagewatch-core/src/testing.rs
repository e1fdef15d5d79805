//! Test doubles for driving the engine without a live upstream
//!
//! `FakeProbe` scripts encoder statuses, `ScriptedPlayback` scripts the
//! playback layer's events per load, and `FakeBreakApi` stands in for the
//! break-state endpoint. All of them record the calls they receive so tests
//! can assert on teardown ordering and single-flight behavior.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::breaks::{BreakApi, BreakEntry, BreakSlot, BreakSnapshot};
use crate::error::Error;
use crate::oracle::{StatusProbe, StatusSource, StreamStatus};
use crate::playback::{LoadRequest, LoadedPlayback, PlaybackControl, PlaybackEvent, PlaybackLayer};

/// Status probe returning a scripted current status.
pub struct FakeProbe {
    status: Mutex<StreamStatus>,
    checks: AtomicUsize,
}

impl FakeProbe {
    #[must_use]
    pub fn idle() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Self::idle_status()),
            checks: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn live() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Self::live_status(None)),
            checks: AtomicUsize::new(0),
        })
    }

    fn idle_status() -> StreamStatus {
        StreamStatus {
            is_live: false,
            raw_status: Some("idle".to_string()),
            playback_id: None,
            source: StatusSource::Api,
            error: None,
        }
    }

    fn live_status(playback_id: Option<String>) -> StreamStatus {
        StreamStatus {
            is_live: true,
            raw_status: Some("active".to_string()),
            playback_id,
            source: StatusSource::Api,
            error: None,
        }
    }

    pub async fn set_idle(&self) {
        *self.status.lock().await = Self::idle_status();
    }

    pub async fn set_live(&self) {
        *self.status.lock().await = Self::live_status(None);
    }

    pub async fn set_live_with_playback_id(&self, playback_id: &str) {
        *self.status.lock().await = Self::live_status(Some(playback_id.to_string()));
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusProbe for FakeProbe {
    async fn check_status(&self, _live_stream_id: Option<&str>) -> StreamStatus {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.status.lock().await.clone()
    }
}

/// Control handle recording every call it receives.
#[derive(Default)]
pub struct ScriptedControl {
    playing: AtomicBool,
    paused: AtomicBool,
    reloads: AtomicUsize,
    destroys: AtomicUsize,
}

impl ScriptedControl {
    pub fn playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackControl for ScriptedControl {
    async fn play(&self) {
        self.playing.store(true, Ordering::SeqCst);
    }

    async fn pause(&self) {
        self.playing.store(false, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }

    async fn destroy(&self) {
        self.playing.store(false, Ordering::SeqCst);
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

/// Playback layer emitting a scripted event sequence per successive load.
pub struct ScriptedPlayback {
    scripts: Mutex<VecDeque<Vec<PlaybackEvent>>>,
    loads: Mutex<Vec<(String, bool)>>,
    controls: Mutex<Vec<Arc<ScriptedControl>>>,
}

impl ScriptedPlayback {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            loads: Mutex::new(Vec::new()),
            controls: Mutex::new(Vec::new()),
        })
    }

    /// Queue the events the next load will emit.
    pub async fn push_script(&self, events: Vec<PlaybackEvent>) {
        self.scripts.lock().await.push_back(events);
    }

    pub async fn load_count(&self) -> usize {
        self.loads.lock().await.len()
    }

    /// Most recent load as (manifest url, looping).
    pub async fn last_load(&self) -> (String, bool) {
        self.loads
            .lock()
            .await
            .last()
            .cloned()
            .expect("no loads recorded")
    }

    /// Control handle of the n-th load.
    pub async fn control(&self, index: usize) -> Arc<ScriptedControl> {
        self.controls
            .lock()
            .await
            .get(index)
            .cloned()
            .expect("no control at index")
    }
}

#[async_trait]
impl PlaybackLayer for ScriptedPlayback {
    async fn load(&self, request: LoadRequest) -> crate::Result<LoadedPlayback> {
        let events = self.scripts.lock().await.pop_front().unwrap_or_default();
        let (event_tx, event_rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = event_tx.send(event).await;
        }
        // Dropping the sender ends the pump once the scripted events drain.
        drop(event_tx);

        let control = Arc::new(ScriptedControl::default());
        self.controls.lock().await.push(Arc::clone(&control));
        self.loads
            .lock()
            .await
            .push((request.manifest_url, request.looping));

        Ok(LoadedPlayback {
            control,
            events: event_rx,
        })
    }
}

/// In-memory break endpoint.
pub struct FakeBreakApi {
    snapshot: Mutex<BreakSnapshot>,
    sets: Mutex<Vec<(usize, bool, Option<BreakSlot>)>>,
    fail_writes: AtomicBool,
}

impl FakeBreakApi {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(BreakSnapshot::default()),
            sets: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Mutate the server-side state directly (another producer acting).
    pub async fn set_server_entry(&self, feed_index: usize, entry: BreakEntry) {
        self.snapshot.lock().await.set_entry(feed_index, entry);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn recorded_sets(&self) -> Vec<(usize, bool, Option<BreakSlot>)> {
        self.sets.lock().await.clone()
    }
}

#[async_trait]
impl BreakApi for FakeBreakApi {
    async fn fetch(&self) -> crate::Result<BreakSnapshot> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn set(
        &self,
        feed_index: usize,
        on_break: bool,
        slot: Option<BreakSlot>,
    ) -> crate::Result<BreakSnapshot> {
        self.sets.lock().await.push((feed_index, on_break, slot));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Internal("break endpoint unavailable".to_string()));
        }
        let mut snapshot = self.snapshot.lock().await;
        snapshot.set_entry(
            feed_index,
            BreakEntry {
                on_break,
                active_slot: slot,
            },
        );
        Ok(snapshot.clone())
    }
}
