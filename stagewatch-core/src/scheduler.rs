//! Poll scheduler primitives
//!
//! Each feed owns one slot per polling purpose (offline check, liveness
//! check, health check) plus one global slot for the break poll. The
//! "at most one armed poller per slot" guarantee is enforced by the slot
//! type itself: arming always cancels the previous occupant first, and
//! cancellation is explicit only (state transition, feed teardown,
//! shutdown). There is no backoff and no expiry; polling is unconditional
//! for as long as the slot stays armed.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Interval for the offline poll (waiting for a feed to go live).
pub const OFFLINE_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Interval for the liveness poll (detecting encoder stop while LIVE).
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Interval for the global break-mode poll.
pub const BREAK_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Interval for the advisory ingest-health poll while LIVE.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A slot holding at most one recurring poll task.
///
/// Overwriting the slot cancels the previous occupant before the new task is
/// stored, so two pollers for the same (feed, purpose) can never run
/// concurrently. Dropping the slot cancels the task.
#[derive(Default)]
pub struct PollSlot {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl PollSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.token.as_ref().is_some_and(|token| !token.is_cancelled())
    }

    /// Arm the slot with a recurring tick callback.
    ///
    /// Any previous occupant is cancelled first. The first tick fires one
    /// full period after arming, then every period thereafter. A hung tick
    /// delays only itself; the following tick fires as soon as it returns.
    pub fn arm<F, Fut>(&mut self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.cancel();

        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // tokio's first interval tick completes immediately; consume it
            // so the first poll lands a full period after arming.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tick().await;
            }
        });

        self.token = Some(token);
        self.handle = Some(handle);
    }

    /// Cancel the armed task, if any.
    ///
    /// The task exits at its next tick boundary; a tick already in flight
    /// runs to completion (callbacks re-check feed state under the feed
    /// lock, so a late tick observes the transition and backs off).
    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.handle.take();
    }
}

impl Drop for PollSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(20);

    fn counting_tick(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn test_armed_slot_ticks_repeatedly() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut slot = PollSlot::new();
        slot.arm(TICK, counting_tick(&counter));
        assert!(slot.is_armed());

        tokio::time::sleep(TICK * 10).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_first_tick_is_delayed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut slot = PollSlot::new();
        slot.arm(Duration::from_secs(60), counting_tick(&counter));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut slot = PollSlot::new();
        slot.arm(TICK, counting_tick(&counter));

        tokio::time::sleep(TICK * 5).await;
        slot.cancel();
        assert!(!slot.is_armed());

        let after_cancel = counter.load(Ordering::SeqCst);
        tokio::time::sleep(TICK * 5).await;
        // One in-flight tick may land, no more.
        assert!(counter.load(Ordering::SeqCst) <= after_cancel + 1);
    }

    #[tokio::test]
    async fn test_rearm_cancels_previous_occupant() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut slot = PollSlot::new();

        slot.arm(TICK, counting_tick(&first));
        tokio::time::sleep(TICK * 5).await;

        slot.arm(TICK, counting_tick(&second));
        let first_frozen = first.load(Ordering::SeqCst);

        tokio::time::sleep(TICK * 5).await;
        assert!(second.load(Ordering::SeqCst) >= 1);
        assert!(first.load(Ordering::SeqCst) <= first_frozen + 1);
        assert!(slot.is_armed());
    }

    #[tokio::test]
    async fn test_drop_cancels_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let mut slot = PollSlot::new();
            slot.arm(TICK, counting_tick(&counter));
            tokio::time::sleep(TICK * 3).await;
        }
        let after_drop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(TICK * 5).await;
        assert!(counter.load(Ordering::SeqCst) <= after_drop + 1);
    }

    #[tokio::test]
    async fn test_unarmed_slot_reports_unarmed() {
        let slot = PollSlot::new();
        assert!(!slot.is_armed());
    }
}
