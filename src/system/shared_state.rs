//! State shared between the pipeline manager and the stage threads.
//!
//! Only coordination data lives here: the shutdown flag, the presentation
//! target and statistics counters. The voxel map is shared separately and
//! nothing else crosses stage boundaries except by message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::RwLock;
use tracing::trace;

use super::messages::PresentationEvent;

/// Shared state accessible by the frontend and backend threads.
pub struct SharedState {
    /// Request both stages to exit without draining their queues.
    shutdown_requested: AtomicBool,

    /// Where live frames and map notifications go. May be swapped at any time.
    presentation: RwLock<Option<Sender<PresentationEvent>>>,

    pub counters: PipelineCounters,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_shutdown(&self) {
        self.shutdown_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn set_presentation_target(&self, target: Option<Sender<PresentationEvent>>) {
        *self.presentation.write() = target;
    }

    /// Fire-and-forget delivery to the presentation target, if any.
    ///
    /// Never blocks: a full or disconnected target drops the event.
    pub fn publish(&self, event: PresentationEvent) {
        let Some(target) = self.presentation.read().clone() else {
            return;
        };
        match target.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!("[Pipeline] presentation target full, event discarded");
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!("[Pipeline] presentation receiver dropped, event discarded");
            }
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            shutdown_requested: AtomicBool::new(false),
            presentation: RwLock::new(None),
            counters: PipelineCounters::default(),
        }
    }
}

/// Monotonic event counters updated by the stage threads.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_received: AtomicU64,
    pub frames_tracked: AtomicU64,
    pub frames_degraded: AtomicU64,
    pub keyframes_emitted: AtomicU64,
    pub keyframes_fused: AtomicU64,
    pub keyframes_rejected: AtomicU64,
    pub optimizations_applied: AtomicU64,
    pub optimizations_skipped: AtomicU64,
}

impl PipelineCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            frames_received: get(&self.frames_received),
            frames_tracked: get(&self.frames_tracked),
            frames_degraded: get(&self.frames_degraded),
            keyframes_emitted: get(&self.keyframes_emitted),
            keyframes_fused: get(&self.keyframes_fused),
            keyframes_rejected: get(&self.keyframes_rejected),
            optimizations_applied: get(&self.optimizations_applied),
            optimizations_skipped: get(&self.optimizations_skipped),
        }
    }
}

/// Point-in-time copy of [`PipelineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub frames_tracked: u64,
    pub frames_degraded: u64,
    pub keyframes_emitted: u64,
    pub keyframes_fused: u64,
    pub keyframes_rejected: u64,
    pub optimizations_applied: u64,
    pub optimizations_skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, unbounded};

    #[test]
    fn test_publish_without_target_is_noop() {
        let shared = SharedState::new();
        shared.publish(PresentationEvent::MapUpdated);
    }

    #[test]
    fn test_publish_to_target_and_swap() {
        let shared = SharedState::new();
        let (tx1, rx1) = unbounded();
        let (tx2, rx2) = unbounded();

        shared.set_presentation_target(Some(tx1));
        shared.publish(PresentationEvent::MapUpdated);
        shared.set_presentation_target(Some(tx2));
        shared.publish(PresentationEvent::MapUpdated);
        shared.publish(PresentationEvent::MapUpdated);

        assert_eq!(rx1.try_iter().count(), 1);
        assert_eq!(rx2.try_iter().count(), 2);
    }

    #[test]
    fn test_publish_drops_events_when_target_full() {
        let shared = SharedState::new();
        let (tx, rx) = bounded(1);
        shared.set_presentation_target(Some(tx));

        for _ in 0..3 {
            shared.publish(PresentationEvent::MapUpdated);
        }
        // The target can still be swapped out while full.
        shared.set_presentation_target(None);

        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_publish_after_receiver_dropped() {
        let shared = SharedState::new();
        let (tx, rx) = bounded(4);
        shared.set_presentation_target(Some(tx));
        drop(rx);
        shared.publish(PresentationEvent::MapUpdated);
    }

    #[test]
    fn test_counters_snapshot() {
        let shared = SharedState::new();
        PipelineCounters::incr(&shared.counters.frames_received);
        PipelineCounters::incr(&shared.counters.frames_received);
        PipelineCounters::incr(&shared.counters.keyframes_fused);

        let stats = shared.counters.snapshot();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.keyframes_fused, 1);
        assert_eq!(stats.keyframes_rejected, 0);
    }
}
