//! Interrupt coordination: one path for barge-in, user stop and teardown.
//!
//! An interrupt:
//! 1. clears the playback scheduler (queue, in-flight voice, clock),
//! 2. bumps the interrupt epoch, which cancels any pending barge-in timer,
//! 3. tells the remote side via the uplink so it stops generating.
//!
//! It is idempotent: with nothing playing it still signals the remote side and
//! leaves the scheduler idle. Session-state updates are the controller's job.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tracing::info;

use crate::{
    playback::{PlaybackScheduler, PlaybackSink},
    protocol::events::{InterruptEvent, InterruptSource},
    uplink::Uplink,
};

/// Monotonic interrupt counter shared with the barge-in loop.
#[derive(Debug, Clone, Default)]
pub struct InterruptEpoch(Arc<AtomicU64>);

impl InterruptEpoch {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug, Default)]
pub struct InterruptCoordinator {
    epoch: InterruptEpoch,
}

impl InterruptCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the barge-in loop.
    pub fn epoch(&self) -> InterruptEpoch {
        self.epoch.clone()
    }

    /// Flush playback and notify the remote side.
    pub fn interrupt<S: PlaybackSink>(
        &self,
        scheduler: &mut PlaybackScheduler<S>,
        uplink: Option<&Uplink>,
        source: InterruptSource,
    ) -> InterruptEvent {
        let report = scheduler.clear();
        let epoch = self.epoch.bump();
        let signalled_remote = uplink.map(|u| u.send_interrupt()).unwrap_or(false);

        info!(
            ?source,
            epoch,
            dropped = report.dropped_chunks,
            stopped = report.stopped.is_some(),
            signalled_remote,
            "playback interrupted"
        );

        InterruptEvent {
            source,
            dropped_chunks: report.dropped_chunks,
            stopped_playback: report.stopped.is_some(),
            signalled_remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::chunk::PlaybackBuffer;
    use crate::playback::{ScheduleOutcome, VoiceId};
    use crate::uplink::OutboundFrame;

    #[derive(Default)]
    struct CountingSink {
        stops: usize,
    }

    impl PlaybackSink for CountingSink {
        fn current_time(&self) -> f64 {
            0.0
        }
        fn start(&mut self, _voice: VoiceId, _buffer: PlaybackBuffer, _at: f64) {}
        fn stop(&mut self, _voice: VoiceId) {
            self.stops += 1;
        }
    }

    #[test]
    fn interrupt_clears_and_signals() {
        let coordinator = InterruptCoordinator::new();
        let mut scheduler = PlaybackScheduler::new(CountingSink::default(), 0.2);
        let started = scheduler.enqueue(PlaybackBuffer::new(vec![0.0; 12_000], 24_000));
        assert!(matches!(started, ScheduleOutcome::Started(_)));
        scheduler.enqueue(PlaybackBuffer::new(vec![0.0; 2_400], 24_000));

        let (uplink, mut rx) = Uplink::channel();
        let event = coordinator.interrupt(&mut scheduler, Some(&uplink), InterruptSource::User);

        assert_eq!(event.dropped_chunks, 1);
        assert!(event.stopped_playback);
        assert!(event.signalled_remote);
        assert_eq!(scheduler.sink().stops, 1);
        assert_eq!(scheduler.queue_len(), 0);
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Control(_))));
        assert_eq!(coordinator.epoch().current(), 1);
    }

    #[test]
    fn interrupt_without_playback_is_harmless() {
        let coordinator = InterruptCoordinator::new();
        let mut scheduler = PlaybackScheduler::new(CountingSink::default(), 0.2);
        let event = coordinator.interrupt(&mut scheduler, None, InterruptSource::BargeIn);
        assert_eq!(event.dropped_chunks, 0);
        assert!(!event.stopped_playback);
        assert!(!event.signalled_remote);
        assert_eq!(scheduler.sink().stops, 0);
    }
}
