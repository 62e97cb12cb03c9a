//! Async loop driving [`BargeInDetector`] at rendering cadence.
//!
//! The loop wakes on every cadence tick, or exactly at a pending timer's
//! deadline, whichever comes first. It terminates permanently the first time
//! it observes the session flag cleared; the controller spawns a fresh loop
//! on the next session start.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::{BargeInDecision, BargeInDetector};
use crate::{
    buffering::window::AnalysisWindow,
    interrupt::InterruptEpoch,
    playback::PlaybackGate,
    protocol::events::InterruptSource,
    session::{diagnostics::SessionDiagnostics, SessionEvent, SessionId},
};

/// Everything the detector loop needs, bundled so the spawn stays tidy.
pub struct DetectorContext {
    pub detector: BargeInDetector,
    pub window: AnalysisWindow,
    pub gate: PlaybackGate,
    /// Cleared when the session ends.
    pub active: Arc<AtomicBool>,
    /// Bumped by every interrupt; a change cancels the pending timer.
    pub epoch: InterruptEpoch,
    pub cadence: Duration,
    pub session: SessionId,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub diagnostics: Arc<SessionDiagnostics>,
}

/// Run until the session flag clears or the event channel closes.
pub async fn run(mut ctx: DetectorContext) {
    debug!(session = ctx.session.0, "barge-in detector started");

    let mut ticker = tokio::time::interval(ctx.cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut seen_epoch = ctx.epoch.current();

    loop {
        match ctx.detector.deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => {
                ticker.tick().await;
            }
        }

        if !ctx.active.load(Ordering::Acquire) {
            break;
        }

        let epoch = ctx.epoch.current();
        if epoch != seen_epoch {
            seen_epoch = epoch;
            if ctx.detector.cancel() {
                debug!("pending barge-in timer cancelled by interrupt");
            }
        }

        let window = &ctx.window;
        match ctx
            .detector
            .tick(Instant::now(), ctx.gate.is_active(), || window.peak())
        {
            BargeInDecision::Fire => {
                info!(session = ctx.session.0, "user barge-in detected");
                let event = SessionEvent::Interrupt {
                    session: ctx.session,
                    source: InterruptSource::BargeIn,
                };
                if ctx.events.send(event).is_err() {
                    break;
                }
            }
            BargeInDecision::Armed => {
                SessionDiagnostics::bump(&ctx.diagnostics.barge_in_arms);
                debug!("barge-in timer armed");
            }
            BargeInDecision::Cancelled => debug!("barge-in timer cancelled"),
            _ => {}
        }
    }

    debug!(session = ctx.session.0, "barge-in detector stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(
        gate: PlaybackGate,
        window: AnalysisWindow,
        active: Arc<AtomicBool>,
    ) -> (DetectorContext, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = DetectorContext {
            detector: BargeInDetector::default(),
            window,
            gate,
            active,
            epoch: InterruptEpoch::default(),
            cadence: Duration::from_millis(16),
            session: SessionId(7),
            events,
            diagnostics: Arc::new(SessionDiagnostics::default()),
        };
        (ctx, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_when_session_ends() {
        let active = Arc::new(AtomicBool::new(true));
        let (ctx, _rx) = context(
            PlaybackGate::new(),
            AnalysisWindow::new(16),
            Arc::clone(&active),
        );
        let handle = tokio::spawn(run(ctx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        active.store(false, Ordering::Release);
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("detector loop should stop")
            .expect("detector task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_microphone_never_interrupts() {
        let active = Arc::new(AtomicBool::new(true));
        let window = AnalysisWindow::new(16);
        window.push(&[0.001; 16]);
        let (ctx, mut rx) = context(PlaybackGate::new(), window, Arc::clone(&active));
        let handle = tokio::spawn(run(ctx));
        tokio::time::sleep(Duration::from_secs(1)).await;
        active.store(false, Ordering::Release);
        handle.await.expect("detector task panicked");
        assert!(rx.try_recv().is_err());
    }
}
