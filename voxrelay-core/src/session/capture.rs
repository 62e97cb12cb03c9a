//! Blocking capture pipeline loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → native-rate f32 samples
//! 2. Feed the analysis window (barge-in loudness)
//! 3. Feed the framer; every completed frame goes to the uplink, in order
//! ```
//!
//! Runs on its own OS thread so the async executor never waits on audio.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::{info, warn};

use super::diagnostics::SessionDiagnostics;
use crate::{
    audio::framer::CaptureFramer,
    buffering::{window::AnalysisWindow, AudioConsumer, Consumer},
    uplink::Uplink,
};

/// All context the capture pipeline needs, passed as one struct so the
/// thread closure stays tidy.
pub struct CaptureContext {
    pub consumer: AudioConsumer,
    pub framer: CaptureFramer,
    pub window: AnalysisWindow,
    pub uplink: Uplink,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<SessionDiagnostics>,
}

/// Samples drained from the ring per iteration.
const DRAIN_CHUNK: usize = 1024;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const SLEEP_EMPTY: Duration = Duration::from_millis(2);

/// Run until `ctx.running` becomes false. A trailing partial frame is dropped.
pub fn run(mut ctx: CaptureContext) {
    info!(
        buffer_size = ctx.framer.buffer_size(),
        frame_len = ctx.framer.frame_len(),
        passthrough = ctx.framer.is_passthrough(),
        "capture pipeline started"
    );

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut uplink_gone = false;

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(SLEEP_EMPTY);
            continue;
        }

        ctx.diagnostics
            .samples_captured
            .fetch_add(n, Ordering::Relaxed);
        ctx.window.push(&raw[..n]);

        let uplink = &ctx.uplink;
        let diagnostics = &ctx.diagnostics;
        ctx.framer.push(&raw[..n], |frame| {
            if uplink.send_frame(&frame) {
                SessionDiagnostics::bump(&diagnostics.frames_sent);
            } else {
                SessionDiagnostics::bump(&diagnostics.frames_refused);
                if !uplink_gone {
                    uplink_gone = true;
                    warn!(seq = frame.seq, "uplink closed; capture frames discarded");
                }
            }
        });
    }

    info!(
        frames = ctx.framer.frames_emitted(),
        "capture pipeline stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_audio_ring, Producer};
    use crate::uplink::OutboundFrame;

    #[test]
    fn frames_flow_from_ring_to_uplink() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.0f32; 48_000 / 10]); // 100 ms at 48 kHz

        let (uplink, mut rx) = Uplink::channel();
        let running = Arc::new(AtomicBool::new(true));
        let diagnostics = Arc::new(SessionDiagnostics::default());
        let window = AnalysisWindow::new(512);

        let ctx = CaptureContext {
            consumer,
            framer: CaptureFramer::new(48_000, 16_000, 1024),
            window: window.clone(),
            uplink,
            running: Arc::clone(&running),
            diagnostics: Arc::clone(&diagnostics),
        };
        let handle = std::thread::spawn(move || run(ctx));

        // 4800 samples → 4 full frames.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while diagnostics.snapshot().frames_sent < 4 {
            assert!(std::time::Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
        running.store(false, Ordering::SeqCst);
        handle.join().expect("capture thread panicked");

        let mut frames = 0;
        while let Ok(OutboundFrame::Audio(bytes)) = rx.try_recv() {
            assert_eq!(bytes.len(), 341 * 2);
            frames += 1;
        }
        assert_eq!(frames, 4);
        assert_eq!(diagnostics.snapshot().samples_captured, 4_800);
        assert_eq!(window.snapshot().len(), 512);
    }
}
