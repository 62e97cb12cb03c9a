use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters shared between the controller, the capture pipeline thread and
/// the host. Reset on every session start.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub samples_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_refused: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub chunks_played: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub barge_ins: AtomicUsize,
    /// Barge-in timers armed, fired or not.
    pub barge_in_arms: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.samples_captured.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_refused.store(0, Ordering::Relaxed);
        self.chunks_received.store(0, Ordering::Relaxed);
        self.chunks_played.store(0, Ordering::Relaxed);
        self.interrupts.store(0, Ordering::Relaxed);
        self.barge_ins.store(0, Ordering::Relaxed);
        self.barge_in_arms.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_captured: self.samples_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_refused: self.frames_refused.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            barge_in_arms: self.barge_in_arms.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagnosticsSnapshot {
    pub samples_captured: usize,
    pub frames_sent: usize,
    pub frames_refused: usize,
    pub chunks_received: usize,
    pub chunks_played: usize,
    pub interrupts: usize,
    pub barge_ins: usize,
    pub barge_in_arms: usize,
}
