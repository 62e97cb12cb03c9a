//! Gapless playback scheduling for downlink speech.
//!
//! ## State machine
//!
//! ```text
//!            enqueue (buffered < prebuffer)
//!   Idle ───────────────────────────────► PreBuffering
//!    ▲  ◄── clear() / queue drained ──┐        │ buffered >= prebuffer
//!    │                                │        ▼
//!    └────────────────────────────── Playing ◄─┘
//!                                      │ ▲
//!                  voice ended ────────┘ │ start next at max(now, next_play_time)
//! ```
//!
//! The pre-buffer gate is only consulted while *not* playing. Once a stream
//! has started, each natural completion immediately schedules the next queued
//! chunk, so mid-stream jitter never re-triggers buffering.
//!
//! ## Ownership
//!
//! The scheduler owns the queue and both clock fields. It is mutated only
//! from the session event loop, so it carries no lock. Completion
//! notifications arrive as [`VoiceId`]s; every [`clear`](PlaybackScheduler::clear)
//! bumps the generation so notifications for voices started before the clear
//! are ignored.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffering::chunk::PlaybackBuffer;

/// Minimum queued audio before an idle scheduler starts playing (seconds).
pub const DEFAULT_PREBUFFER_SECS: f64 = 0.2;

/// Sample rate of downlink speech from the relay.
pub const DOWNLINK_SAMPLE_RATE: u32 = 24_000;

/// Identity of one scheduled chunk on the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId {
    /// Scheduler generation the voice was started in.
    pub generation: u64,
    /// Start order within the generation.
    pub seq: u64,
}

/// Output device able to play buffers at absolute times.
///
/// Natural completion of a started voice must be reported back to the owner
/// of the scheduler (see [`PlaybackScheduler::on_voice_ended`]). Stopped voices
/// need not be reported.
pub trait PlaybackSink: Send + 'static {
    /// Current output-device clock, in seconds.
    fn current_time(&self) -> f64;

    /// Start `buffer` at device time `at` (seconds).
    fn start(&mut self, voice: VoiceId, buffer: PlaybackBuffer, at: f64);

    /// Halt `voice` immediately. Stopping a finished or unknown voice is a no-op.
    fn stop(&mut self, voice: VoiceId);
}

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    PreBuffering,
    Playing,
}

/// One chunk handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub voice: VoiceId,
    /// Device time the chunk starts at.
    pub at: f64,
    /// Chunk length in seconds.
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.at + self.duration
    }
}

/// Result of an enqueue or a scheduling attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleOutcome {
    /// Idle and under the pre-buffer threshold; waiting for more audio.
    Buffering,
    /// A chunk is already in flight; the new one waits its turn.
    Queued,
    /// The head of the queue was handed to the sink.
    Started(ScheduledChunk),
    /// The queue ran dry and the scheduler went idle.
    Drained,
    /// A completion for a voice that is no longer current; nothing changed.
    Stale,
}

/// What a [`PlaybackScheduler::clear`] threw away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClearReport {
    /// Queued chunks discarded without playing.
    pub dropped_chunks: usize,
    /// In-flight voice that was stopped, if any.
    pub stopped: Option<VoiceId>,
}

/// Cross-thread view of "is the scheduler playing right now".
///
/// The barge-in detector polls this from its own task; only the scheduler
/// writes it.
#[derive(Debug, Clone, Default)]
pub struct PlaybackGate(Arc<AtomicBool>);

impl PlaybackGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, active: bool) {
        self.0.store(active, Ordering::Release);
    }
}

/// Queue + clock state for gapless sequential playback.
pub struct PlaybackScheduler<S: PlaybackSink> {
    sink: S,
    queue: VecDeque<PlaybackBuffer>,
    is_playing: bool,
    /// Device time at which the next chunk should start.
    next_play_time: f64,
    /// Queued-but-unplayed audio, in seconds.
    buffered_duration: f64,
    current: Option<VoiceId>,
    generation: u64,
    next_seq: u64,
    prebuffer_secs: f64,
    gate: PlaybackGate,
}

impl<S: PlaybackSink> PlaybackScheduler<S> {
    pub fn new(sink: S, prebuffer_secs: f64) -> Self {
        Self {
            sink,
            queue: VecDeque::new(),
            is_playing: false,
            next_play_time: 0.0,
            buffered_duration: 0.0,
            current: None,
            generation: 0,
            next_seq: 0,
            prebuffer_secs: prebuffer_secs.max(0.0),
            gate: PlaybackGate::new(),
        }
    }

    /// Queue a chunk and, if idle, try to start playback.
    pub fn enqueue(&mut self, buffer: PlaybackBuffer) -> ScheduleOutcome {
        self.buffered_duration += buffer.duration_secs();
        self.queue.push_back(buffer);

        if self.is_playing {
            ScheduleOutcome::Queued
        } else {
            self.attempt_start()
        }
    }

    /// Queue raw i16 PCM (normalized on the way in).
    pub fn enqueue_pcm16(&mut self, pcm: &[i16], sample_rate: u32) -> ScheduleOutcome {
        self.enqueue(PlaybackBuffer::from_pcm16(pcm, sample_rate))
    }

    /// Start the head of the queue if the gate allows it.
    pub fn attempt_start(&mut self) -> ScheduleOutcome {
        if !self.is_playing
            && self.buffered_duration < self.prebuffer_secs
            && !self.queue.is_empty()
        {
            return ScheduleOutcome::Buffering;
        }

        let Some(buffer) = self.queue.pop_front() else {
            self.is_playing = false;
            self.buffered_duration = 0.0;
            self.gate.set(false);
            debug!("playback queue drained");
            return ScheduleOutcome::Drained;
        };

        self.is_playing = true;
        self.gate.set(true);

        let duration = buffer.duration_secs();
        self.buffered_duration = (self.buffered_duration - duration).max(0.0);

        let at = self.sink.current_time().max(self.next_play_time);
        let voice = VoiceId {
            generation: self.generation,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        self.sink.start(voice, buffer, at);
        self.next_play_time = at + duration;
        self.current = Some(voice);

        debug!(seq = voice.seq, at, duration, "scheduled playback chunk");
        ScheduleOutcome::Started(ScheduledChunk {
            voice,
            at,
            duration,
        })
    }

    /// Continuation for a voice that finished naturally.
    pub fn on_voice_ended(&mut self, voice: VoiceId) -> ScheduleOutcome {
        if voice.generation != self.generation || self.current != Some(voice) {
            return ScheduleOutcome::Stale;
        }
        self.current = None;
        self.attempt_start()
    }

    /// Empty the queue, stop the in-flight voice and reset the clock.
    ///
    /// Safe to call in any state.
    pub fn clear(&mut self) -> ClearReport {
        let dropped_chunks = self.queue.len();
        self.queue.clear();
        self.buffered_duration = 0.0;

        let stopped = self.current.take();
        if let Some(voice) = stopped {
            self.sink.stop(voice);
        }

        self.is_playing = false;
        self.next_play_time = 0.0;
        self.generation += 1;
        self.next_seq = 0;
        self.gate.set(false);

        ClearReport {
            dropped_chunks,
            stopped,
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.is_playing {
            SchedulerState::Playing
        } else if !self.queue.is_empty() {
            SchedulerState::PreBuffering
        } else {
            SchedulerState::Idle
        }
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn next_play_time(&self) -> f64 {
        self.next_play_time
    }

    pub fn buffered_duration(&self) -> f64 {
        self.buffered_duration
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn current_voice(&self) -> Option<VoiceId> {
        self.current
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn prebuffer_secs(&self) -> f64 {
        self.prebuffer_secs
    }

    /// Shared flag mirroring [`is_playing`](Self::is_playing).
    pub fn gate(&self) -> PlaybackGate {
        self.gate.clone()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink with a hand-driven clock that records every call.
    #[derive(Default)]
    struct FakeSink {
        now: f64,
        started: Vec<(VoiceId, f64, f64)>,
        stopped: Vec<VoiceId>,
    }

    impl PlaybackSink for FakeSink {
        fn current_time(&self) -> f64 {
            self.now
        }

        fn start(&mut self, voice: VoiceId, buffer: PlaybackBuffer, at: f64) {
            self.started.push((voice, at, buffer.duration_secs()));
        }

        fn stop(&mut self, voice: VoiceId) {
            self.stopped.push(voice);
        }
    }

    fn chunk(secs: f64) -> PlaybackBuffer {
        let n = (secs * DOWNLINK_SAMPLE_RATE as f64).round() as usize;
        PlaybackBuffer::new(vec![0.1; n], DOWNLINK_SAMPLE_RATE)
    }

    fn scheduler() -> PlaybackScheduler<FakeSink> {
        PlaybackScheduler::new(FakeSink::default(), DEFAULT_PREBUFFER_SECS)
    }

    #[test]
    fn holds_until_prebuffer_reached() {
        let mut s = scheduler();
        assert_eq!(s.enqueue(chunk(0.05)), ScheduleOutcome::Buffering);
        assert_eq!(s.enqueue(chunk(0.1)), ScheduleOutcome::Buffering);
        assert_eq!(s.state(), SchedulerState::PreBuffering);
        assert!(s.sink().started.is_empty());

        let outcome = s.enqueue(chunk(0.1));
        assert!(matches!(outcome, ScheduleOutcome::Started(_)));
        assert_eq!(s.state(), SchedulerState::Playing);
        assert!(s.gate().is_active());
    }

    #[test]
    fn single_large_chunk_starts_immediately() {
        let mut s = scheduler();
        match s.enqueue(chunk(0.5)) {
            ScheduleOutcome::Started(c) => {
                assert_eq!(c.at, 0.0);
                assert_eq!(c.duration, 0.5);
            }
            other => panic!("expected start, got {other:?}"),
        }
        assert_eq!(s.next_play_time(), 0.5);
    }

    #[test]
    fn never_schedules_in_the_past() {
        let mut s = scheduler();
        s.sink_mut().now = 3.25;
        let ScheduleOutcome::Started(c) = s.enqueue(chunk(0.3)) else {
            panic!("expected start");
        };
        assert_eq!(c.at, 3.25);
    }

    #[test]
    fn gate_is_skipped_while_playing() {
        let mut s = scheduler();
        let ScheduleOutcome::Started(first) = s.enqueue(chunk(0.3)) else {
            panic!("expected start");
        };
        // Tiny chunk mid-stream: no buffering once the stream is running.
        assert_eq!(s.enqueue(chunk(0.01)), ScheduleOutcome::Queued);
        s.sink_mut().now = first.end();
        assert!(matches!(
            s.on_voice_ended(first.voice),
            ScheduleOutcome::Started(_)
        ));
    }

    #[test]
    fn drain_returns_to_idle() {
        let mut s = scheduler();
        let ScheduleOutcome::Started(c) = s.enqueue(chunk(0.25)) else {
            panic!("expected start");
        };
        s.sink_mut().now = c.end();
        assert_eq!(s.on_voice_ended(c.voice), ScheduleOutcome::Drained);
        assert_eq!(s.state(), SchedulerState::Idle);
        assert_eq!(s.buffered_duration(), 0.0);
        assert!(!s.gate().is_active());
    }

    #[test]
    fn clear_resets_everything() {
        let mut s = scheduler();
        let ScheduleOutcome::Started(c) = s.enqueue(chunk(0.3)) else {
            panic!("expected start");
        };
        s.enqueue(chunk(0.1));
        s.enqueue(chunk(0.1));

        let report = s.clear();
        assert_eq!(report.dropped_chunks, 2);
        assert_eq!(report.stopped, Some(c.voice));
        assert_eq!(s.sink().stopped, vec![c.voice]);
        assert_eq!(s.queue_len(), 0);
        assert_eq!(s.next_play_time(), 0.0);
        assert_eq!(s.buffered_duration(), 0.0);
        assert_eq!(s.state(), SchedulerState::Idle);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut s = scheduler();
        assert_eq!(s.clear(), ClearReport::default());
        assert_eq!(s.clear(), ClearReport::default());
        assert!(s.sink().stopped.is_empty());
    }

    #[test]
    fn clear_while_prebuffering_discards_pending() {
        let mut s = scheduler();
        s.enqueue(chunk(0.1));
        let report = s.clear();
        assert_eq!(report.dropped_chunks, 1);
        assert_eq!(report.stopped, None);
        // Fresh start after the clear goes through the gate again.
        assert_eq!(s.enqueue(chunk(0.1)), ScheduleOutcome::Buffering);
    }

    #[test]
    fn completion_from_before_clear_is_stale() {
        let mut s = scheduler();
        let ScheduleOutcome::Started(c) = s.enqueue(chunk(0.3)) else {
            panic!("expected start");
        };
        s.clear();
        s.enqueue(chunk(0.1));
        assert_eq!(s.on_voice_ended(c.voice), ScheduleOutcome::Stale);
        assert_eq!(s.queue_len(), 1);
        assert!(!s.is_playing());
    }

    #[test]
    fn consecutive_chunks_never_overlap() {
        let mut s = scheduler();
        let sizes = [0.07, 0.2, 0.013, 0.1, 0.31, 0.05, 0.05, 0.12];
        for secs in sizes {
            s.enqueue(chunk(secs));
        }
        // Completions arrive a little late, as real callbacks do.
        while let Some(voice) = s.current_voice() {
            let (_, at, dur) = *s.sink().started.last().unwrap();
            s.sink_mut().now = at + dur + 0.004;
            s.on_voice_ended(voice);
        }
        let started = &s.sink().started;
        assert_eq!(started.len(), sizes.len());
        for pair in started.windows(2) {
            let (_, at0, d0) = pair[0];
            let (_, at1, _) = pair[1];
            assert!(at1 >= at0 + d0, "overlap: {at1} < {at0} + {d0}");
        }
    }
}
