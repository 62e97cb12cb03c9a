//! `Conversation`: the session lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Conversation::new()
//!     └─► start()                 → status = Connecting, host opens the transport
//!         └─► TransportOpened     → mic open, pipeline + detector spawned, status = Listening
//!             ├─► Downlink        → status = Speaking, chunk fed to the scheduler
//!             ├─► PlaybackEnded   → next chunk, or status = Listening once drained
//!             └─► Stop / TransportClosed / TransportError / DeviceError
//!                                 → teardown, status = Closed | Error
//! ```
//!
//! ## Threading
//!
//! Every state change happens on whichever task drives [`Conversation::run`]
//! (or calls [`Conversation::handle`]). The audio device callbacks, the
//! capture pipeline thread and the barge-in loop never touch the scheduler;
//! they talk to the controller through [`SessionEvent`]s.
//!
//! Events carry the [`SessionId`] they were produced for. Anything addressed
//! to an older session is dropped, so late callbacks after a teardown are
//! no-ops.

pub mod capture;
pub mod diagnostics;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::runtime::RuntimeFlavor;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        framer::{CaptureFramer, DEFAULT_BUFFER_SIZE, UPLINK_SAMPLE_RATE},
        CaptureBackend,
    },
    bargein::{runner, BargeInDetector, DEFAULT_INTERRUPTION_DELAY, DEFAULT_SENSITIVITY},
    buffering::{create_audio_ring, window::AnalysisWindow, AudioProducer},
    error::{Result, VoxError},
    interrupt::InterruptCoordinator,
    playback::{
        PlaybackScheduler, PlaybackSink, ScheduleOutcome, VoiceId, DEFAULT_PREBUFFER_SECS,
        DOWNLINK_SAMPLE_RATE,
    },
    protocol::{
        events::{InterruptEvent, InterruptSource, SessionState, SessionStatusEvent},
        wire::decode_downlink,
    },
    uplink::Uplink,
};

use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};

/// Broadcast channel capacity for status and interrupt events.
const BROADCAST_CAP: usize = 64;

/// Status detail shown for any remote-side failure.
pub const SERVICE_UNAVAILABLE: &str = "service unavailable";

/// Configuration for [`Conversation`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Native-rate samples accumulated per capture frame. Default: 1024.
    pub buffer_size: usize,
    /// Rate of uplink frames (Hz). Default: 16000.
    pub uplink_sample_rate: u32,
    /// Rate of downlink chunks (Hz). Default: 24000.
    pub downlink_sample_rate: u32,
    /// Audio that must be queued before an idle scheduler starts. Default: 0.2 s.
    pub prebuffer_secs: f64,
    /// Peak amplitude that counts as the user talking. Default: 0.02.
    pub barge_in_sensitivity: f32,
    /// How long loudness must persist to interrupt. Default: 200 ms.
    pub interruption_delay: Duration,
    /// Microphone samples inspected per barge-in tick. Default: 512.
    pub analysis_window: usize,
    /// Barge-in tick period. Default: 16 ms (~60 Hz).
    pub detector_cadence: Duration,
    /// Run the barge-in loop at all. Default: true.
    pub barge_in_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            uplink_sample_rate: UPLINK_SAMPLE_RATE,
            downlink_sample_rate: DOWNLINK_SAMPLE_RATE,
            prebuffer_secs: DEFAULT_PREBUFFER_SECS,
            barge_in_sensitivity: DEFAULT_SENSITIVITY,
            interruption_delay: DEFAULT_INTERRUPTION_DELAY,
            analysis_window: 512,
            detector_cadence: Duration::from_millis(16),
            barge_in_enabled: true,
        }
    }
}

/// Token identifying one `start()` … teardown span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub u64);

/// Why the transport went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed without a failure.
    Normal,
    /// The remote AI session ended; the user may reconnect.
    SessionEnded(String),
    /// The relay could not reach or lost the AI service.
    ServiceUnavailable(String),
}

impl CloseReason {
    /// Map a WebSocket close code from the relay.
    ///
    /// `1011` (internal error) and `1006` (abnormal) mean the service is
    /// unavailable, `1013` (try again later) means the AI session ended.
    pub fn from_close_code(code: u16, reason: &str) -> Self {
        match code {
            1006 | 1011 => CloseReason::ServiceUnavailable(reason.to_string()),
            1013 => CloseReason::SessionEnded(reason.to_string()),
            _ => CloseReason::Normal,
        }
    }
}

/// Everything that can happen to a conversation, delivered to the controller.
#[derive(Debug)]
pub enum SessionEvent {
    /// Transport connected; frames for the remote side go through `uplink`.
    TransportOpened { session: SessionId, uplink: Uplink },
    /// One binary downlink message (i16 LE PCM).
    Downlink { session: SessionId, payload: Vec<u8> },
    /// The output device finished a voice naturally.
    PlaybackEnded(VoiceId),
    /// Barge-in fired, or the user asked to cut the AI off.
    Interrupt {
        session: SessionId,
        source: InterruptSource,
    },
    TransportClosed {
        session: SessionId,
        reason: CloseReason,
    },
    TransportError { session: SessionId, detail: String },
    /// An audio stream failed after opening. Applies to the live session.
    DeviceError { detail: String },
    /// User stop action.
    Stop,
}

/// Drives one conversation at a time over a playback sink and a microphone.
pub struct Conversation<S: PlaybackSink, C: CaptureBackend> {
    config: SessionConfig,
    scheduler: PlaybackScheduler<S>,
    capture: C,
    coordinator: InterruptCoordinator,
    window: AnalysisWindow,
    state: SessionState,
    session: SessionId,
    /// Fresh per session; cleared on teardown to stop every helper loop.
    active: Arc<AtomicBool>,
    uplink: Option<Uplink>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    interrupt_tx: broadcast::Sender<InterruptEvent>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl<S: PlaybackSink, C: CaptureBackend> Conversation<S, C> {
    /// `events_tx` must feed the receiver later passed to [`run`](Self::run);
    /// the barge-in loop posts its interrupts there.
    pub fn new(
        config: SessionConfig,
        sink: S,
        capture: C,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (interrupt_tx, _) = broadcast::channel(BROADCAST_CAP);
        let scheduler = PlaybackScheduler::new(sink, config.prebuffer_secs);
        let window = AnalysisWindow::new(config.analysis_window.max(1));

        Self {
            config,
            scheduler,
            capture,
            coordinator: InterruptCoordinator::new(),
            window,
            state: SessionState::Idle,
            session: SessionId::default(),
            active: Arc::new(AtomicBool::new(false)),
            uplink: None,
            events_tx,
            status_tx,
            interrupt_tx,
            diagnostics: Arc::new(SessionDiagnostics::default()),
        }
    }

    /// Begin a new session. The host should now open the transport and post
    /// [`SessionEvent::TransportOpened`] with the returned id.
    ///
    /// # Errors
    /// `VoxError::AlreadyActive` while a session is connecting or live.
    pub fn start(&mut self) -> Result<SessionId> {
        if self.active.load(Ordering::Acquire) {
            return Err(VoxError::AlreadyActive);
        }

        self.scheduler.clear();
        self.window.clear();
        self.diagnostics.reset();
        self.session = SessionId(self.session.0 + 1);
        self.active = Arc::new(AtomicBool::new(true));
        self.set_state(SessionState::Connecting, None);

        info!(session = self.session.0, "session starting");
        Ok(self.session)
    }

    /// Transport is up: open the microphone and start streaming.
    pub fn on_transport_open(&mut self, session: SessionId, uplink: Uplink) {
        if session != self.session || self.state != SessionState::Connecting {
            debug!(session = session.0, "transport opened for a stale session");
            uplink.close();
            return;
        }

        let (producer, consumer) = create_audio_ring();
        let native_rate = match self.open_capture(producer) {
            Ok(rate) => rate,
            Err(e) => {
                error!("failed to open microphone: {e}");
                self.uplink = Some(uplink);
                self.teardown(SessionState::Error, Some(e.to_string()));
                return;
            }
        };

        let ctx = capture::CaptureContext {
            consumer,
            framer: CaptureFramer::new(
                native_rate,
                self.config.uplink_sample_rate,
                self.config.buffer_size,
            ),
            window: self.window.clone(),
            uplink: uplink.clone(),
            running: Arc::clone(&self.active),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        let spawned = std::thread::Builder::new()
            .name("voxrelay-pipeline".into())
            .spawn(move || capture::run(ctx));
        self.uplink = Some(uplink);
        if let Err(e) = spawned {
            error!("failed to spawn capture pipeline: {e}");
            self.teardown(SessionState::Error, Some(e.to_string()));
            return;
        }

        if self.config.barge_in_enabled {
            self.spawn_detector();
        }

        info!(session = session.0, native_rate, "session listening");
        self.set_state(SessionState::Listening, None);
    }

    /// One downlink message from the remote side.
    pub fn on_downlink(&mut self, session: SessionId, payload: &[u8]) {
        if session != self.session || !self.state.is_connected() {
            debug!(bytes = payload.len(), "downlink outside a live session dropped");
            return;
        }

        let buffer = decode_downlink(payload, self.config.downlink_sample_rate);
        if buffer.is_empty() {
            return;
        }
        SessionDiagnostics::bump(&self.diagnostics.chunks_received);

        self.set_state(SessionState::Speaking, None);
        if let ScheduleOutcome::Started(_) = self.scheduler.enqueue(buffer) {
            SessionDiagnostics::bump(&self.diagnostics.chunks_played);
        }
    }

    /// Continuation for a voice the device finished playing.
    pub fn on_playback_ended(&mut self, voice: VoiceId) {
        match self.scheduler.on_voice_ended(voice) {
            ScheduleOutcome::Started(_) => {
                SessionDiagnostics::bump(&self.diagnostics.chunks_played);
            }
            ScheduleOutcome::Drained if self.state.is_connected() => {
                self.set_state(SessionState::Listening, None);
            }
            ScheduleOutcome::Stale => {
                debug!(generation = voice.generation, seq = voice.seq, "stale voice ended");
            }
            _ => {}
        }
    }

    /// Cut playback off and tell the remote side. Safe with nothing playing.
    pub fn interrupt(&mut self, source: InterruptSource) -> InterruptEvent {
        let event = self.flush(source);
        if self.state.is_connected() {
            self.set_state(SessionState::Listening, None);
        }
        event
    }

    /// User stop: interrupt and close.
    ///
    /// # Errors
    /// `VoxError::NotActive` if no session is running.
    pub fn stop(&mut self) -> Result<()> {
        if self.teardown(SessionState::Closed, None) {
            Ok(())
        } else {
            Err(VoxError::NotActive)
        }
    }

    /// Release everything the session holds and settle in `final_state`.
    ///
    /// Returns `false` if there was nothing to tear down.
    pub fn teardown(&mut self, final_state: SessionState, detail: Option<String>) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }

        self.flush(InterruptSource::Teardown);
        if let Some(uplink) = self.uplink.take() {
            uplink.close();
        }
        self.window.clear();

        info!(
            session = self.session.0,
            state = ?final_state,
            detail = detail.as_deref().unwrap_or(""),
            "session torn down"
        );
        self.set_state(final_state, detail);
        true
    }

    /// Apply one event.
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TransportOpened { session, uplink } => {
                self.on_transport_open(session, uplink);
            }
            SessionEvent::Downlink { session, payload } => self.on_downlink(session, &payload),
            SessionEvent::PlaybackEnded(voice) => self.on_playback_ended(voice),
            SessionEvent::Interrupt { session, source } => {
                if self.is_live(session) {
                    if source == InterruptSource::BargeIn {
                        SessionDiagnostics::bump(&self.diagnostics.barge_ins);
                    }
                    self.interrupt(source);
                }
            }
            SessionEvent::TransportClosed { session, reason } => {
                if !self.is_live(session) {
                    return;
                }
                match reason {
                    CloseReason::Normal => self.teardown(SessionState::Closed, None),
                    CloseReason::SessionEnded(detail) => {
                        self.teardown(SessionState::Closed, Some(detail))
                    }
                    CloseReason::ServiceUnavailable(detail) => {
                        warn!("relay reported: {detail}");
                        self.teardown(SessionState::Error, Some(SERVICE_UNAVAILABLE.into()))
                    }
                };
            }
            SessionEvent::TransportError { session, detail } => {
                if self.is_live(session) {
                    warn!("transport error: {detail}");
                    self.teardown(SessionState::Error, Some(SERVICE_UNAVAILABLE.into()));
                }
            }
            SessionEvent::DeviceError { detail } => {
                error!("audio device error: {detail}");
                self.teardown(SessionState::Error, Some(detail));
            }
            SessionEvent::Stop => {
                if self.stop().is_err() {
                    debug!("stop requested with no live session");
                }
            }
        }
    }

    /// Process events until the current session reaches a terminal state.
    pub async fn run(&mut self, events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
            if self.state.is_terminal() {
                return;
            }
        }
        self.teardown(SessionState::Closed, None);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<S> {
        &self.scheduler
    }

    /// Sender for posting events into this conversation.
    pub fn events(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_interrupts(&self) -> broadcast::Receiver<InterruptEvent> {
        self.interrupt_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn is_live(&self, session: SessionId) -> bool {
        session == self.session && self.active.load(Ordering::Acquire)
    }

    /// Device opening blocks until the stream thread reports back. On a
    /// multi-threaded runtime the worker hands its other tasks off while it
    /// waits.
    fn open_capture(&mut self, producer: AudioProducer) -> Result<u32> {
        let running = Arc::clone(&self.active);
        let capture = &mut self.capture;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| capture.open(producer, running))
            }
            _ => capture.open(producer, running),
        }
    }

    fn flush(&mut self, source: InterruptSource) -> InterruptEvent {
        let event = self
            .coordinator
            .interrupt(&mut self.scheduler, self.uplink.as_ref(), source);
        SessionDiagnostics::bump(&self.diagnostics.interrupts);
        let _ = self.interrupt_tx.send(event.clone());
        event
    }

    fn spawn_detector(&self) {
        let ctx = runner::DetectorContext {
            detector: BargeInDetector::new(
                self.config.barge_in_sensitivity,
                self.config.interruption_delay,
            ),
            window: self.window.clone(),
            gate: self.scheduler.gate(),
            active: Arc::clone(&self.active),
            epoch: self.coordinator.epoch(),
            cadence: self.config.detector_cadence,
            session: self.session,
            events: self.events_tx.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(runner::run(ctx));
            }
            Err(_) => warn!("no tokio runtime; barge-in detection disabled"),
        }
    }

    fn set_state(&mut self, state: SessionState, detail: Option<String>) {
        if state == self.state && detail.is_none() {
            return;
        }
        self.state = state;
        let _ = self.status_tx.send(SessionStatusEvent { state, detail });
    }
}
