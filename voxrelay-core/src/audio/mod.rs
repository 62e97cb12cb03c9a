//! Audio device adapters (cpal backend) and capture-side DSP.
//!
//! # Design constraints
//!
//! cpal callbacks run on OS audio threads at elevated priority. They **must not**:
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! Capture writes straight into an SPSC ring buffer producer whose
//! `push_slice` is lock-free. Playback receives start/stop commands over a
//! channel drained with `try_recv`, and reports finished voices through a
//! non-blocking callback.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on macOS).
//! Each stream is therefore built, owned and dropped by one dedicated thread
//! that lives until its `running` flag is cleared.

pub mod framer;
#[cfg(feature = "audio-cpal")]
pub mod playback;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};

use crate::{buffering::AudioProducer, error::Result};
#[cfg(feature = "audio-cpal")]
use crate::{buffering::Producer, error::VoxError};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
pub use playback::CpalPlayback;

/// Callback invoked with a human-readable message when a device stream fails
/// after it has been opened.
pub type StreamErrorHook = Arc<dyn Fn(String) + Send + Sync>;

/// A microphone source.
///
/// Implementations push native-rate **mono** f32 samples into `producer` until
/// `running` is cleared, then release the device.
pub trait CaptureBackend: Send + 'static {
    /// Open the device and start capturing.
    ///
    /// Blocks until the device is confirmed open (or fails) and returns the
    /// native sample rate in Hz.
    ///
    /// # Errors
    /// Device-level failures (missing microphone, permission denied, stream
    /// build failure) are fatal for the session.
    fn open(&mut self, producer: AudioProducer, running: Arc<AtomicBool>) -> Result<u32>;
}

/// cpal-backed microphone capture.
#[derive(Clone, Default)]
pub struct CpalCapture {
    preferred_device: Option<String>,
    on_error: Option<StreamErrorHook>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer an input device by exact name, falling back to the default.
    pub fn with_device(mut self, name: Option<String>) -> Self {
        self.preferred_device = name.filter(|n| !n.trim().is_empty());
        self
    }

    /// Report runtime stream failures (device unplugged, etc.).
    pub fn on_stream_error(mut self, hook: StreamErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }
}

impl std::fmt::Debug for CpalCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalCapture")
            .field("preferred_device", &self.preferred_device)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "audio-cpal")]
impl CaptureBackend for CpalCapture {
    fn open(&mut self, producer: AudioProducer, running: Arc<AtomicBool>) -> Result<u32> {
        let preferred = self.preferred_device.clone();
        let on_error = self.on_error.clone();

        // Sync oneshot: the stream thread reports open success/failure.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        std::thread::Builder::new()
            .name("voxrelay-capture".into())
            .spawn(move || {
                let stream = match open_input_stream(
                    producer,
                    Arc::clone(&running),
                    preferred.as_deref(),
                    on_error,
                ) {
                    Ok((stream, rate)) => {
                        let _ = open_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                while running.load(Ordering::Acquire) {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }

                // Stream drops here, releasing the device on its own thread.
                drop(stream);
                info!("capture stream closed");
            })?;

        match open_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(VoxError::AudioStream(
                "capture thread exited before opening the device".into(),
            )),
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl CaptureBackend for CpalCapture {
    fn open(&mut self, _producer: AudioProducer, _running: Arc<AtomicBool>) -> Result<u32> {
        Err(crate::error::VoxError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(feature = "audio-cpal")]
fn open_input_stream(
    producer: AudioProducer,
    running: Arc<AtomicBool>,
    preferred_device_name: Option<&str>,
    on_error: Option<StreamErrorHook>,
) -> Result<(Stream, u32)> {
    use cpal::traits::HostTrait;

    let host = cpal::default_host();

    let preferred = preferred_device_name.and_then(|wanted| {
        let found = host.input_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
        });
        if found.is_none() {
            warn!("preferred input device '{}' not found, falling back", wanted);
        }
        found
    });

    let device = match preferred {
        Some(d) => d,
        None => host
            .default_input_device()
            .ok_or(VoxError::NoDefaultInputDevice)?,
    };

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    let supported = device
        .default_input_config()
        .map_err(|e| VoxError::AudioDevice(e.to_string()))?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();

    info!(sample_rate, channels, "capture config selected");

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let ch = channels as usize;
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config, ch, producer, running, on_error),
        SampleFormat::I16 => build_input::<i16>(&device, &config, ch, producer, running, on_error),
        SampleFormat::U8 => build_input::<u8>(&device, &config, ch, producer, running, on_error),
        fmt => {
            return Err(VoxError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| VoxError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| VoxError::AudioStream(e.to_string()))?;

    Ok((stream, sample_rate))
}

#[cfg(feature = "audio-cpal")]
fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    on_error: Option<StreamErrorHook>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    // Sized generously up front so steady-state callbacks never reallocate.
    let mut mono: Vec<f32> = Vec::with_capacity(16_384);
    device.build_input_stream(
        config,
        move |data: &[T], _info| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            mix_down(data, channels, &mut mono);
            let written = producer.push_slice(&mono);
            if written < mono.len() {
                warn!("ring buffer full: dropped {} frames", mono.len() - written);
            }
        },
        move |err| {
            error!("capture stream error: {err}");
            if let Some(hook) = &on_error {
                hook(err.to_string());
            }
        },
        None,
    )
}

/// Average interleaved channels into mono f32.
#[cfg(feature = "audio-cpal")]
fn mix_down<T>(data: &[T], channels: usize, out: &mut Vec<f32>)
where
    T: Sample,
    f32: FromSample<T>,
{
    let ch = channels.max(1);
    out.clear();
    out.extend(data.chunks_exact(ch).map(|frame| {
        let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
        sum / ch as f32
    }));
}
