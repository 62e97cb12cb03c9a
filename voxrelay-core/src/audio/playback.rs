//! cpal output stream acting as a scheduled-playback [`PlaybackSink`].
//!
//! The device clock is the number of frames the output callback has rendered.
//! Voices are started at absolute frame positions and mixed in the callback;
//! once a voice's last frame falls within the next callback period its
//! [`VoiceId`] is handed to the `on_ended` hook, which is how the scheduler
//! learns to start the next chunk in time to butt it against the previous one.
//!
//! Downlink audio is 24 kHz mono, but output devices usually are not. Buffers
//! are resampled to the device rate in [`PlaybackSink::start`] (caller thread)
//! and duplicated across all output channels in the callback.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use super::{framer::resample_linear, StreamErrorHook};
use crate::{
    buffering::chunk::PlaybackBuffer,
    error::{Result, VoxError},
    playback::{PlaybackSink, VoiceId},
};

/// Called from the output callback when a voice finishes on its own.
/// Must not block.
pub type VoiceEndedHook = Arc<dyn Fn(VoiceId) + Send + Sync>;

enum SinkCommand {
    Start {
        voice: VoiceId,
        start_frame: u64,
        samples: Arc<[f32]>,
    },
    Stop(VoiceId),
    StopAll,
}

struct ActiveVoice {
    voice: VoiceId,
    start_frame: u64,
    samples: Arc<[f32]>,
    reported: bool,
}

impl ActiveVoice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Handle to the output device. `Send`; the `cpal::Stream` itself lives on a
/// dedicated thread.
pub struct CpalPlayback {
    commands: Sender<SinkCommand>,
    frames_rendered: Arc<AtomicU64>,
    sample_rate: u32,
    running: Arc<AtomicBool>,
}

impl CpalPlayback {
    /// Open the default (or preferred) output device.
    ///
    /// # Errors
    /// `VoxError::NoDefaultOutputDevice` / `VoxError::AudioStream` on device failure.
    pub fn open(
        preferred_device: Option<String>,
        on_ended: VoiceEndedHook,
        on_error: Option<StreamErrorHook>,
    ) -> Result<Self> {
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let clock = Arc::clone(&frames_rendered);
        let thread_running = Arc::clone(&running);
        std::thread::Builder::new()
            .name("voxrelay-playback".into())
            .spawn(move || {
                let stream = match open_output_stream(
                    preferred_device.as_deref(),
                    command_rx,
                    clock,
                    on_ended,
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

                while thread_running.load(Ordering::Acquire) {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }

                drop(stream);
                info!("playback stream closed");
            })?;

        let sample_rate = match open_rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                return Err(VoxError::AudioStream(
                    "playback thread exited before opening the device".into(),
                ))
            }
        };

        Ok(Self {
            commands,
            frames_rendered,
            sample_rate,
            running,
        })
    }

    /// Device output rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Silence everything currently playing or scheduled.
    pub fn stop_all(&self) {
        let _ = self.commands.send(SinkCommand::StopAll);
    }

    /// Release the device. Idempotent; also runs on drop.
    pub fn close(&self) {
        self.stop_all();
        self.running.store(false, Ordering::Release);
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

impl PlaybackSink for CpalPlayback {
    fn current_time(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn start(&mut self, voice: VoiceId, buffer: PlaybackBuffer, at: f64) {
        let samples: Arc<[f32]> = if buffer.sample_rate == self.sample_rate {
            Arc::clone(&buffer.samples)
        } else {
            resample_linear(&buffer.samples, buffer.sample_rate, self.sample_rate).into()
        };
        let start_frame = (at * self.sample_rate as f64).round().max(0.0) as u64;

        if self
            .commands
            .send(SinkCommand::Start {
                voice,
                start_frame,
                samples,
            })
            .is_err()
        {
            warn!(seq = voice.seq, "playback stream is gone; chunk dropped");
        }
    }

    fn stop(&mut self, voice: VoiceId) {
        let _ = self.commands.send(SinkCommand::Stop(voice));
    }
}

fn open_output_stream(
    preferred_device_name: Option<&str>,
    commands: Receiver<SinkCommand>,
    clock: Arc<AtomicU64>,
    on_ended: VoiceEndedHook,
    on_error: Option<StreamErrorHook>,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();

    let preferred = preferred_device_name.and_then(|wanted| {
        let found = host.output_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
        });
        if found.is_none() {
            warn!("preferred output device '{}' not found, falling back", wanted);
        }
        found
    });

    let device = match preferred {
        Some(d) => d,
        None => host
            .default_output_device()
            .ok_or(VoxError::NoDefaultOutputDevice)?,
    };

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let supported = device
        .default_output_config()
        .map_err(|e| VoxError::AudioDevice(e.to_string()))?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    info!(sample_rate, channels, "playback config selected");

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let ch = channels as usize;
    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            build_output::<f32>(&device, &config, ch, commands, clock, on_ended, on_error)
        }
        SampleFormat::I16 => {
            build_output::<i16>(&device, &config, ch, commands, clock, on_ended, on_error)
        }
        SampleFormat::U16 => {
            build_output::<u16>(&device, &config, ch, commands, clock, on_ended, on_error)
        }
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

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    commands: Receiver<SinkCommand>,
    clock: Arc<AtomicU64>,
    on_ended: VoiceEndedHook,
    on_error: Option<StreamErrorHook>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let ch = channels.max(1);
    let mut mixer = Mixer::new(clock);

    device.build_output_stream(
        config,
        move |data: &mut [T], _info| {
            while let Ok(cmd) = commands.try_recv() {
                mixer.apply(cmd);
            }
            mixer.render_period(data, ch, |voice| on_ended(voice));
        },
        move |err| {
            error!("playback stream error: {err}");
            if let Some(hook) = &on_error {
                hook(err.to_string());
            }
        },
        None,
    )
}

/// Output callback state: the voices on the device and its frame clock.
///
/// A voice is reported ended one period early, while its tail is still
/// queued for the next callback. The scheduler's follow-up `Start` then lands
/// exactly on the previous voice's end frame instead of after the period in
/// which it finished.
struct Mixer {
    voices: Vec<ActiveVoice>,
    clock: Arc<AtomicU64>,
}

impl Mixer {
    fn new(clock: Arc<AtomicU64>) -> Self {
        Self {
            voices: Vec::with_capacity(16),
            clock,
        }
    }

    fn apply(&mut self, cmd: SinkCommand) {
        let base = self.clock.load(Ordering::Relaxed);
        match cmd {
            SinkCommand::Start {
                voice,
                start_frame,
                samples,
            } => self.voices.push(ActiveVoice {
                voice,
                // A start that arrives late is delayed, never truncated.
                start_frame: start_frame.max(base),
                samples,
                reported: false,
            }),
            // Also drops an early-reported tail from the same generation.
            SinkCommand::Stop(voice) => self
                .voices
                .retain(|v| v.voice.generation != voice.generation),
            SinkCommand::StopAll => self.voices.clear(),
        }
    }

    /// Fill one device period, advance the clock and report every voice that
    /// ends before the next period is over.
    fn render_period<T>(
        &mut self,
        data: &mut [T],
        channels: usize,
        mut ended: impl FnMut(VoiceId),
    ) where
        T: Sample + FromSample<f32>,
    {
        let base = self.clock.load(Ordering::Relaxed);
        render(data, channels, base, &self.voices);

        let period = (data.len() / channels) as u64;
        let end = base + period;
        self.clock.store(end, Ordering::Release);

        for v in self.voices.iter_mut() {
            if !v.reported && v.end_frame() <= end + period {
                v.reported = true;
                ended(v.voice);
            }
        }
        self.voices.retain(|v| v.end_frame() > end);
    }
}

/// Mix `voices` into interleaved `data` starting at absolute frame `base`.
fn render<T>(data: &mut [T], channels: usize, base: u64, voices: &[ActiveVoice])
where
    T: Sample + FromSample<f32>,
{
    for (i, frame) in data.chunks_exact_mut(channels).enumerate() {
        let t = base + i as u64;
        let mut mix = 0.0f32;
        for v in voices {
            if t >= v.start_frame {
                if let Some(s) = v.samples.get((t - v.start_frame) as usize) {
                    mix += *s;
                }
            }
        }
        frame.fill(T::from_sample(mix.clamp(-1.0, 1.0)));
    }
}
