//! Typed audio blocks: framed capture output and normalized playback input.

use std::sync::Arc;

/// One fixed-size block of resampled, quantized microphone audio.
///
/// Produced by [`CaptureFramer`](crate::audio::framer::CaptureFramer) once per
/// full accumulation buffer and sent upstream as a single binary message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFrame {
    /// Position of this frame in the capture stream, starting at 0.
    pub seq: u64,
    /// Mono i16 PCM samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz of `samples` (16 kHz on the wire).
    pub sample_rate: u32,
}

impl CaptureFrame {
    /// Duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True if every sample is exactly zero.
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0)
    }
}

/// A chunk of synthesized speech converted to normalized f32, ready to be
/// handed to a [`PlaybackSink`](crate::playback::PlaybackSink).
///
/// Samples live behind an `Arc` so the sink can keep a reference without
/// copying on the audio thread.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz (24 kHz for downlink audio).
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Normalize signed 16-bit PCM into [-1.0, 1.0) by dividing by 32768.
    pub fn from_pcm16(pcm: &[i16], sample_rate: u32) -> Self {
        let samples: Vec<f32> = pcm.iter().map(|s| *s as f32 / 32768.0).collect();
        Self::new(samples, sample_rate)
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_normalization_bounds() {
        let buf = PlaybackBuffer::from_pcm16(&[i16::MIN, 0, i16::MAX], 24_000);
        assert_eq!(buf.samples[0], -1.0);
        assert_eq!(buf.samples[1], 0.0);
        assert!(buf.samples[2] < 1.0 && buf.samples[2] > 0.999);
    }

    #[test]
    fn tenth_of_a_second_at_24k() {
        let buf = PlaybackBuffer::from_pcm16(&vec![0i16; 2_400], 24_000);
        assert_eq!(buf.duration_secs(), 0.1);
    }

    #[test]
    fn capture_frame_silence() {
        let frame = CaptureFrame {
            seq: 0,
            samples: vec![0; 682],
            sample_rate: 16_000,
        };
        assert!(frame.is_silent());
        assert_eq!(frame.len(), 682);
    }
}
