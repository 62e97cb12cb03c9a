//! Capture-side framing: accumulate native-rate samples, resample to the
//! uplink rate, quantize to i16 and emit fixed-size frames.
//!
//! ## Design
//!
//! The capture device delivers callbacks of whatever size it likes. The
//! framer owns one accumulation buffer of exactly `buffer_size` samples and a
//! write cursor. Only a *full* buffer is resampled and emitted, so every frame
//! sent upstream has the same length and added latency is bounded by one
//! buffer period (~43 ms at 24 kHz capture). Residual samples stay in the
//! buffer across calls.
//!
//! Resampling is plain linear interpolation. When capture rate == target rate
//! the buffer passes through untouched.
//!
//! ```ignore
//! let mut framer = CaptureFramer::new(24_000, 16_000, 1024);
//! framer.push(&mic_samples, |frame| uplink.send_frame(&frame));
//! ```

use tracing::debug;

use crate::buffering::chunk::CaptureFrame;

/// Native samples accumulated per emitted frame.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Uplink sample rate expected by the remote session.
pub const UPLINK_SAMPLE_RATE: u32 = 16_000;

/// Accumulates native-rate f32 samples into fixed-size 16-bit frames.
pub struct CaptureFramer {
    buffer: Vec<f32>,
    cursor: usize,
    native_rate: u32,
    target_rate: u32,
    next_seq: u64,
}

impl CaptureFramer {
    /// Create a framer.
    ///
    /// # Parameters
    /// - `native_rate`: capture device sample rate (Hz).
    /// - `target_rate`: uplink sample rate (Hz), normally [`UPLINK_SAMPLE_RATE`].
    /// - `buffer_size`: native samples per frame, normally [`DEFAULT_BUFFER_SIZE`].
    pub fn new(native_rate: u32, target_rate: u32, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        debug!(
            native_rate,
            target_rate,
            buffer_size,
            frame_len = resampled_len(buffer_size, native_rate, target_rate),
            "capture framer configured"
        );
        Self {
            buffer: vec![0.0; buffer_size],
            cursor: 0,
            native_rate,
            target_rate,
            next_seq: 0,
        }
    }

    /// Push native-rate samples; `emit` is called once per completed frame,
    /// in capture order.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(CaptureFrame)) {
        let mut rest = samples;
        while !rest.is_empty() {
            let room = self.buffer.len() - self.cursor;
            let take = room.min(rest.len());
            self.buffer[self.cursor..self.cursor + take].copy_from_slice(&rest[..take]);
            self.cursor += take;
            rest = &rest[take..];

            if self.cursor == self.buffer.len() {
                let resampled = resample_linear(&self.buffer, self.native_rate, self.target_rate);
                let frame = CaptureFrame {
                    seq: self.next_seq,
                    samples: quantize_pcm16(&resampled),
                    sample_rate: self.target_rate,
                };
                self.next_seq += 1;
                self.cursor = 0;
                emit(frame);
            }
        }
    }

    /// Convenience wrapper around [`push`](Self::push) that collects frames.
    pub fn push_collect(&mut self, samples: &[f32]) -> Vec<CaptureFrame> {
        let mut frames = Vec::new();
        self.push(samples, |f| frames.push(f));
        frames
    }

    /// Samples of each emitted frame after resampling.
    pub fn frame_len(&self) -> usize {
        resampled_len(self.buffer.len(), self.native_rate, self.target_rate)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Native samples waiting for the current buffer to fill.
    pub fn pending(&self) -> usize {
        self.cursor
    }

    /// Frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.next_seq
    }

    /// Returns `true` when capture rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.native_rate == self.target_rate
    }

    /// Drop any partial buffer and restart sequence numbering.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.next_seq = 0;
    }
}

/// Output length of [`resample_linear`] for an input of `len` samples.
pub fn resampled_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return len;
    }
    let ratio = from_rate as f64 / to_rate as f64;
    (len as f64 / ratio).floor() as usize
}

/// Linear-interpolation resampler.
///
/// Output index `i` reads fractional source position `i * from/to`, blending
/// the floor and ceil neighbours. A missing ceil neighbour (last sample)
/// falls back to the floor sample.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }
    if input.is_empty() {
        return Vec::new();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = resampled_len(input.len(), from_rate, to_rate);
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let index = (pos.floor() as usize).min(last);
            let fraction = (pos - index as f64) as f32;
            let p1 = input[index];
            let p2 = input.get(index + 1).copied().unwrap_or(p1);
            p1 + (p2 - p1) * fraction
        })
        .collect()
}

/// Clamp to [-1, 1] and scale to i16: negatives by 32768, positives by 32767.
#[inline]
pub fn quantize_sample(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Inverse of [`quantize_sample`], up to one quantization step.
#[inline]
pub fn dequantize_sample(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

pub fn quantize_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|s| quantize_sample(*s)).collect()
}
