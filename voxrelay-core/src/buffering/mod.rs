//! Lock-free SPSC ring buffer for captured samples, plus the typed blocks
//! that flow through the rest of the engine.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod chunk;
pub mod window;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Written by the capture device callback.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Drained by the capture pipeline thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^18 = 262 144 f32 samples ≈ 5.4 s at 48 kHz.
/// The pipeline drains every few milliseconds, so this only absorbs
/// scheduler hiccups on the pipeline thread.
pub const RING_CAPACITY: usize = 1 << 18;

/// Fresh ring for one session's microphone stream.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
