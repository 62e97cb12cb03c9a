//! Rolling time-domain window of the most recent microphone samples.
//!
//! The capture pipeline thread writes into it; the barge-in detector reads
//! the peak on its own cadence. Both sides only hold the lock for a copy or
//! a linear scan of `capacity` samples, never from the audio callback.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
struct Ring {
    samples: Vec<f32>,
    head: usize,
    filled: usize,
}

/// Shared, fixed-capacity analysis window. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AnalysisWindow {
    inner: Arc<Mutex<Ring>>,
    capacity: usize,
}

impl AnalysisWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(Ring {
                samples: vec![0.0; capacity],
                head: 0,
                filled: 0,
            })),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append samples, overwriting the oldest once full.
    pub fn push(&self, samples: &[f32]) {
        // Only the tail that can still be visible matters.
        let tail = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };

        let mut ring = self.inner.lock();
        for &s in tail {
            let head = ring.head;
            ring.samples[head] = s;
            ring.head = (head + 1) % self.capacity;
        }
        ring.filled = (ring.filled + tail.len()).min(self.capacity);
    }

    /// Maximum absolute amplitude over the samples currently in the window.
    ///
    /// An empty window reads as silence.
    pub fn peak(&self) -> f32 {
        let ring = self.inner.lock();
        // Until the ring wraps, valid samples are exactly `[..filled]`.
        peak_abs(&ring.samples[..ring.filled])
    }

    /// Copy the window out in chronological order.
    pub fn snapshot(&self) -> Vec<f32> {
        let ring = self.inner.lock();
        if ring.filled < self.capacity {
            return ring.samples[..ring.filled].to_vec();
        }
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&ring.samples[ring.head..]);
        out.extend_from_slice(&ring.samples[..ring.head]);
        out
    }

    /// Forget everything; the next peak reads as silence.
    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.samples.fill(0.0);
        ring.head = 0;
        ring.filled = 0;
    }
}

/// Maximum absolute deviation from zero.
pub fn peak_abs(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_is_silent() {
        let w = AnalysisWindow::new(8);
        assert_eq!(w.peak(), 0.0);
        assert!(w.snapshot().is_empty());
    }

    #[test]
    fn peak_tracks_negative_excursions() {
        let w = AnalysisWindow::new(8);
        w.push(&[0.01, -0.3, 0.2]);
        assert_eq!(w.peak(), 0.3);
    }

    #[test]
    fn old_samples_fall_out() {
        let w = AnalysisWindow::new(4);
        w.push(&[0.9]);
        w.push(&[0.0, 0.0, 0.0, 0.01]);
        assert_eq!(w.peak(), 0.01);
        assert_eq!(w.snapshot(), vec![0.0, 0.0, 0.0, 0.01]);
    }

    #[test]
    fn oversized_push_keeps_latest_tail() {
        let w = AnalysisWindow::new(3);
        w.push(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(w.snapshot(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn clear_resets() {
        let w = AnalysisWindow::new(3);
        w.push(&[0.5, 0.5]);
        w.clear();
        assert_eq!(w.peak(), 0.0);
    }
}
