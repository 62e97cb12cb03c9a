//! Barge-in detection: notice the user talking over AI playback.
//!
//! ## Algorithm
//!
//! Evaluated once per tick (~60 Hz) while the session is active:
//!
//! 1. If an interruption timer is pending and its deadline has passed → fire.
//! 2. If playback is not active → nothing else to do this tick.
//! 3. Compute the peak absolute amplitude of the latest microphone window.
//! 4. Peak above `sensitivity` and no timer pending → arm a timer for
//!    `delay` from now.
//! 5. Peak at or below `sensitivity` with a timer pending → cancel it.
//!
//! A single click arms and then cancels the timer; only loudness sustained
//! for the whole delay reaches step 1.
//!
//! The detector itself is a pure state machine over an injected clock; the
//! async loop that drives it lives in [`runner`].

pub mod runner;

use std::time::Duration;

use tokio::time::Instant;

/// Peak amplitude above which the microphone counts as "user speaking".
pub const DEFAULT_SENSITIVITY: f32 = 0.02;

/// Loudness must persist this long before playback is interrupted.
pub const DEFAULT_INTERRUPTION_DELAY: Duration = Duration::from_millis(200);

/// Outcome of one detector tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInDecision {
    /// Playback inactive; loudness not examined.
    Idle,
    /// Below threshold, nothing pending.
    Quiet,
    /// Crossed the threshold; timer armed.
    Armed,
    /// Still loud; timer keeps running.
    Holding,
    /// Dropped below threshold before the delay; timer cancelled.
    Cancelled,
    /// Sustained loudness: interrupt now.
    Fire,
}

/// Hysteresis state for barge-in.
#[derive(Debug, Clone)]
pub struct BargeInDetector {
    sensitivity: f32,
    delay: Duration,
    armed_at: Option<Instant>,
}

impl BargeInDetector {
    pub fn new(sensitivity: f32, delay: Duration) -> Self {
        Self {
            sensitivity,
            delay,
            armed_at: None,
        }
    }

    /// Run one tick.
    ///
    /// `peak` is only evaluated when playback is active, so callers can pass a
    /// closure that locks the analysis window.
    pub fn tick(
        &mut self,
        now: Instant,
        playback_active: bool,
        peak: impl FnOnce() -> f32,
    ) -> BargeInDecision {
        if let Some(deadline) = self.deadline() {
            if now >= deadline {
                self.armed_at = None;
                return BargeInDecision::Fire;
            }
        }

        if !playback_active {
            return BargeInDecision::Idle;
        }

        if peak() > self.sensitivity {
            if self.armed_at.is_none() {
                self.armed_at = Some(now);
                BargeInDecision::Armed
            } else {
                BargeInDecision::Holding
            }
        } else if self.armed_at.take().is_some() {
            BargeInDecision::Cancelled
        } else {
            BargeInDecision::Quiet
        }
    }

    /// When the pending timer fires, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.armed_at.map(|t| t + self.delay)
    }

    pub fn is_pending(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Drop a pending timer. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.armed_at.take().is_some()
    }

    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for BargeInDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVITY, DEFAULT_INTERRUPTION_DELAY)
    }
}
