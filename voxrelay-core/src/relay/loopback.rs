//! Credential-free stand-in for the AI service.
//!
//! Buffers what the user says and, once they pause, plays it back as 24 kHz
//! downlink chunks. An interrupt throws away whatever has not been echoed
//! yet. Enough to run the relay and talk client end to end.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{RemoteEvent, RemoteSession};
use crate::{
    audio::framer::{dequantize_sample, quantize_pcm16, resample_linear, UPLINK_SAMPLE_RATE},
    error::{Result, VoxError},
    playback::DOWNLINK_SAMPLE_RATE,
    protocol::wire::{decode_pcm16_le, encode_pcm16_le},
};

/// Frames with a peak above this count as speech (~0.02 full scale).
const SPEECH_PEAK: i16 = 655;

/// Echoed audio is split into chunks of this many downlink samples (100 ms).
const ECHO_CHUNK: usize = DOWNLINK_SAMPLE_RATE as usize / 10;

/// Longest utterance held before it is echoed regardless of pauses.
const MAX_UTTERANCE: usize = DOWNLINK_SAMPLE_RATE as usize * 15;

#[derive(Debug)]
pub struct LoopbackSession {
    events: mpsc::UnboundedSender<RemoteEvent>,
    connected: bool,
    /// Speech heard so far, already at the downlink rate.
    utterance: Vec<i16>,
    base64: bool,
}

impl LoopbackSession {
    /// Open a session; remote events arrive on the returned receiver.
    ///
    /// With `base64` set, downlink audio is delivered as
    /// [`RemoteEvent::AudioBase64`] the way hosted speech APIs send it.
    pub fn connect(base64: bool) -> (Self, mpsc::UnboundedReceiver<RemoteEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        info!(base64, "loopback session connected");
        (
            Self {
                events,
                connected: true,
                utterance: Vec::new(),
                base64,
            },
            rx,
        )
    }

    /// Samples waiting to be echoed.
    pub fn pending(&self) -> usize {
        self.utterance.len()
    }

    fn echo(&mut self) {
        let utterance = std::mem::take(&mut self.utterance);
        debug!(samples = utterance.len(), "echoing utterance");
        for chunk in utterance.chunks(ECHO_CHUNK) {
            let pcm = encode_pcm16_le(chunk);
            let event = if self.base64 {
                RemoteEvent::AudioBase64(STANDARD.encode(pcm))
            } else {
                RemoteEvent::Audio(pcm)
            };
            if self.events.send(event).is_err() {
                return;
            }
        }
    }
}

impl RemoteSession for LoopbackSession {
    fn send_audio(&mut self, pcm: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(VoxError::RemoteSession("loopback session closed".into()));
        }

        let samples = decode_pcm16_le(pcm);
        let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);

        if peak > SPEECH_PEAK.unsigned_abs() {
            let normalized: Vec<f32> = samples.iter().map(|&s| dequantize_sample(s)).collect();
            let upsampled = resample_linear(&normalized, UPLINK_SAMPLE_RATE, DOWNLINK_SAMPLE_RATE);
            self.utterance.extend(quantize_pcm16(&upsampled));
            if self.utterance.len() >= MAX_UTTERANCE {
                self.echo();
            }
        } else if !self.utterance.is_empty() {
            self.echo();
        }
        Ok(())
    }

    fn send_interrupt(&mut self) -> Result<()> {
        if !self.utterance.is_empty() {
            debug!(dropped = self.utterance.len(), "loopback echo interrupted");
        }
        self.utterance.clear();
        Ok(())
    }

    fn close(&mut self) {
        if self.connected {
            self.connected = false;
            self.utterance.clear();
            let _ = self.events.send(RemoteEvent::Closed);
            info!("loopback session closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: i16) -> Vec<u8> {
        encode_pcm16_le(&vec![value; 341])
    }

    #[test]
    fn speech_is_echoed_after_a_pause() {
        let (mut session, mut rx) = LoopbackSession::connect(false);
        for _ in 0..10 {
            session.send_audio(&frame(8_000)).unwrap();
        }
        assert!(rx.try_recv().is_err());
        assert!(session.pending() > 0);

        session.send_audio(&frame(0)).unwrap();
        let mut echoed = 0;
        while let Ok(RemoteEvent::Audio(pcm)) = rx.try_recv() {
            assert!(pcm.len() <= ECHO_CHUNK * 2);
            echoed += pcm.len() / 2;
        }
        // Each 341-sample uplink frame upsamples to 511 downlink samples.
        assert_eq!(echoed, 5_110);
        assert_eq!(session.pending(), 0);
    }

    #[test]
    fn interrupt_drops_pending_echo() {
        let (mut session, mut rx) = LoopbackSession::connect(false);
        session.send_audio(&frame(8_000)).unwrap();
        session.send_interrupt().unwrap();
        session.send_audio(&frame(0)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn base64_mode_encodes_chunks() {
        let (mut session, mut rx) = LoopbackSession::connect(true);
        session.send_audio(&frame(-8_000)).unwrap();
        session.send_audio(&frame(0)).unwrap();
        match rx.try_recv() {
            Ok(RemoteEvent::AudioBase64(text)) => {
                let pcm = STANDARD.decode(text).unwrap();
                assert_eq!(decode_pcm16_le(&pcm)[0], -8_000);
            }
            other => panic!("expected base64 audio, got {other:?}"),
        }
    }

    #[test]
    fn close_reports_once_and_refuses_audio() {
        let (mut session, mut rx) = LoopbackSession::connect(false);
        session.close();
        session.close();
        assert_eq!(rx.try_recv().unwrap(), RemoteEvent::Closed);
        assert!(rx.try_recv().is_err());
        assert!(session.send_audio(&frame(8_000)).is_err());
    }
}
