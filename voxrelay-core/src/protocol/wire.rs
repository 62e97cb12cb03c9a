//! Wire format shared by the talk client and the relay.
//!
//! | Direction | Frame | Payload |
//! |-----------|-------|---------|
//! | client → relay | binary | one capture frame, i16 LE, 16 kHz mono |
//! | client → relay | text or short binary | `{"type":"interrupt"}` |
//! | relay → client | binary | one downlink chunk, i16 LE, 24 kHz mono |
//!
//! ## Control sniffing
//!
//! Older clients send control JSON as *binary* frames. A binary frame shorter
//! than [`CONTROL_SNIFF_LIMIT`] bytes whose first byte is `{` is parsed as
//! JSON; if that fails the frame is dropped, never forwarded as audio.
//!
//! Known limitation: a short audio frame whose first sample's low byte is
//! `0x7B` is indistinguishable from control by this heuristic. Capture frames
//! are ≥ 341 samples (682 bytes) for every common capture rate, so the
//! client's own frames never hit it.

use serde::{Deserialize, Serialize};

use crate::buffering::chunk::PlaybackBuffer;

/// Binary frames at or above this size are always audio.
pub const CONTROL_SNIFF_LIMIT: usize = 200;

/// Out-of-band control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Playback was interrupted locally; the remote side should stop generating.
    Interrupt,
}

impl ControlMessage {
    pub fn to_json(&self) -> String {
        match self {
            ControlMessage::Interrupt => r#"{"type":"interrupt"}"#.to_string(),
        }
    }
}

/// Classification of one inbound client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame<'a> {
    Audio(&'a [u8]),
    Control(ControlMessage),
    /// Looked like control but did not parse. Drop it.
    Malformed(String),
}

/// Classify a binary frame using the size + leading-brace heuristic.
pub fn classify_binary(payload: &[u8], sniff_limit: usize) -> InboundFrame<'_> {
    if payload.len() < sniff_limit && payload.first() == Some(&b'{') {
        return parse_control(payload);
    }
    InboundFrame::Audio(payload)
}

/// Text frames are always control.
pub fn classify_text(text: &str) -> InboundFrame<'_> {
    parse_control(text.as_bytes())
}

fn parse_control(raw: &[u8]) -> InboundFrame<'static> {
    match serde_json::from_slice::<ControlMessage>(raw) {
        Ok(msg) => InboundFrame::Control(msg),
        Err(e) => InboundFrame::Malformed(e.to_string()),
    }
}

/// Serialize i16 samples as little-endian bytes.
pub fn encode_pcm16_le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Parse little-endian i16 samples. A trailing odd byte is ignored.
pub fn decode_pcm16_le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Turn a downlink binary frame into a normalized playback buffer.
pub fn decode_downlink(bytes: &[u8], sample_rate: u32) -> PlaybackBuffer {
    PlaybackBuffer::from_pcm16(&decode_pcm16_le(bytes), sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_serializes_to_documented_shape() {
        let json = serde_json::to_string(&ControlMessage::Interrupt).unwrap();
        assert_eq!(json, r#"{"type":"interrupt"}"#);
        assert_eq!(ControlMessage::Interrupt.to_json(), json);
    }

    #[test]
    fn short_brace_frame_is_control() {
        let frame = br#"{"type":"interrupt"}"#;
        assert_eq!(
            classify_binary(frame, CONTROL_SNIFF_LIMIT),
            InboundFrame::Control(ControlMessage::Interrupt)
        );
    }

    #[test]
    fn malformed_json_is_not_audio() {
        let frame = b"{not json";
        assert!(matches!(
            classify_binary(frame, CONTROL_SNIFF_LIMIT),
            InboundFrame::Malformed(_)
        ));
    }

    #[test]
    fn unknown_control_type_is_malformed() {
        assert!(matches!(
            classify_text(r#"{"type":"resume"}"#),
            InboundFrame::Malformed(_)
        ));
    }

    #[test]
    fn long_frame_starting_with_brace_is_audio() {
        let mut frame = vec![0u8; 682];
        frame[0] = b'{';
        assert!(matches!(
            classify_binary(&frame, CONTROL_SNIFF_LIMIT),
            InboundFrame::Audio(_)
        ));
    }

    #[test]
    fn short_frame_without_brace_is_audio() {
        let frame = [1u8, 2, 3, 4];
        assert_eq!(
            classify_binary(&frame, CONTROL_SNIFF_LIMIT),
            InboundFrame::Audio(&frame[..])
        );
    }

    #[test]
    fn pcm_is_little_endian() {
        assert_eq!(encode_pcm16_le(&[1, -2]), vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(decode_pcm16_le(&[0x01, 0x00, 0xFE, 0xFF, 0x7F]), vec![1, -2]);
    }

    #[test]
    fn downlink_chunk_duration() {
        let bytes = vec![0u8; 4_800];
        let buf = decode_downlink(&bytes, 24_000);
        assert_eq!(buf.len(), 2_400);
        assert_eq!(buf.duration_secs(), 0.1);
    }
}
