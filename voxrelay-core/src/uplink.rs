//! Uplink transport adapter.
//!
//! Capture frames and control messages are queued, in production order, on an
//! unbounded channel drained by whichever task owns the real transport
//! (a WebSocket writer in the app). Sending never blocks, so the capture
//! pipeline thread can call it directly.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    buffering::chunk::CaptureFrame,
    protocol::wire::{encode_pcm16_le, ControlMessage},
};

/// One message for the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Binary frame: one capture frame as i16 LE.
    Audio(Vec<u8>),
    /// Text frame: JSON control message.
    Control(String),
    /// Close the transport after everything queued before it.
    Close,
}

/// Cloneable sending half of the uplink.
#[derive(Debug, Clone)]
pub struct Uplink {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    closed: Arc<AtomicBool>,
}

impl Uplink {
    /// Create an uplink and the receiver the transport writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Queue one capture frame. Returns `false` once the uplink is closed.
    pub fn send_frame(&self, frame: &CaptureFrame) -> bool {
        trace!(seq = frame.seq, samples = frame.len(), "uplink frame");
        self.send(OutboundFrame::Audio(encode_pcm16_le(&frame.samples)))
    }

    pub fn send_control(&self, msg: ControlMessage) -> bool {
        self.send(OutboundFrame::Control(msg.to_json()))
    }

    /// Tell the remote side playback was interrupted locally.
    pub fn send_interrupt(&self) -> bool {
        self.send_control(ControlMessage::Interrupt)
    }

    /// Queue a close. Everything sent before it is still delivered; anything
    /// after it is refused. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(OutboundFrame::Close);
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn send(&self, frame: OutboundFrame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(frame).is_ok()
    }
}
