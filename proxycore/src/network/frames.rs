use bytes::BytesMut;
use proxycore_cql::frame::{Frame, FrameDirection};
use tokio::sync::mpsc;
use tracing::trace;

use super::connection::Receiver;
use crate::errors::{CallbackError, ConnectionError};

/// A [`Receiver`] that cuts inbound bytes into response frames and hands
/// them to the paired [`InboundFrames`].
///
/// Partial frames stay buffered until the rest arrives. A frame with a bad
/// header breaks the connection.
pub struct FrameReceiver {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

impl FrameReceiver {
    pub fn new() -> (FrameReceiver, InboundFrames) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FrameReceiver { tx: Some(tx) }, InboundFrames { rx })
    }
}

impl Receiver for FrameReceiver {
    fn receive(&mut self, source: &mut BytesMut) -> Result<(), CallbackError> {
        while let Some(frame) = Frame::decode(source, FrameDirection::Response)? {
            trace!(
                "Decoded frame: opcode {:#04x}, stream {}, {} bytes",
                frame.opcode,
                frame.params.stream,
                frame.body.len()
            );
            if let Some(tx) = &self.tx {
                // Nobody listening any more is fine, frames are just dropped.
                let _ = tx.send(frame);
            }
        }
        Ok(())
    }

    fn closing(&mut self, _error: Option<&ConnectionError>) {
        self.tx = None;
    }
}

/// Frames decoded by a [`FrameReceiver`], in arrival order.
#[derive(Debug)]
pub struct InboundFrames {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl InboundFrames {
    /// The next frame, or `None` once the connection has terminated and
    /// every frame received before that has been returned.
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Drops every frame that has already arrived and returns how many
    /// there were.
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}
