// Per-session outbound queue.
//
// Room fan-out runs under the room mutex and must never wait on a slow
// socket, so enqueueing is non-blocking. A full queue means the writer has
// fallen behind; the frame is dropped and the owning connection is told to
// shut down, which takes the session out of its room.

use std::sync::Arc;

use flowpresence_common::protocol::ws::WsMessage;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify,
};

/// Frames a session may have queued before it is considered stalled.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Outbound {
    frames: mpsc::Sender<WsMessage>,
    overflow: Arc<Notify>,
}

#[derive(Debug)]
pub struct OutboundReceiver {
    frames: mpsc::Receiver<WsMessage>,
    overflow: Arc<Notify>,
}

/// What the connection writer should do next.
#[derive(Debug, PartialEq)]
pub enum Delivery {
    Frame(WsMessage),
    /// A sender found the queue full. The session should be disconnected.
    Overflowed,
    Closed,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Outbound, OutboundReceiver) {
        let (frames, receiver) = mpsc::channel(capacity);
        let overflow = Arc::new(Notify::new());
        (
            Outbound { frames, overflow: Arc::clone(&overflow) },
            OutboundReceiver { frames: receiver, overflow },
        )
    }

    /// Enqueue without waiting. Returns `false` when the frame was not
    /// accepted.
    pub fn send(&self, message: WsMessage) -> bool {
        match self.frames.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl OutboundReceiver {
    /// Wait for the next frame, preferring an overflow signal over queued
    /// frames.
    pub async fn next(&mut self) -> Delivery {
        tokio::select! {
            biased;
            _ = self.overflow.notified() => Delivery::Overflowed,
            frame = self.frames.recv() => frame.map_or(Delivery::Closed, Delivery::Frame),
        }
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<WsMessage> {
        self.frames.try_recv().ok()
    }
}
