//! In-process `FrameTransport` pair, used to run both ends of a datagram
//! connection without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::transport::{FrameTransport, SendOutcome};
use crate::error::DatagramError;

pub struct MemoryFrameTransport {
    peer_tx: UnboundedSender<Bytes>,
    rx: Mutex<UnboundedReceiver<Bytes>>,
    max_datagram_size: usize,
    blocked: AtomicBool,
    // shared by both ends, closing one side resets the pair
    closed: CancellationToken,
}

/// Create two connected transports. Frames larger than `max_datagram_size`
/// are refused with `SendOutcome::Blocked`, like an undersized path MTU.
pub fn memory_transport_pair(
    max_datagram_size: usize,
) -> (Arc<MemoryFrameTransport>, Arc<MemoryFrameTransport>) {
    let (a_tx, a_rx) = unbounded_channel();
    let (b_tx, b_rx) = unbounded_channel();
    let closed = CancellationToken::new();
    let a = MemoryFrameTransport {
        peer_tx: b_tx,
        rx: Mutex::new(a_rx),
        max_datagram_size,
        blocked: AtomicBool::new(false),
        closed: closed.clone(),
    };
    let b = MemoryFrameTransport {
        peer_tx: a_tx,
        rx: Mutex::new(b_rx),
        max_datagram_size,
        blocked: AtomicBool::new(false),
        closed,
    };
    (Arc::new(a), Arc::new(b))
}

impl MemoryFrameTransport {
    /// Simulate congestion: while blocked every send attempt is refused.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }
}

#[async_trait]
impl FrameTransport for MemoryFrameTransport {
    fn try_send_frame(&self, frame: &Bytes) -> Result<SendOutcome, DatagramError> {
        if self.closed.is_cancelled() {
            return Err(DatagramError::closed("memory transport closed"));
        }
        if self.blocked.load(Ordering::SeqCst) || frame.len() > self.max_datagram_size {
            return Ok(SendOutcome::Blocked);
        }
        self.peer_tx
            .send(frame.clone())
            .map_err(|_| DatagramError::closed("memory transport peer dropped"))?;
        Ok(SendOutcome::Sent)
    }

    async fn receive_frame(&self) -> Result<Bytes, DatagramError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(DatagramError::closed("memory transport closed")),
            frame = rx.recv() => {
                frame.ok_or_else(|| DatagramError::closed("memory transport peer dropped"))
            }
        }
    }

    fn max_datagram_size(&self) -> Option<usize> {
        Some(self.max_datagram_size)
    }

    fn close_transport(&self, _reason: &str) {
        self.closed.cancel();
    }
}
