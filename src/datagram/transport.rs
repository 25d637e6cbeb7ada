//! Seams between the datagram layer and the connection it rides on.
//!
//! `FrameTransport` is what the queue pumps need from the underlying secure
//! connection: a non-blocking attempt to put one frame on the wire, a way to
//! wait for the next inbound frame and the current datagram size limit.
//! `DatagramTransport` is what the session layer needs from a connection that
//! already does flow control: blocking submission and cancellable receive.

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::DatagramError;

/// Result of handing one frame to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The frame could not be written right now; it stays pending and will
    /// be offered again.
    Blocked,
}

#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    fn try_send_frame(&self, frame: &Bytes) -> Result<SendOutcome, DatagramError>;

    async fn receive_frame(&self) -> Result<Bytes, DatagramError>;

    /// `None` if the peer did not negotiate datagrams.
    fn max_datagram_size(&self) -> Option<usize>;

    fn close_transport(&self, reason: &str);
}

#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    /// Submit one datagram, waiting until the connection's writer took it.
    async fn send_datagram(&self, data: Bytes) -> Result<(), DatagramError>;

    async fn receive_datagram(&self, cancel: &CancellationToken) -> Result<Bytes, DatagramError>;

    fn max_datagram_size(&self) -> usize;

    fn close_with_error(&self, err: DatagramError);
}

#[async_trait]
impl FrameTransport for quinn::Connection {
    fn try_send_frame(&self, frame: &Bytes) -> Result<SendOutcome, DatagramError> {
        match self.send_datagram(frame.clone()) {
            Ok(()) => Ok(SendOutcome::Sent),
            // the path MTU may still grow, keep it until its peek budget is spent
            Err(quinn::SendDatagramError::TooLarge) => Ok(SendOutcome::Blocked),
            Err(quinn::SendDatagramError::UnsupportedByPeer)
            | Err(quinn::SendDatagramError::Disabled) => Err(DatagramError::Unsupported),
            Err(quinn::SendDatagramError::ConnectionLost(e)) => {
                Err(DatagramError::closed(e.to_string()))
            }
        }
    }

    async fn receive_frame(&self) -> Result<Bytes, DatagramError> {
        self.read_datagram()
            .await
            .map_err(|e| DatagramError::closed(e.to_string()))
    }

    fn max_datagram_size(&self) -> Option<usize> {
        quinn::Connection::max_datagram_size(self)
    }

    fn close_transport(&self, reason: &str) {
        quinn::Connection::close(self, 0u32.into(), reason.as_bytes());
    }
}
