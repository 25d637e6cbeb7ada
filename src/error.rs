//! Error taxonomy shared by the datagram queue, the codec and the session layer.

use thiserror::Error;

/// Errors surfaced by datagram operations.
///
/// Drops (full inbound buffer, exhausted peek budget) never show up here, they
/// are swallowed where they are detected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatagramError {
    /// Terminal: the queue or connection is closed. Every blocked and future
    /// operation on the same queue receives a clone of this value.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The caller's cancellation token fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    #[error("malformed udp message: {0}")]
    Malformed(&'static str),

    #[error("udp message too large: {size} bytes, max {max}")]
    Oversize { size: usize, max: usize },

    #[error("datagrams not supported by peer")]
    Unsupported,
}

impl DatagramError {
    pub fn closed(reason: impl Into<String>) -> Self {
        DatagramError::ConnectionClosed(reason.into())
    }

    /// Whether retrying on a fresh call can make sense.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DatagramError::Cancelled)
    }
}

impl From<DatagramError> for std::io::Error {
    fn from(err: DatagramError) -> Self {
        let kind = match err {
            DatagramError::ConnectionClosed(_) => std::io::ErrorKind::ConnectionAborted,
            DatagramError::Cancelled => std::io::ErrorKind::Interrupted,
            DatagramError::Malformed(_) => std::io::ErrorKind::InvalidData,
            DatagramError::Oversize { .. } => std::io::ErrorKind::InvalidInput,
            DatagramError::Unsupported => std::io::ErrorKind::Unsupported,
        };
        std::io::Error::new(kind, err)
    }
}
