use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::datagram::DatagramTransport;
use crate::error::DatagramError;

/// In-memory `DatagramTransport` for unit tests: records every datagram sent,
/// and hands out whatever the test injects with [RecordingTransport::inject].
pub struct RecordingTransport {
    max_datagram_size: usize,
    sent: Mutex<Vec<Bytes>>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    close_err: Mutex<Option<DatagramError>>,
    closed: CancellationToken,
}

impl RecordingTransport {
    pub fn new(max_datagram_size: usize) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(RecordingTransport {
            max_datagram_size,
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            close_err: Mutex::new(None),
            closed: CancellationToken::new(),
        })
    }

    pub fn inject(&self, data: impl Into<Bytes>) {
        let _ = self.inbound_tx.send(data.into());
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn close_error(&self) -> Option<DatagramError> {
        self.close_err.lock().clone()
    }

    fn closed_error(&self) -> DatagramError {
        self.close_error()
            .unwrap_or_else(|| DatagramError::closed("recording transport closed"))
    }
}

#[async_trait]
impl DatagramTransport for RecordingTransport {
    async fn send_datagram(&self, data: Bytes) -> Result<(), DatagramError> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.sent.lock().push(data);
        Ok(())
    }

    async fn receive_datagram(&self, cancel: &CancellationToken) -> Result<Bytes, DatagramError> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.closed_error()),
            _ = cancel.cancelled() => Err(DatagramError::Cancelled),
            data = inbound.recv() => data.ok_or_else(|| self.closed_error()),
        }
    }

    fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    fn close_with_error(&self, err: DatagramError) {
        let mut close_err = self.close_err.lock();
        if close_err.is_none() {
            *close_err = Some(err);
        }
        drop(close_err);
        self.closed.cancel();
    }
}
