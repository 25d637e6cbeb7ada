use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::datagram_queue::{DatagramQueue, DatagramQueueWriter};
use super::transport::{DatagramTransport, FrameTransport, SendOutcome};
use crate::config::DatagramConfig;
use crate::error::DatagramError;
use crate::tunnel_info_bridge::TrafficCounters;

/// A `DatagramQueue` bound to a `FrameTransport`.
///
/// Two tasks are spawned per connection: a writer that drains the queue with
/// peek/pop whenever data is signalled, and a reader that feeds inbound frames
/// into the receive buffer. A transport error on either side closes the queue.
pub struct DatagramConn {
    queue: Arc<DatagramQueue>,
    transport: Arc<dyn FrameTransport>,
    counters: Arc<TrafficCounters>,
}

impl DatagramConn {
    pub fn start(
        transport: Arc<dyn FrameTransport>,
        config: &DatagramConfig,
        counters: Arc<TrafficCounters>,
    ) -> Result<Arc<Self>, DatagramError> {
        if transport.max_datagram_size().is_none() {
            return Err(DatagramError::Unsupported);
        }

        let has_data = Arc::new(Notify::new());
        let (queue, writer) = {
            let has_data = has_data.clone();
            DatagramQueue::new(
                config,
                counters.clone(),
                Box::new(move || has_data.notify_one()),
            )
        };

        tokio::spawn(run_writer_loop(
            transport.clone(),
            queue.clone(),
            writer,
            has_data,
            config.send_retry_interval,
            counters.clone(),
        ));
        tokio::spawn(run_reader_loop(
            transport.clone(),
            queue.clone(),
            counters.clone(),
        ));

        Ok(Arc::new(DatagramConn {
            queue,
            transport,
            counters,
        }))
    }

    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn close_error(&self) -> DatagramError {
        self.queue.close_error()
    }
}

impl Drop for DatagramConn {
    fn drop(&mut self) {
        self.close_with_error(DatagramError::closed("datagram connection dropped"));
    }
}

#[async_trait]
impl DatagramTransport for DatagramConn {
    async fn send_datagram(&self, data: Bytes) -> Result<(), DatagramError> {
        let max = DatagramTransport::max_datagram_size(self);
        if data.len() > max {
            return Err(DatagramError::Oversize {
                size: data.len(),
                max,
            });
        }
        self.queue.add_and_wait(data).await
    }

    async fn receive_datagram(&self, cancel: &CancellationToken) -> Result<Bytes, DatagramError> {
        self.queue.receive(cancel).await
    }

    fn max_datagram_size(&self) -> usize {
        self.transport.max_datagram_size().unwrap_or(0)
    }

    fn close_with_error(&self, err: DatagramError) {
        let reason = err.to_string();
        if self.queue.close_with_error(err) {
            info!("datagram connection closed: {}", reason);
            self.transport.close_transport(&reason);
        }
    }
}

async fn run_writer_loop(
    transport: Arc<dyn FrameTransport>,
    queue: Arc<DatagramQueue>,
    mut writer: DatagramQueueWriter,
    has_data: Arc<Notify>,
    retry_interval: Duration,
    counters: Arc<TrafficCounters>,
) {
    let mut blocked = false;
    loop {
        tokio::select! {
            biased;
            _ = queue.closed() => break,
            _ = has_data.notified() => {}
            _ = tokio::time::sleep(retry_interval), if blocked => {}
        }

        blocked = false;
        while let Some(frame) = writer.peek() {
            let len = frame.len();
            match transport.try_send_frame(frame) {
                Ok(SendOutcome::Sent) => {
                    counters.on_sent(len);
                    writer.pop();
                }
                Ok(SendOutcome::Blocked) => {
                    blocked = true;
                    break;
                }
                Err(e) => {
                    error!("failed to send datagram frame: {}", e);
                    queue.close_with_error(e);
                    return;
                }
            }
        }
    }
    debug!("datagram writer loop stopped");
}

async fn run_reader_loop(
    transport: Arc<dyn FrameTransport>,
    queue: Arc<DatagramQueue>,
    counters: Arc<TrafficCounters>,
) {
    loop {
        tokio::select! {
            biased;
            _ = queue.closed() => break,
            res = transport.receive_frame() => match res {
                Ok(frame) => {
                    counters.on_received(frame.len());
                    queue.handle_datagram_frame(&frame);
                }
                Err(e) => {
                    debug!("datagram reader loop ended: {}", e);
                    queue.close_with_error(e);
                    break;
                }
            }
        }
    }
    debug!("datagram reader loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::memory_transport::{memory_transport_pair, MemoryFrameTransport};

    fn start_pair(
        max_datagram_size: usize,
    ) -> (
        Arc<DatagramConn>,
        Arc<DatagramConn>,
        Arc<MemoryFrameTransport>,
    ) {
        let (a, b) = memory_transport_pair(max_datagram_size);
        let config = DatagramConfig::default();
        let conn_a = DatagramConn::start(a.clone(), &config, TrafficCounters::new()).unwrap();
        let conn_b = DatagramConn::start(b, &config, TrafficCounters::new()).unwrap();
        (conn_a, conn_b, a)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, b, _) = start_pair(1200);
        a.send_datagram(Bytes::from_static(b"ping")).await.unwrap();

        let data = b.receive_datagram(&CancellationToken::new()).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"ping"));
        assert_eq!(a.counters().snapshot().tx_dgrams, 1);
        assert_eq!(b.counters().snapshot().rx_bytes, 4);
    }

    #[tokio::test]
    async fn test_oversize_submission_rejected() {
        let (a, _b, _) = start_pair(16);
        let res = a.send_datagram(Bytes::from(vec![0u8; 17])).await;
        assert_eq!(res, Err(DatagramError::Oversize { size: 17, max: 16 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_frame_discarded_after_retries() {
        let (a, b, transport_a) = start_pair(1200);
        transport_a.set_blocked(true);

        // the submitter is released once the frame runs out of peeks
        a.send_datagram(Bytes::from_static(b"stuck")).await.unwrap();
        assert_eq!(a.counters().snapshot().discarded_dgrams, 1);
        assert_eq!(a.counters().snapshot().tx_dgrams, 0);

        transport_a.set_blocked(false);
        a.send_datagram(Bytes::from_static(b"next")).await.unwrap();
        let data = b.receive_datagram(&CancellationToken::new()).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"next"));
    }

    #[tokio::test]
    async fn test_transport_close_propagates() {
        let (a, b, transport_a) = start_pair(1200);
        transport_a.close_transport("reset");

        let err = b
            .receive_datagram(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, DatagramError::closed("memory transport closed"));

        let err = a.send_datagram(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, DatagramError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_close_with_error_is_sticky() {
        let (a, _b, _) = start_pair(1200);
        a.close_with_error(DatagramError::closed("bye"));
        a.close_with_error(DatagramError::closed("again"));
        assert!(a.is_closed());
        assert_eq!(a.close_error(), DatagramError::closed("bye"));
        assert_eq!(
            a.receive_datagram(&CancellationToken::new()).await,
            Err(DatagramError::closed("bye"))
        );
    }
}
