//! Per-connection datagram frame queue.
//!
//! Outbound frames go through a capacity-1 channel into a single pending slot
//! owned by the writer. The writer inspects the slot with [`DatagramQueueWriter::peek`]
//! and confirms transmission with [`DatagramQueueWriter::pop`]. A frame that is
//! peeked more than `max_peek_times` times without a pop is discarded so that
//! one unsendable datagram cannot stall the pipeline.
//!
//! Inbound frames are copied into a bounded FIFO. Arrivals beyond capacity are
//! dropped, the producer never blocks.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use log::{debug, trace};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::DatagramConfig;
use crate::error::DatagramError;
use crate::tunnel_info_bridge::TrafficCounters;

/// Callback invoked once per successful submission to wake the writer.
pub type HasDataFn = Box<dyn Fn() + Send + Sync>;

struct QueuedFrame {
    data: Bytes,
    dequeued: oneshot::Sender<()>,
}

impl QueuedFrame {
    /// Release the submitter, whether the frame was sent or discarded.
    fn complete(self) {
        let _ = self.dequeued.send(());
    }
}

enum PendingFrame {
    Empty,
    Holding { frame: QueuedFrame, peek_times: usize },
}

impl PendingFrame {
    fn data(&self) -> Option<&Bytes> {
        match self {
            PendingFrame::Empty => None,
            PendingFrame::Holding { frame, .. } => Some(&frame.data),
        }
    }
}

/// Shared half of the queue: submission, inbound buffering and closure.
pub struct DatagramQueue {
    send_queue: mpsc::Sender<QueuedFrame>,
    has_data: HasDataFn,

    rcv_queue: Mutex<VecDeque<Bytes>>,
    rcv_queue_len: usize,
    rcvd: Notify,

    close_err: OnceLock<DatagramError>,
    closed: CancellationToken,

    counters: Arc<TrafficCounters>,
}

/// Writer-owned half of the queue: the single pending-frame slot.
pub struct DatagramQueueWriter {
    send_queue: mpsc::Receiver<QueuedFrame>,
    next_frame: PendingFrame,
    max_peek_times: usize,
    counters: Arc<TrafficCounters>,
}

impl DatagramQueue {
    pub fn new(
        config: &DatagramConfig,
        counters: Arc<TrafficCounters>,
        has_data: HasDataFn,
    ) -> (Arc<Self>, DatagramQueueWriter) {
        let (tx, rx) = mpsc::channel(1);
        let queue = Arc::new(DatagramQueue {
            send_queue: tx,
            has_data,
            rcv_queue: Mutex::new(VecDeque::with_capacity(config.rcv_queue_len)),
            rcv_queue_len: config.rcv_queue_len,
            rcvd: Notify::new(),
            close_err: OnceLock::new(),
            closed: CancellationToken::new(),
            counters: counters.clone(),
        });
        let writer = DatagramQueueWriter {
            send_queue: rx,
            next_frame: PendingFrame::Empty,
            max_peek_times: config.max_peek_times,
            counters,
        };
        (queue, writer)
    }

    /// Queue a frame for sending and wait until the writer has taken it.
    ///
    /// Returns once the frame was popped (or discarded after exhausting its
    /// peek budget), or with the close error if the queue closes first.
    pub async fn add_and_wait(&self, data: Bytes) -> Result<(), DatagramError> {
        if self.closed.is_cancelled() {
            return Err(self.close_error());
        }

        let (dequeued_tx, dequeued_rx) = oneshot::channel();
        let frame = QueuedFrame {
            data,
            dequeued: dequeued_tx,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.close_error()),
            res = self.send_queue.send(frame) => {
                if res.is_err() {
                    return Err(self.close_error());
                }
                (self.has_data)();
            }
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.close_error()),
            res = dequeued_rx => res.map_err(|_| self.close_error()),
        }
    }

    /// Buffer one inbound datagram, dropping it if the buffer is full.
    pub fn handle_datagram_frame(&self, data: &[u8]) {
        let queued = {
            let mut rcv_queue = self.rcv_queue.lock();
            if rcv_queue.len() < self.rcv_queue_len {
                rcv_queue.push_back(Bytes::copy_from_slice(data));
                true
            } else {
                false
            }
        };

        if queued {
            self.rcvd.notify_one();
        } else {
            self.counters.on_dropped();
            debug!("discarding datagram frame ({} bytes payload)", data.len());
        }
    }

    /// Take the oldest buffered datagram, waiting for one if necessary.
    ///
    /// A closed queue fails with its close error even if datagrams are still
    /// buffered. Firing `cancel` fails the wait with `DatagramError::Cancelled`.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Bytes, DatagramError> {
        loop {
            if self.closed.is_cancelled() {
                return Err(self.close_error());
            }

            let data = self.rcv_queue.lock().pop_front();
            if let Some(data) = data {
                return Ok(data);
            }

            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(self.close_error()),
                _ = cancel.cancelled() => return Err(DatagramError::Cancelled),
                _ = self.rcvd.notified() => continue,
            }
        }
    }

    /// Close the queue. Only the first call has an effect; returns whether
    /// this call performed the close.
    pub fn close_with_error(&self, err: DatagramError) -> bool {
        if self.close_err.set(err).is_ok() {
            self.closed.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the queue is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn close_error(&self) -> DatagramError {
        self.close_err
            .get()
            .cloned()
            .unwrap_or_else(|| DatagramError::closed("datagram queue writer dropped"))
    }
}

impl DatagramQueueWriter {
    /// Get the next frame to send without committing to it.
    ///
    /// If the frame is actually sent, `pop` must be called before the next
    /// `peek`.
    pub fn peek(&mut self) -> Option<&Bytes> {
        let exhausted = match &mut self.next_frame {
            PendingFrame::Empty => None,
            PendingFrame::Holding { peek_times, .. } => {
                *peek_times += 1;
                Some(*peek_times > self.max_peek_times)
            }
        };

        match exhausted {
            Some(false) => return self.next_frame.data(),
            Some(true) => {
                if let PendingFrame::Holding { frame, .. } =
                    std::mem::replace(&mut self.next_frame, PendingFrame::Empty)
                {
                    trace!("discarded datagram frame ({} bytes payload)", frame.data.len());
                    self.counters.on_discarded();
                    frame.complete();
                }
            }
            None => {}
        }

        match self.send_queue.try_recv() {
            Ok(frame) => {
                self.next_frame = PendingFrame::Holding {
                    frame,
                    peek_times: 0,
                };
                self.next_frame.data()
            }
            Err(_) => None,
        }
    }

    /// Confirm that the last peeked frame was sent.
    ///
    /// # Panics
    ///
    /// Panics if there is no pending frame, i.e. `peek` did not return one.
    pub fn pop(&mut self) {
        match std::mem::replace(&mut self.next_frame, PendingFrame::Empty) {
            PendingFrame::Holding { frame, .. } => frame.complete(),
            PendingFrame::Empty => panic!("datagram queue BUG: pop called for empty frame slot"),
        }
    }
}
