//! Virtual UDP connections.
//!
//! Every logical UDP flow multiplexed over the datagram connection gets an
//! `UdpConnState` (kept in the session table, fed by the dispatcher) and an
//! `UdpPacketConn` (handed to the application). The flow ends when its
//! cancellation token fires: explicit close, idle timeout, the handle being
//! dropped or the whole connection going away. The release callback then runs
//! exactly once.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::udp_message::{validate_destination, Defragger, UdpMessage};
use super::{UdpPacket, UdpReceiver, UdpSender};
use crate::datagram::DatagramTransport;
use crate::error::DatagramError;
use crate::tunnel_info_bridge::TrafficCounters;

pub(crate) type ReleaseFn = Box<dyn FnOnce() + Send>;

pub struct UdpConnState {
    session_id: u32,
    generation: u64,
    token: CancellationToken,
    packet_tx: UdpSender,
    defragger: Mutex<Defragger>,
    last_active: Mutex<Instant>,
    release: Mutex<Option<ReleaseFn>>,
    counters: Arc<TrafficCounters>,
}

impl UdpConnState {
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Distinguishes successive connections created for the same session id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn closed_error(&self) -> DatagramError {
        DatagramError::closed(format!("udp session {} closed", self.session_id))
    }

    /// Feed one decoded message. Fragments are held until their packet is
    /// complete; a full packet queue drops the packet.
    pub(crate) fn input_message(&self, message: UdpMessage) {
        self.touch();

        let message = self.defragger.lock().feed(message);
        let Some(message) = message else {
            return;
        };

        let packet = UdpPacket {
            payload: message.data,
            destination: message.destination,
        };
        match self.packet_tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                self.counters.on_dropped();
                debug!(
                    "udp session {} queue full, dropping packet ({} bytes)",
                    self.session_id,
                    packet.payload.len()
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("udp session {} reader is gone", self.session_id);
            }
        }
    }

    fn release(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }
}

/// Application-facing handle for one logical UDP flow.
pub struct UdpPacketConn {
    state: Arc<UdpConnState>,
    packet_rx: UdpReceiver,
    writer: UdpConnWriter,
}

/// Cloneable write half of an `UdpPacketConn`.
#[derive(Clone)]
pub struct UdpConnWriter {
    state: Arc<UdpConnState>,
    transport: Arc<dyn DatagramTransport>,
    next_packet_id: Arc<AtomicU16>,
}

pub(crate) struct UdpConnParams {
    pub session_id: u32,
    pub generation: u64,
    pub queue_len: usize,
    pub release: ReleaseFn,
}

pub(crate) fn new_udp_conn(
    params: UdpConnParams,
    parent: &CancellationToken,
    transport: Arc<dyn DatagramTransport>,
    counters: Arc<TrafficCounters>,
) -> (Arc<UdpConnState>, UdpPacketConn) {
    let (packet_tx, packet_rx) = mpsc::channel(params.queue_len);
    let state = Arc::new(UdpConnState {
        session_id: params.session_id,
        generation: params.generation,
        token: parent.child_token(),
        packet_tx,
        defragger: Mutex::new(Defragger::default()),
        last_active: Mutex::new(Instant::now()),
        release: Mutex::new(Some(params.release)),
        counters,
    });
    let conn = UdpPacketConn {
        state: state.clone(),
        packet_rx,
        writer: UdpConnWriter {
            state: state.clone(),
            transport,
            next_packet_id: Arc::new(AtomicU16::new(0)),
        },
    };
    (state, conn)
}

/// Cancel the connection after `idle_timeout` without traffic, and run its
/// release callback once it ends for any reason.
pub(crate) fn spawn_idle_watchdog(state: Arc<UdpConnState>, idle_timeout: Duration) {
    tokio::spawn(async move {
        loop {
            let deadline = state.last_active.lock().checked_add(idle_timeout);
            let Some(deadline) = deadline else {
                // too far out to ever expire
                state.token.cancelled().await;
                break;
            };
            tokio::select! {
                _ = state.token.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    if state.last_active.lock().elapsed() >= idle_timeout {
                        debug!("udp session {} idle, closing", state.session_id);
                        state.token.cancel();
                        break;
                    }
                }
            }
        }
        state.release();
    });
}

impl UdpPacketConn {
    pub fn session_id(&self) -> u32 {
        self.state.session_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.state.token.clone()
    }

    pub fn is_closed(&self) -> bool {
        !self.state.is_active()
    }

    /// Wait for the next complete packet of this flow.
    pub async fn read_packet(&mut self) -> Result<UdpPacket, DatagramError> {
        tokio::select! {
            biased;
            _ = self.state.token.cancelled() => Err(self.state.closed_error()),
            packet = self.packet_rx.recv() => packet.ok_or_else(|| self.state.closed_error()),
        }
    }

    pub async fn write_packet(
        &self,
        payload: &[u8],
        destination: &str,
    ) -> Result<(), DatagramError> {
        self.writer.write_packet(payload, destination).await
    }

    pub fn writer(&self) -> UdpConnWriter {
        self.writer.clone()
    }

    pub fn close(&self) {
        self.state.close();
    }
}

impl Drop for UdpPacketConn {
    fn drop(&mut self) {
        self.state.close();
    }
}

impl UdpConnWriter {
    /// Send one packet back to the peer, fragmenting it if it does not fit
    /// into a single datagram.
    pub async fn write_packet(
        &self,
        payload: &[u8],
        destination: &str,
    ) -> Result<(), DatagramError> {
        if !self.state.is_active() {
            return Err(self.state.closed_error());
        }
        validate_destination(destination)?;
        self.state.touch();

        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let message = UdpMessage::new(self.state.session_id, packet_id, destination, payload);
        let frames: Vec<Bytes> = message.encode_fragments(self.transport.max_datagram_size())?;
        drop(message);

        for frame in frames {
            tokio::select! {
                biased;
                _ = self.state.token.cancelled() => return Err(self.state.closed_error()),
                res = self.transport.send_datagram(frame) => res?,
            }
        }
        Ok(())
    }
}
