//! Demultiplexes inbound UDP messages into virtual connections.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use super::udp_conn::{
    new_udp_conn, spawn_idle_watchdog, UdpConnParams, UdpConnState, UdpPacketConn,
};
use super::udp_message::UdpMessage;
use super::udp_session_table::UdpSessionTable;
use crate::config::DatagramConfig;
use crate::datagram::DatagramTransport;
use crate::error::DatagramError;
use crate::tunnel_info_bridge::{DispatchState, TrafficCounters, TunnelInfoBridge};

/// What the handler learns about a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub session_id: u32,
    /// Address of the peer on the outer connection, if known.
    pub source: Option<SocketAddr>,
    /// Destination of the first message of the session.
    pub destination: String,
}

/// Receives every newly created virtual connection. Each call runs on its own
/// task, and the connection closes once the handler drops it.
#[async_trait]
pub trait UdpSessionHandler: Send + Sync + 'static {
    async fn new_packet_connection(
        &self,
        conn: UdpPacketConn,
        metadata: SessionMetadata,
    ) -> anyhow::Result<()>;
}

pub struct UdpDispatcher {
    transport: Arc<dyn DatagramTransport>,
    handler: Arc<dyn UdpSessionHandler>,
    sessions: Arc<UdpSessionTable>,
    source: Option<SocketAddr>,
    config: DatagramConfig,
    token: CancellationToken,
    counters: Arc<TrafficCounters>,
    bridge: TunnelInfoBridge,
}

impl UdpDispatcher {
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        handler: Arc<dyn UdpSessionHandler>,
        config: DatagramConfig,
    ) -> Self {
        UdpDispatcher {
            transport,
            handler,
            sessions: UdpSessionTable::new(),
            source: None,
            config,
            token: CancellationToken::new(),
            counters: TrafficCounters::new(),
            bridge: TunnelInfoBridge::new(),
        }
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_info_bridge(mut self, bridge: TunnelInfoBridge) -> Self {
        self.bridge = bridge;
        self
    }

    /// Share counters with the datagram connection so one report covers both.
    pub fn with_counters(mut self, counters: Arc<TrafficCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Root of the cancellation tree; every session token is a child of it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn sessions(&self) -> &Arc<UdpSessionTable> {
        &self.sessions
    }

    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }

    pub fn report_traffic(&self) {
        self.bridge.post_traffic(self.counters.snapshot());
    }

    /// Stop the loop and every session it created.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Run until the transport fails, a malformed message arrives or the
    /// dispatcher is shut down. Shutdown is the only clean exit.
    pub async fn run(&self) -> Result<(), DatagramError> {
        info!("udp dispatcher started, source: {:?}", self.source);
        self.bridge.post_state(DispatchState::Running);

        let err = loop {
            let data = match self.transport.receive_datagram(&self.token).await {
                Ok(data) => data,
                Err(e) => break e,
            };
            match UdpMessage::decode(&data) {
                Ok(message) => self.handle_udp_message(message),
                Err(e) => {
                    error!("failed to decode udp message: {}", e);
                    break e;
                }
            }
        };

        self.token.cancel();
        self.bridge.post_state(DispatchState::Closed);

        if err.is_cancelled() {
            info!("udp dispatcher stopped");
            self.transport
                .close_with_error(DatagramError::closed("udp dispatcher stopped"));
            Ok(())
        } else {
            warn!("udp dispatcher quit: {}", err);
            self.transport.close_with_error(err.clone());
            Err(err)
        }
    }

    fn handle_udp_message(&self, message: UdpMessage) {
        let state = match self.sessions.get_active(message.session_id) {
            Some(state) => state,
            None => self.open_session(&message),
        };
        state.input_message(message);
    }

    fn open_session(&self, message: &UdpMessage) -> Arc<UdpConnState> {
        let session_id = message.session_id;
        let (state, conn) = self
            .sessions
            .get_or_insert_with(session_id, |generation| self.new_conn(session_id, generation));

        let Some(conn) = conn else {
            return state;
        };

        self.counters.on_session_opened();
        spawn_idle_watchdog(state.clone(), self.config.udp_idle_timeout);
        debug!("new udp session {} to {}", session_id, message.destination);

        let handler = self.handler.clone();
        let metadata = SessionMetadata {
            session_id,
            source: self.source,
            destination: message.destination.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = handler.new_packet_connection(conn, metadata).await {
                warn!("udp session {} handler failed: {:#}", session_id, e);
            }
        });
        state
    }

    fn new_conn(&self, session_id: u32, generation: u64) -> (Arc<UdpConnState>, UdpPacketConn) {
        let sessions = Arc::downgrade(&self.sessions);
        let counters = self.counters.clone();
        let release = Box::new(move || {
            counters.on_session_released();
            if let Some(sessions) = sessions.upgrade() {
                sessions.remove(session_id, generation);
            }
            debug!("udp session {} released", session_id);
        });

        new_udp_conn(
            UdpConnParams {
                session_id,
                generation,
                queue_len: self.config.session_queue_len,
                release,
            },
            &self.token,
            self.transport.clone(),
            self.counters.clone(),
        )
    }
}

impl Drop for UdpDispatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
