//! UDP sessions carried as unreliable datagrams over one QUIC connection.
//!
//! Outbound datagrams go through a single-slot, flow-controlled queue that a
//! writer task drains; inbound datagrams land in a small bounded buffer and are
//! demultiplexed by session id into virtual UDP connections.

pub mod config;
pub mod datagram;
pub mod error;
pub mod tunnel_info_bridge;
pub mod udp;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::DatagramConfig;
pub use datagram::{DatagramConn, DatagramTransport, FrameTransport, SendOutcome};
pub use error::DatagramError;
pub use tunnel_info_bridge::{DatagramTraffic, DispatchState, TrafficCounters, TunnelInfoBridge};
pub use udp::udp_conn::{UdpConnWriter, UdpPacketConn};
pub use udp::udp_dispatcher::{SessionMetadata, UdpDispatcher, UdpSessionHandler};
pub use udp::udp_message::UdpMessage;
pub use udp::UdpPacket;
