//! Unreliable datagram transport: flow-controlled frame queue and the pumps
//! that bind it to a connection.

pub mod datagram_conn;
pub mod datagram_queue;
pub mod memory_transport;
pub mod transport;

pub use datagram_conn::DatagramConn;
pub use datagram_queue::{DatagramQueue, DatagramQueueWriter};
pub use memory_transport::{memory_transport_pair, MemoryFrameTransport};
pub use transport::{DatagramTransport, FrameTransport, SendOutcome};
