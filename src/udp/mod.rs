//! UDP sessions multiplexed over a single datagram connection.

pub mod udp_conn;
pub mod udp_dispatcher;
pub mod udp_message;
pub mod udp_session_table;

use byte_pool::{Block, BytePool};
use lazy_static::lazy_static;
use tokio::sync::mpsc::{Receiver, Sender};

lazy_static! {
    /// Payload buffers for decoded messages, returned to the pool on drop.
    static ref BUFFER_POOL: BytePool<Vec<u8>> = BytePool::<Vec<u8>>::new();
}

/// Sender half of a virtual connection's packet channel.
pub type UdpSender = Sender<UdpPacket>;
/// Receiver half of a virtual connection's packet channel.
pub type UdpReceiver = Receiver<UdpPacket>;

/// A complete UDP payload delivered to a virtual connection.
pub struct UdpPacket {
    /// Backed by a shared byte pool to reduce allocations.
    pub payload: Block<'static, Vec<u8>>,
    /// "host:port" the peer addressed this payload to.
    pub destination: String,
}

/// Allocate a pooled buffer of exactly `len` bytes. Contents are unspecified.
pub(crate) fn alloc_block(len: usize) -> Block<'static, Vec<u8>> {
    // the pool refuses empty blocks, and recycled blocks may come back cleared
    let mut block = BUFFER_POOL.alloc(len.max(1));
    block.resize(len, 0);
    block
}

pub(crate) fn copy_to_block(data: &[u8]) -> Block<'static, Vec<u8>> {
    let mut block = alloc_block(data.len());
    block.copy_from_slice(data);
    block
}
