//! UDP message codec.
//!
//! Wire layout of one datagram:
//!
//! ```text
//! [u32]    session id
//! [u16]    packet id
//! [u8]     fragment id
//! [u8]     fragment count
//! [varint] address length
//! [bytes]  address, "host:port"
//! [bytes]  payload
//! ```
//!
//! Integers are big endian, the address length is a QUIC variable-length
//! integer. A payload that does not fit into one datagram is split into up to
//! 255 fragments that share a packet id and each carry the full header.

use byte_pool::Block;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{alloc_block, copy_to_block};
use crate::error::DatagramError;

/// session id + packet id + fragment id + fragment count
const FIXED_HEADER_LEN: usize = 4 + 2 + 1 + 1;

pub const MAX_ADDRESS_LENGTH: usize = 2048;

pub const MAX_FRAGMENT_COUNT: usize = u8::MAX as usize;

/// A decoded UDP message. The payload buffer goes back to the pool when the
/// message is dropped.
pub struct UdpMessage {
    pub session_id: u32,
    pub packet_id: u16,
    pub fragment_id: u8,
    pub fragment_count: u8,
    pub destination: String,
    pub data: Block<'static, Vec<u8>>,
}

impl std::fmt::Debug for UdpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpMessage")
            .field("session_id", &self.session_id)
            .field("packet_id", &self.packet_id)
            .field("fragment_id", &self.fragment_id)
            .field("fragment_count", &self.fragment_count)
            .field("destination", &self.destination)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl UdpMessage {
    /// An unfragmented message.
    pub fn new(session_id: u32, packet_id: u16, destination: &str, payload: &[u8]) -> Self {
        UdpMessage {
            session_id,
            packet_id,
            fragment_id: 0,
            fragment_count: 1,
            destination: destination.to_string(),
            data: copy_to_block(payload),
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, DatagramError> {
        if buf.remaining() < FIXED_HEADER_LEN {
            return Err(DatagramError::Malformed("short header"));
        }
        let session_id = buf.get_u32();
        let packet_id = buf.get_u16();
        let fragment_id = buf.get_u8();
        let fragment_count = buf.get_u8();

        let address_len = read_varint(&mut buf)
            .ok_or(DatagramError::Malformed("truncated address length"))?;
        let address_len = usize::try_from(address_len)
            .map_err(|_| DatagramError::Malformed("address too long"))?;
        if address_len > MAX_ADDRESS_LENGTH {
            return Err(DatagramError::Malformed("address too long"));
        }
        if buf.remaining() < address_len {
            return Err(DatagramError::Malformed("truncated address"));
        }
        let destination = std::str::from_utf8(&buf[..address_len])
            .map_err(|_| DatagramError::Malformed("address is not utf-8"))?;
        validate_destination(destination)?;
        let destination = destination.to_string();
        buf.advance(address_len);

        Ok(UdpMessage {
            session_id,
            packet_id,
            fragment_id,
            fragment_count,
            destination,
            data: copy_to_block(buf),
        })
    }

    pub fn header_len(&self) -> usize {
        header_len(&self.destination)
    }

    pub fn encoded_len(&self) -> usize {
        self.header_len() + self.data.len()
    }

    /// Encode into one datagram of at most `max_size` bytes.
    pub fn encode(&self, max_size: usize) -> Result<Bytes, DatagramError> {
        validate_destination(&self.destination)?;
        let size = self.encoded_len();
        if size > max_size {
            return Err(DatagramError::Oversize {
                size,
                max: max_size,
            });
        }
        let mut buf = BytesMut::with_capacity(size);
        self.write_header(&mut buf, self.fragment_id, self.fragment_count);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Encode into as many datagrams of at most `max_size` bytes as needed.
    pub fn encode_fragments(&self, max_size: usize) -> Result<Vec<Bytes>, DatagramError> {
        validate_destination(&self.destination)?;
        if self.encoded_len() <= max_size {
            return Ok(vec![self.encode(max_size)?]);
        }

        let header_len = self.header_len();
        let oversize = DatagramError::Oversize {
            size: self.encoded_len(),
            max: max_size,
        };
        if header_len >= max_size {
            return Err(oversize);
        }
        let chunk_len = max_size - header_len;
        let fragment_count = self.data.len().div_ceil(chunk_len);
        if fragment_count > MAX_FRAGMENT_COUNT {
            return Err(oversize);
        }

        Ok(self
            .data
            .chunks(chunk_len)
            .enumerate()
            .map(|(fragment_id, chunk)| {
                let mut buf = BytesMut::with_capacity(header_len + chunk.len());
                self.write_header(&mut buf, fragment_id as u8, fragment_count as u8);
                buf.put_slice(chunk);
                buf.freeze()
            })
            .collect())
    }

    fn write_header(&self, buf: &mut BytesMut, fragment_id: u8, fragment_count: u8) {
        buf.put_u32(self.session_id);
        buf.put_u16(self.packet_id);
        buf.put_u8(fragment_id);
        buf.put_u8(fragment_count);
        write_varint(buf, self.destination.len() as u64);
        buf.put_slice(self.destination.as_bytes());
    }
}

fn header_len(destination: &str) -> usize {
    FIXED_HEADER_LEN + varint_len(destination.len() as u64) + destination.len()
}

/// Accepts "host:port" and "[v6]:port" with a numeric port, at most
/// `MAX_ADDRESS_LENGTH` bytes long.
pub(crate) fn validate_destination(destination: &str) -> Result<(), DatagramError> {
    if destination.len() > MAX_ADDRESS_LENGTH {
        return Err(DatagramError::Malformed("address too long"));
    }
    let (host, port) = destination
        .rsplit_once(':')
        .ok_or(DatagramError::Malformed("address without port"))?;
    if host.is_empty() {
        return Err(DatagramError::Malformed("address without host"));
    }
    port.parse::<u16>()
        .map_err(|_| DatagramError::Malformed("invalid address port"))?;
    Ok(())
}

pub(crate) fn varint_len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

pub(crate) fn write_varint(buf: &mut BytesMut, value: u64) {
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
}

/// `None` if the buffer ends inside the integer.
pub(crate) fn read_varint(buf: &mut &[u8]) -> Option<u64> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return None;
    }
    let mut value = (buf.get_u8() & 0b0011_1111) as u64;
    for _ in 1..len {
        value = (value << 8) | buf.get_u8() as u64;
    }
    Some(value)
}

/// Reassembles fragmented messages, one packet id at a time.
///
/// A fragment of a different packet than the one being assembled discards the
/// partial packet. Duplicate and out-of-range fragments are ignored.
#[derive(Default)]
pub struct Defragger {
    packet_id: u16,
    fragments: Vec<Option<UdpMessage>>,
    received: usize,
    size: usize,
}

impl Defragger {
    pub fn feed(&mut self, message: UdpMessage) -> Option<UdpMessage> {
        if message.fragment_count <= 1 {
            return Some(message);
        }
        let fragment_id = message.fragment_id as usize;
        let fragment_count = message.fragment_count as usize;
        if fragment_id >= fragment_count {
            return None;
        }

        if self.fragments.is_empty()
            || message.packet_id != self.packet_id
            || self.fragments.len() != fragment_count
        {
            self.packet_id = message.packet_id;
            self.fragments = std::iter::repeat_with(|| None).take(fragment_count).collect();
            self.received = 0;
            self.size = 0;
        }

        let slot = &mut self.fragments[fragment_id];
        if slot.is_some() {
            return None;
        }
        self.size += message.data.len();
        self.received += 1;
        *slot = Some(message);

        if self.received < self.fragments.len() {
            return None;
        }
        self.assemble()
    }

    fn assemble(&mut self) -> Option<UdpMessage> {
        let fragments = std::mem::take(&mut self.fragments);
        let mut data = alloc_block(self.size);
        let mut offset = 0;
        let mut first = None;
        for fragment in fragments.into_iter().flatten() {
            let len = fragment.data.len();
            data[offset..offset + len].copy_from_slice(&fragment.data);
            offset += len;
            if first.is_none() {
                first = Some(fragment);
            }
        }
        self.received = 0;
        self.size = 0;

        let first = first?;
        Some(UdpMessage {
            session_id: first.session_id,
            packet_id: first.packet_id,
            fragment_id: 0,
            fragment_count: 1,
            destination: first.destination,
            data,
        })
    }
}
