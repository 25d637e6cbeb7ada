//! Tunables for the datagram queue and the UDP session layer.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Maximum number of times an unsent outbound frame may be peeked before it
/// is discarded.
pub const DATAGRAM_FRAME_MAX_PEEK_TIMES: usize = 10;

/// Maximum number of inbound datagrams buffered for the application reader.
pub const DATAGRAM_RCV_QUEUE_LEN: usize = 32;

/// Maximum number of packets buffered per virtual UDP connection.
pub const SESSION_QUEUE_LEN: usize = 64;

pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatagramConfig {
    pub max_peek_times: usize,
    pub rcv_queue_len: usize,
    pub session_queue_len: usize,
    #[serde(with = "duration_secs")]
    pub udp_idle_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub send_retry_interval: Duration,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        DatagramConfig {
            max_peek_times: DATAGRAM_FRAME_MAX_PEEK_TIMES,
            rcv_queue_len: DATAGRAM_RCV_QUEUE_LEN,
            session_queue_len: SESSION_QUEUE_LEN,
            udp_idle_timeout: UDP_IDLE_TIMEOUT,
            send_retry_interval: SEND_RETRY_INTERVAL,
        }
    }
}

impl DatagramConfig {
    /// Parse a JSON document, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DatagramConfig =
            serde_json::from_str(json).context("failed to parse datagram config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_peek_times == 0 {
            bail!("max_peek_times must be greater than zero");
        }
        if self.rcv_queue_len == 0 {
            bail!("rcv_queue_len must be greater than zero");
        }
        if self.session_queue_len == 0 {
            bail!("session_queue_len must be greater than zero");
        }
        if self.udp_idle_timeout.is_zero() {
            bail!("udp_idle_timeout must be greater than zero");
        }
        if self.send_retry_interval.is_zero() {
            bail!("send_retry_interval must be greater than zero");
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
