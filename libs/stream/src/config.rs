use std::time::Duration;

use crate::error::{Error, Result};
use crate::packet::{HEADER_LEN, MAX_DATAGRAM_LEN};

pub const DEFAULT_MAX_PACKET_SIZE: usize = 65536;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_WRITE_RETRY_LIMIT: u32 = 5;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TABLE_CAPACITY: u32 = 100_000;

/// Tunables for a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Largest datagram read or written, header included
    pub max_packet_size: usize,
    /// How long each send attempt waits for its ACK
    pub write_timeout: Duration,
    /// Send attempts before giving up
    pub write_retry_limit: u32,
    /// How long a request waits for its response once acknowledged
    pub read_timeout: Duration,
    /// Correlation ids cycle through `1..table_capacity`
    pub table_capacity: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            write_retry_limit: DEFAULT_WRITE_RETRY_LIMIT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            table_capacity: DEFAULT_TABLE_CAPACITY,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size <= HEADER_LEN {
            return Err(Error::InvalidConfig(format!(
                "max_packet_size must exceed the {HEADER_LEN} byte header, got {}",
                self.max_packet_size
            )));
        }
        if self.write_retry_limit == 0 {
            return Err(Error::InvalidConfig(
                "write_retry_limit must be at least 1".to_string(),
            ));
        }
        if self.write_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        if self.table_capacity < 2 {
            return Err(Error::InvalidConfig(format!(
                "table_capacity must be at least 2, got {}",
                self.table_capacity
            )));
        }
        Ok(())
    }

    /// Largest payload that fits in one datagram
    ///
    /// Bounded by what UDP can actually carry, even when `max_packet_size`
    /// is larger.
    pub fn max_payload_size(&self) -> usize {
        self.max_packet_size.min(MAX_DATAGRAM_LEN) - HEADER_LEN
    }
}
