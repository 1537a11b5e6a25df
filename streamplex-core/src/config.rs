//! Packetizer and pool configuration

use crate::constants::{
    IntegrityCheck, DEFAULT_CHANNELS, DEFAULT_MTU, DEFAULT_POOL_CACHE,
    DEFAULT_REASSEMBLY_TIMEOUT_MS, DEFAULT_RX_POOL_BUFFERS, MAX_CHANNELS, MAX_SEGMENT_PAYLOAD,
};
use crate::error::StreamError;
use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Settings shared by both ends of a packetized link
///
/// `mtu` and `integrity` must match on both ends; the remaining fields are
/// local policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketizerConfig {
    /// Largest segment the transport moves, header and trailer included
    pub mtu: usize,

    /// Integrity check appended to each segment
    pub integrity: IntegrityCheck,

    /// Number of virtual channels (1..=128)
    pub channels: usize,

    /// Partial frames idle longer than this are discarded (0 disables)
    pub reassembly_timeout_ms: u64,

    /// Reassembled frames larger than this are discarded (0 = unlimited)
    pub max_frame_size: usize,

    /// Receive buffers outstanding at once (0 = unbounded)
    pub rx_pool_buffers: usize,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            integrity: IntegrityCheck::default(),
            channels: DEFAULT_CHANNELS,
            reassembly_timeout_ms: DEFAULT_REASSEMBLY_TIMEOUT_MS,
            max_frame_size: 0,
            rx_pool_buffers: DEFAULT_RX_POOL_BUFFERS,
        }
    }
}

impl PacketizerConfig {
    /// Set the link MTU
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the integrity check
    pub fn with_integrity(mut self, integrity: IntegrityCheck) -> Self {
        self.integrity = integrity;
        self
    }

    /// Set the number of virtual channels
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Set the reassembly inactivity bound in milliseconds
    pub fn with_reassembly_timeout_ms(mut self, ms: u64) -> Self {
        self.reassembly_timeout_ms = ms;
        self
    }

    /// Set the largest frame the receive side will reassemble
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the receive pool bound
    pub fn with_rx_pool_buffers(mut self, buffers: usize) -> Self {
        self.rx_pool_buffers = buffers;
        self
    }

    /// Payload bytes carried by one full segment
    pub fn max_segment_payload(&self) -> usize {
        self.mtu.saturating_sub(self.integrity.overhead())
    }

    /// Reassembly inactivity bound, `None` when disabled
    pub fn reassembly_timeout(&self) -> Option<Duration> {
        if self.reassembly_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.reassembly_timeout_ms))
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.mtu <= self.integrity.overhead() {
            return Err(StreamError::InvalidConfig(format!(
                "MTU {} leaves no room for payload (overhead {})",
                self.mtu,
                self.integrity.overhead()
            )));
        }

        if self.max_segment_payload() > MAX_SEGMENT_PAYLOAD {
            return Err(StreamError::InvalidConfig(format!(
                "MTU {} exceeds the {}-byte segment payload limit",
                self.mtu, MAX_SEGMENT_PAYLOAD
            )));
        }

        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(StreamError::InvalidConfig(format!(
                "Channel count {} outside 1..={}",
                self.channels, MAX_CHANNELS
            )));
        }

        Ok(())
    }
}

/// Buffer pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Raw capacity of every buffer handed out
    pub buffer_size: usize,

    /// Buffers outstanding at once (0 = unbounded)
    pub max_buffers: usize,

    /// Released buffers kept for reuse
    pub cache_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_MTU,
            max_buffers: 0,
            cache_limit: DEFAULT_POOL_CACHE,
        }
    }
}

impl PoolConfig {
    /// Pool of `buffer_size`-byte buffers with default limits
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..Self::default()
        }
    }

    /// Bound the number of outstanding buffers
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    /// Set how many released buffers are cached
    pub fn with_cache_limit(mut self, cache_limit: usize) -> Self {
        self.cache_limit = cache_limit;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.buffer_size == 0 {
            return Err(StreamError::InvalidConfig(
                "Pool buffer size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
