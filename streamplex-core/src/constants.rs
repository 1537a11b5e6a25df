//! Wire-format constants, limits and status bits

use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Segment header size in bytes
///
/// ```text
/// byte 0   : bit7 = tail-of-frame, bits6..0 = channel id
/// byte 1   : sequence number (modulo SEQUENCE_WINDOW)
/// byte 2-3 : bit15 = start-of-frame, bit14 = flag word follows,
///            bits13..0 = payload length (big-endian)
/// ```
pub const HEADER_SIZE: usize = 4;

/// Frame flag word carried after the header of a start segment (u32 BE)
pub const FLAGS_SIZE: usize = 4;

/// Header plus flag word
pub const MAX_HEADER_SIZE: usize = HEADER_SIZE + FLAGS_SIZE;

/// Size of the CRC-32C segment trailer in bytes
pub const CRC32C_SIZE: usize = 4;

/// Tail-of-frame bit in header byte 0
pub const TAIL_FLAG: u8 = 0b1000_0000;

/// Channel id bits in header byte 0
pub const CHANNEL_MASK: u8 = 0b0111_1111;

/// Number of addressable virtual channels
pub const MAX_CHANNELS: usize = (CHANNEL_MASK as usize) + 1;

/// Sequence numbers wrap at this value (8-bit counter)
pub const SEQUENCE_WINDOW: usize = 256;

/// Start-of-frame bit in the length word
pub const START_FLAG: u16 = 0x8000;

/// Flag-word-present bit in the length word; only valid with [`START_FLAG`]
pub const FLAGS_PRESENT: u16 = 0x4000;

/// Payload length bits in the length word
pub const LENGTH_MASK: u16 = 0x3FFF;

/// Largest payload a single segment can describe (14-bit length field)
pub const MAX_SEGMENT_PAYLOAD: usize = LENGTH_MASK as usize;

/// Default link MTU in bytes
pub const DEFAULT_MTU: usize = 1024;

/// Default number of virtual channels exposed by a core
pub const DEFAULT_CHANNELS: usize = 4;

/// Default inactivity bound for a partially reassembled frame
pub const DEFAULT_REASSEMBLY_TIMEOUT_MS: u64 = 1000;

/// Default upper bound on receive buffers outstanding at once
pub const DEFAULT_RX_POOL_BUFFERS: usize = 4096;

/// Default number of released buffers a pool keeps for reuse
pub const DEFAULT_POOL_CACHE: usize = 256;

/// Frame error bit: a segment failed its integrity check
pub const ERR_CRC: u32 = 0x0000_0001;

/// Frame error bit: a segment arrived out of sequence
pub const ERR_SEQUENCE: u32 = 0x0000_0002;

/// Frame error bit: reassembly stalled past the inactivity bound
pub const ERR_TIMEOUT: u32 = 0x0000_0004;

/// Frame error bit: reassembled frame exceeded the configured maximum
pub const ERR_OVERFLOW: u32 = 0x0000_0008;

/// Frame-log record prefix: size word + channel/flags word
pub const LOG_RECORD_HEADER_SIZE: usize = 8;

/// Channel position inside the frame-log channel/flags word
pub const LOG_CHANNEL_SHIFT: u32 = 24;

/// Flag bits kept in the frame-log channel/flags word
pub const LOG_FLAGS_MASK: u32 = 0x00FF_FFFF;

/// Integrity check appended to each segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityCheck {
    /// No trailer
    None,
    /// CRC-32C over header + payload (4 bytes, big-endian)
    #[default]
    Crc32c,
}

impl IntegrityCheck {
    /// Returns the size of the trailer in bytes
    pub const fn trailer_size(&self) -> usize {
        match self {
            IntegrityCheck::None => 0,
            IntegrityCheck::Crc32c => CRC32C_SIZE,
        }
    }

    /// Header plus trailer bytes carried by every segment
    pub const fn overhead(&self) -> usize {
        HEADER_SIZE + self.trailer_size()
    }
}

/// Convert a microsecond timeout where `0` means "wait forever"
pub fn timeout_from_micros(micros: u64) -> Option<Duration> {
    if micros == 0 {
        None
    } else {
        Some(Duration::from_micros(micros))
    }
}
