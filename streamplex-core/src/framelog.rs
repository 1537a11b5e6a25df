//! Frame-log record codec
//!
//! Logged frames are stored as concatenated records:
//!
//! ```text
//! +--------------+-----------------------------+------------------+
//! | size (u32 LE)| channel<<24 | flags (u32 LE)| payload          |
//! +--------------+-----------------------------+------------------+
//! ```
//!
//! `size` counts the channel/flags word plus the payload. Only the low 24
//! flag bits are kept.

use crate::constants::{LOG_CHANNEL_SHIFT, LOG_FLAGS_MASK, LOG_RECORD_HEADER_SIZE};
use crate::error::StreamError;
use crate::frame::Frame;
use crate::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes of the size word itself, excluded from the count it stores
const SIZE_WORD: usize = 4;

/// One decoded frame-log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Channel the frame arrived on
    pub channel: u8,
    /// Frame flags (24 bits)
    pub flags: u32,
    /// Frame payload
    pub payload: Bytes,
}

impl LogRecord {
    /// Bytes this record occupies in a log file
    pub fn wire_size(&self) -> usize {
        LOG_RECORD_HEADER_SIZE + self.payload.len()
    }
}

fn channel_word(channel: u8, flags: u32) -> u32 {
    ((channel as u32) << LOG_CHANNEL_SHIFT) | (flags & LOG_FLAGS_MASK)
}

fn size_word(payload_len: usize) -> Result<u32> {
    u32::try_from(payload_len + LOG_RECORD_HEADER_SIZE - SIZE_WORD).map_err(|_| {
        StreamError::ProtocolViolation(format!(
            "Frame of {} bytes too large for a log record",
            payload_len
        ))
    })
}

/// Append a record holding `payload` to `dst`
pub fn encode_record(channel: u8, flags: u32, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let size = size_word(payload.len())?;
    dst.reserve(LOG_RECORD_HEADER_SIZE + payload.len());
    dst.put_u32_le(size);
    dst.put_u32_le(channel_word(channel, flags));
    dst.put_slice(payload);
    Ok(())
}

/// Append a record for `frame` to `dst`, gathering its buffers directly
pub fn encode_frame_record(channel: u8, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let size = size_word(frame.payload())?;
    dst.reserve(LOG_RECORD_HEADER_SIZE + frame.payload());
    dst.put_u32_le(size);
    dst.put_u32_le(channel_word(channel, frame.flags()));
    for chunk in frame.chunks() {
        dst.put_slice(chunk);
    }
    Ok(())
}

/// Decode one record from the front of `src`
///
/// Returns `Ok(None)` when `src` does not hold a complete record yet; the
/// bytes are consumed only on success.
pub fn decode_record(src: &mut BytesMut, max_payload: usize) -> Result<Option<LogRecord>> {
    if src.len() < LOG_RECORD_HEADER_SIZE {
        return Ok(None);
    }

    let size = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if size < LOG_RECORD_HEADER_SIZE - SIZE_WORD {
        return Err(StreamError::ProtocolViolation(format!(
            "Log record size {} smaller than its header",
            size
        )));
    }

    let payload_len = size - (LOG_RECORD_HEADER_SIZE - SIZE_WORD);
    if payload_len > max_payload {
        return Err(StreamError::ProtocolViolation(format!(
            "Log record payload {} exceeds {}",
            payload_len, max_payload
        )));
    }
    if src.len() < LOG_RECORD_HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(SIZE_WORD);
    let word = src.get_u32_le();
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(LogRecord {
        channel: (word >> LOG_CHANNEL_SHIFT) as u8,
        flags: word & LOG_FLAGS_MASK,
        payload,
    }))
}
