//! Segment codec
//!
//! A segment is the packetizer's wire unit:
//!
//! ```text
//! +------+------+-------------+----------------+---------------+--------------+
//! | T|ch | seq  | S|F|len (BE)| flags (BE)     | payload (len) | CRC-32C (BE) |
//! | 1 B  | 1 B  | 2 B         | 4 B, if F      |               | 4 B, optional|
//! +------+------+-------------+----------------+---------------+--------------+
//! ```
//!
//! `T` is the tail-of-frame bit and `ch` the 7-bit channel id. `S` marks the
//! first segment of a frame; `F` (only with `S`) says the frame's flag word
//! follows the header. Frames with no flags set skip the word. `len` is 14
//! bits. The CRC covers everything before it and is present when the link
//! runs with [`IntegrityCheck::Crc32c`].

use crate::buffer::Buffer;
use crate::constants::{
    IntegrityCheck, CHANNEL_MASK, CRC32C_SIZE, FLAGS_PRESENT, FLAGS_SIZE, HEADER_SIZE,
    LENGTH_MASK, MAX_HEADER_SIZE, MAX_SEGMENT_PAYLOAD, START_FLAG, TAIL_FLAG,
};
use crate::error::StreamError;
use crate::frame::Frame;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};

/// Decoded segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Virtual channel (0..=127)
    pub channel: u8,
    /// Per-channel sequence number
    pub sequence: u8,
    /// First segment of a frame
    pub start: bool,
    /// Last segment of a frame
    pub tail: bool,
    /// Frame flag word, carried on start segments when non-zero
    pub flags: Option<u32>,
    /// Payload bytes following the header
    pub payload_len: u16,
}

impl SegmentHeader {
    /// Build a continuation header, validating the channel id and payload length
    pub fn new(channel: u8, sequence: u8, tail: bool, payload_len: usize) -> Result<Self> {
        if channel > CHANNEL_MASK {
            return Err(StreamError::InvalidChannel(channel));
        }
        if payload_len > MAX_SEGMENT_PAYLOAD {
            return Err(StreamError::ProtocolViolation(format!(
                "Segment payload {} exceeds {}",
                payload_len, MAX_SEGMENT_PAYLOAD
            )));
        }
        Ok(Self {
            channel,
            sequence,
            start: false,
            tail,
            flags: None,
            payload_len: payload_len as u16,
        })
    }

    /// Mark as the first segment of a frame
    pub fn with_start(mut self) -> Self {
        self.start = true;
        self
    }

    /// Mark as the first segment of a frame carrying `flags`
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.start = true;
        self.flags = (flags != 0).then_some(flags);
        self
    }

    /// Header bytes on the wire, flag word included
    pub fn header_len(&self) -> usize {
        match self.flags {
            Some(_) => MAX_HEADER_SIZE,
            None => HEADER_SIZE,
        }
    }

    /// Write the wire form into `dst`
    pub fn put<B: BufMut>(&self, dst: &mut B) {
        let mut byte0 = self.channel & CHANNEL_MASK;
        if self.tail {
            byte0 |= TAIL_FLAG;
        }
        let mut word = self.payload_len & LENGTH_MASK;
        if self.start {
            word |= START_FLAG;
        }
        if self.flags.is_some() {
            word |= FLAGS_PRESENT;
        }

        dst.put_u8(byte0);
        dst.put_u8(self.sequence);
        dst.put_u16(word);
        if let Some(flags) = self.flags {
            dst.put_u32(flags);
        }
    }

    /// Serialize to the wire form
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header_len());
        self.put(&mut buf);
        buf.freeze()
    }

    /// Parse the wire form from the front of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StreamError::ProtocolViolation(format!(
                "Segment header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let word = u16::from_be_bytes([bytes[2], bytes[3]]);
        let start = word & START_FLAG != 0;
        let flags = if word & FLAGS_PRESENT == 0 {
            None
        } else if !start {
            return Err(StreamError::ProtocolViolation(
                "Flag word on a continuation segment".to_string(),
            ));
        } else if bytes.len() < MAX_HEADER_SIZE {
            return Err(StreamError::ProtocolViolation(format!(
                "Segment header needs {} bytes, got {}",
                MAX_HEADER_SIZE,
                bytes.len()
            )));
        } else {
            let mut raw = [0u8; FLAGS_SIZE];
            raw.copy_from_slice(&bytes[HEADER_SIZE..MAX_HEADER_SIZE]);
            Some(u32::from_be_bytes(raw))
        };

        Ok(Self {
            channel: bytes[0] & CHANNEL_MASK,
            sequence: bytes[1],
            start,
            tail: bytes[0] & TAIL_FLAG != 0,
            flags,
            payload_len: word & LENGTH_MASK,
        })
    }

    /// Size of the whole segment on the wire
    pub fn segment_size(&self, integrity: IntegrityCheck) -> usize {
        self.header_len() + self.payload_len as usize + integrity.trailer_size()
    }
}

/// Payload bytes one segment can carry on a link with this MTU
pub fn max_payload(mtu: usize, integrity: IntegrityCheck) -> usize {
    mtu.saturating_sub(integrity.overhead()).min(MAX_SEGMENT_PAYLOAD)
}

/// Payload bytes left in a frame's first segment once its flag word is in
pub fn first_payload(max_payload: usize, flags: u32) -> usize {
    if flags == 0 {
        max_payload
    } else {
        max_payload.saturating_sub(FLAGS_SIZE)
    }
}

/// Number of segments needed for a frame of `frame_len` bytes with `flags`
///
/// An empty frame still takes one (empty, start and tail) segment.
pub fn segment_count(frame_len: usize, max_payload: usize, flags: u32) -> usize {
    let first = first_payload(max_payload, flags);
    if frame_len <= first || max_payload == 0 {
        return 1;
    }
    1 + (frame_len - first).div_ceil(max_payload)
}

/// Encode one segment into `buf`
pub fn encode_segment_into(
    header: &SegmentHeader,
    payload: &[u8],
    integrity: IntegrityCheck,
    buf: &mut BytesMut,
) -> Result<()> {
    if payload.len() != header.payload_len as usize {
        return Err(StreamError::ProtocolViolation(format!(
            "Payload length mismatch: header says {}, actual {}",
            header.payload_len,
            payload.len()
        )));
    }

    let start = buf.len();
    buf.reserve(header.segment_size(integrity));
    header.put(buf);
    buf.put_slice(payload);

    if integrity == IntegrityCheck::Crc32c {
        let checksum = crc32c::crc32c(&buf[start..]);
        buf.put_u32(checksum);
    }
    Ok(())
}

/// Encode one segment into a new buffer
pub fn encode_segment(
    header: &SegmentHeader,
    payload: &[u8],
    integrity: IntegrityCheck,
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(header.segment_size(integrity));
    encode_segment_into(header, payload, integrity, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a contiguous segment, returning its header and payload
///
/// Validates the length field against the slice size and the checksum when
/// the link carries one.
pub fn decode_segment(data: &[u8], integrity: IntegrityCheck) -> Result<(SegmentHeader, &[u8])> {
    let header = SegmentHeader::from_bytes(data)?;
    let expected = header.segment_size(integrity);
    if data.len() != expected {
        return Err(StreamError::ProtocolViolation(format!(
            "Segment length field implies {} bytes, received {}",
            expected,
            data.len()
        )));
    }

    let body_start = header.header_len();
    let body_end = body_start + header.payload_len as usize;
    if integrity == IntegrityCheck::Crc32c {
        let mut trailer = [0u8; CRC32C_SIZE];
        trailer.copy_from_slice(&data[body_end..]);
        let expected = u32::from_be_bytes(trailer);
        let actual = crc32c::crc32c(&data[..body_end]);
        if actual != expected {
            return Err(StreamError::IntegrityFailure { expected, actual });
        }
    }

    Ok((header, &data[body_start..body_end]))
}

/// Validate a segment held in a frame and return its header
///
/// Works on frames spanning several buffers; nothing is copied except the
/// header and trailer words.
pub fn inspect_segment(frame: &Frame, mtu: usize, integrity: IntegrityCheck) -> Result<SegmentHeader> {
    let total = frame.payload();
    if total < integrity.overhead() {
        return Err(StreamError::ProtocolViolation(format!(
            "Runt segment: {} bytes",
            total
        )));
    }
    if total > mtu {
        return Err(StreamError::ProtocolViolation(format!(
            "Segment of {} bytes exceeds MTU {}",
            total, mtu
        )));
    }

    let mut raw = [0u8; MAX_HEADER_SIZE];
    let got = frame.read_at(0, &mut raw);
    let header = SegmentHeader::from_bytes(&raw[..got])?;
    if header.segment_size(integrity) != total {
        return Err(StreamError::ProtocolViolation(format!(
            "Segment length field implies {} bytes, received {}",
            header.segment_size(integrity),
            total
        )));
    }

    if integrity == IntegrityCheck::Crc32c {
        let body_end = total - CRC32C_SIZE;
        let mut trailer = [0u8; CRC32C_SIZE];
        frame.read_at(body_end, &mut trailer);
        let expected = u32::from_be_bytes(trailer);
        let actual = crc32c_prefix(frame, body_end);
        if actual != expected {
            return Err(StreamError::IntegrityFailure { expected, actual });
        }
    }

    Ok(header)
}

/// CRC-32C over the first `len` payload bytes of `frame`
fn crc32c_prefix(frame: &Frame, len: usize) -> u32 {
    let mut remaining = len;
    let mut crc = 0;
    for chunk in frame.chunks() {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(chunk.len());
        crc = crc32c::crc32c_append(crc, &chunk[..take]);
        remaining -= take;
    }
    crc
}

/// True when `buffer` has room to become a segment with a `header_len`-byte
/// header in place
pub(crate) fn can_seal(
    buffer: &Buffer,
    header_len: usize,
    integrity: IntegrityCheck,
    max_payload: usize,
) -> bool {
    buffer.head_room() >= header_len
        && buffer.tail_room() >= integrity.trailer_size()
        && buffer.payload() <= max_payload
}

/// Turn a payload buffer into a wire segment without moving the payload
///
/// The header lands in the header room and the trailer in the tail room, so
/// the caller must have checked [`can_seal`] first.
pub(crate) fn seal_buffer(buffer: &mut Buffer, header: &SegmentHeader, integrity: IntegrityCheck) {
    let header_len = header.header_len();
    let mut raw = [0u8; MAX_HEADER_SIZE];
    header.put(&mut &mut raw[..]);
    buffer.set_head_room(buffer.head_room() - header_len);
    buffer.write(0, &raw[..header_len]);

    if integrity == IntegrityCheck::Crc32c {
        let checksum = crc32c::crc32c(buffer.payload_slice());
        buffer.set_tail_room(buffer.tail_room() - CRC32C_SIZE);
        let end = buffer.payload();
        buffer.write(end, &checksum.to_be_bytes());
    }
}

/// Narrow a validated segment buffer down to its payload in place
pub(crate) fn open_buffer(buffer: &mut Buffer, header: &SegmentHeader) {
    buffer.set_head_room(buffer.head_room() + header.header_len());
    buffer.set_payload(header.payload_len as usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = SegmentHeader::new(2, 7, true, 0x0184).unwrap();
        assert_eq!(header.to_bytes().as_ref(), &[0x82, 0x07, 0x01, 0x84]);
        assert_eq!(SegmentHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn test_start_and_flags_layout() {
        let header = SegmentHeader::new(1, 0, false, 2).unwrap().with_start();
        assert_eq!(header.to_bytes().as_ref(), &[0x01, 0x00, 0x80, 0x02]);

        let header = SegmentHeader::new(1, 0, false, 2)
            .unwrap()
            .with_flags(0x0102_0304);
        assert_eq!(header.header_len(), MAX_HEADER_SIZE);
        assert_eq!(
            header.to_bytes().as_ref(),
            &[0x01, 0x00, 0xC0, 0x02, 0x01, 0x02, 0x03, 0x04]
        );
        assert_eq!(SegmentHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn test_zero_flags_take_no_room() {
        let header = SegmentHeader::new(0, 0, true, 0).unwrap().with_flags(0);
        assert!(header.start);
        assert_eq!(header.flags, None);
        assert_eq!(header.header_len(), HEADER_SIZE);
    }

    #[test]
    fn test_flag_word_without_start_rejected() {
        assert!(matches!(
            SegmentHeader::from_bytes(&[0x01, 0x00, 0x40, 0x00, 0, 0, 0, 1]),
            Err(StreamError::ProtocolViolation(_))
        ));
        // Start with flag word but only the base header present
        assert!(matches!(
            SegmentHeader::from_bytes(&[0x01, 0x00, 0xC0, 0x00]),
            Err(StreamError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_header_rejects_bad_channel() {
        assert_eq!(
            SegmentHeader::new(128, 0, false, 0),
            Err(StreamError::InvalidChannel(128))
        );
        assert!(SegmentHeader::new(0, 0, false, MAX_SEGMENT_PAYLOAD + 1).is_err());
    }

    #[test]
    fn test_short_header() {
        assert!(matches!(
            SegmentHeader::from_bytes(&[0x01, 0x02]),
            Err(StreamError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_encode_decode_with_crc() {
        let header = SegmentHeader::new(5, 200, false, 3).unwrap();
        let encoded = encode_segment(&header, b"abc", IntegrityCheck::Crc32c).unwrap();
        assert_eq!(encoded.len(), 3 + 8);

        let (decoded, payload) = decode_segment(&encoded, IntegrityCheck::Crc32c).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_encode_decode_flagged_start() {
        let header = SegmentHeader::new(9, 4, true, 3).unwrap().with_flags(0x5A);
        let encoded = encode_segment(&header, b"xyz", IntegrityCheck::Crc32c).unwrap();
        assert_eq!(encoded.len(), 3 + 8 + FLAGS_SIZE);

        let (decoded, payload) = decode_segment(&encoded, IntegrityCheck::Crc32c).unwrap();
        assert_eq!(decoded.flags, Some(0x5A));
        assert!(decoded.start && decoded.tail);
        assert_eq!(payload, b"xyz");
    }

    #[test]
    fn test_corruption_detected() {
        let header = SegmentHeader::new(1, 0, true, 4).unwrap();
        let mut encoded = encode_segment(&header, b"data", IntegrityCheck::Crc32c)
            .unwrap()
            .to_vec();
        encoded[5] ^= 0x40;

        assert!(matches!(
            decode_segment(&encoded, IntegrityCheck::Crc32c),
            Err(StreamError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let header = SegmentHeader::new(1, 0, true, 4).unwrap();
        let encoded = encode_segment(&header, b"data", IntegrityCheck::None).unwrap();
        assert!(matches!(
            decode_segment(&encoded[..6], IntegrityCheck::None),
            Err(StreamError::ProtocolViolation(_))
        ));
        assert!(encode_segment(&header, b"toolong", IntegrityCheck::None).is_err());
    }

    #[test]
    fn test_segment_count() {
        assert_eq!(segment_count(500, 184, 0), 3);
        assert_eq!(segment_count(0, 184, 0), 1);
        assert_eq!(segment_count(368, 184, 0), 2);
        // The flag word pushes the last 4 bytes into a third segment
        assert_eq!(segment_count(368, 184, 1), 3);
        assert_eq!(segment_count(180, 184, 1), 1);
        assert_eq!(first_payload(184, 0), 184);
        assert_eq!(first_payload(184, 7), 180);
        assert_eq!(max_payload(188, IntegrityCheck::None), 184);
        assert_eq!(max_payload(188, IntegrityCheck::Crc32c), 180);
    }

    #[test]
    fn test_inspect_multi_buffer_frame() {
        let header = SegmentHeader::new(3, 9, false, 10).unwrap().with_flags(0xABCD);
        let encoded = encode_segment(&header, b"0123456789", IntegrityCheck::Crc32c).unwrap();

        // Split the wire bytes across several buffers, cutting the flag word
        let mut frame = Frame::new();
        for part in encoded.chunks(6) {
            let mut buffer = Buffer::new(part.len());
            buffer.write(0, part);
            frame.push_buffer(buffer);
        }

        assert_eq!(
            inspect_segment(&frame, 64, IntegrityCheck::Crc32c).unwrap(),
            header
        );
        assert!(matches!(
            inspect_segment(&frame, 16, IntegrityCheck::Crc32c),
            Err(StreamError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_seal_matches_encoder() {
        let header = SegmentHeader::new(2, 1, true, 5).unwrap();
        let expected = encode_segment(&header, b"hello", IntegrityCheck::Crc32c).unwrap();

        let mut buffer = Buffer::new(32);
        buffer.set_head_room(HEADER_SIZE);
        buffer.set_tail_room(32 - HEADER_SIZE - 16);
        buffer.write(0, b"hello");
        assert!(can_seal(&buffer, HEADER_SIZE, IntegrityCheck::Crc32c, 16));

        seal_buffer(&mut buffer, &header, IntegrityCheck::Crc32c);
        assert_eq!(buffer.payload_slice(), expected.as_ref());

        open_buffer(&mut buffer, &header);
        assert_eq!(buffer.payload_slice(), b"hello");
    }

    #[test]
    fn test_seal_flagged_start_in_place() {
        let header = SegmentHeader::new(0, 3, false, 4).unwrap().with_flags(0x11);
        let expected = encode_segment(&header, b"body", IntegrityCheck::None).unwrap();

        let mut buffer = Buffer::new(16);
        buffer.set_head_room(MAX_HEADER_SIZE);
        buffer.write(0, b"body");
        assert!(!can_seal(&buffer, MAX_HEADER_SIZE + 1, IntegrityCheck::None, 8));
        assert!(can_seal(&buffer, MAX_HEADER_SIZE, IntegrityCheck::None, 8));

        seal_buffer(&mut buffer, &header, IntegrityCheck::None);
        assert_eq!(buffer.payload_slice(), expected.as_ref());

        open_buffer(&mut buffer, &header);
        assert_eq!(buffer.payload_slice(), b"body");
    }
}
