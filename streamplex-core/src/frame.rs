//! Frames: ordered buffers presented as one logical message
//!
//! Reads address the concatenated payloads; writes address the concatenated
//! writable capacity, so a frame is filled front to back and each buffer's
//! payload grows as data lands in it. [`FrameReader`] and [`FrameWriter`]
//! walk buffer boundaries transparently through `std::io`.

use crate::buffer::Buffer;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;

/// One logical message made of exclusively owned buffers
#[derive(Debug, Default)]
pub struct Frame {
    buffers: Vec<Buffer>,
    error: u32,
    flags: u32,
}

impl Frame {
    /// Create an empty frame with no buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frame backed by a single unpooled buffer of `size` bytes
    pub fn with_capacity(size: usize) -> Self {
        Self::from_buffers(vec![Buffer::new(size)])
    }

    /// Create a frame owning `buffers`
    pub fn from_buffers(buffers: Vec<Buffer>) -> Self {
        Self {
            buffers,
            error: 0,
            flags: 0,
        }
    }

    /// Create a frame holding a copy of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buffer = Buffer::new(data.len());
        buffer.write(0, data);
        Self::from_buffers(vec![buffer])
    }

    /// Append a buffer; the frame takes ownership
    pub fn push_buffer(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    /// Buffers in order
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Buffers in order, mutable
    pub fn buffers_mut(&mut self) -> &mut [Buffer] {
        &mut self.buffers
    }

    /// Give up the buffers, transferring their ownership to the caller
    pub fn into_buffers(self) -> Vec<Buffer> {
        self.buffers
    }

    /// Number of buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Total payload: sum of each buffer's payload
    pub fn payload(&self) -> usize {
        self.buffers.iter().map(Buffer::payload).sum()
    }

    /// Total writable capacity
    pub fn capacity(&self) -> usize {
        self.buffers.iter().map(Buffer::capacity).sum()
    }

    /// Bytes that can still be written
    pub fn available(&self) -> usize {
        self.buffers.iter().map(Buffer::available).sum()
    }

    /// True when the frame carries no payload
    pub fn is_empty(&self) -> bool {
        self.payload() == 0
    }

    /// Frame-level error word (non-zero means the data is not trustworthy)
    pub fn error(&self) -> u32 {
        self.error
    }

    /// Set the frame-level error word
    pub fn set_error(&mut self, error: u32) {
        self.error = error;
    }

    /// Frame-level flag word
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Set the frame-level flag word
    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    /// Copy payload starting at logical `offset` into `dst`
    ///
    /// Returns the number of bytes copied, short at the end of the payload.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let mut skip = offset;
        let mut copied = 0;
        for buffer in &self.buffers {
            if copied == dst.len() {
                break;
            }
            let payload = buffer.payload();
            if skip >= payload {
                skip -= payload;
                continue;
            }
            copied += buffer.read(skip, &mut dst[copied..]);
            skip = 0;
        }
        copied
    }

    /// Copy `src` into the frame starting at logical `offset`
    ///
    /// Returns the number of bytes written, short when capacity runs out.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> usize {
        let mut skip = offset;
        let mut written = 0;
        for buffer in &mut self.buffers {
            if written == src.len() {
                break;
            }
            let capacity = buffer.capacity();
            if skip >= capacity {
                skip -= capacity;
                continue;
            }
            written += buffer.write(skip, &src[written..]);
            skip = 0;
        }
        written
    }

    /// Set the total payload, filling buffers front to back
    pub fn set_payload(&mut self, len: usize) {
        let mut remaining = len;
        for buffer in &mut self.buffers {
            let take = remaining.min(buffer.capacity());
            buffer.set_payload(take);
            remaining -= take;
        }
    }

    /// Payload slices of each buffer, in order, without copying
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.buffers
            .iter()
            .map(Buffer::payload_slice)
            .filter(|chunk| !chunk.is_empty())
    }

    /// Copy the whole payload into one contiguous `Bytes`
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.payload());
        for chunk in self.chunks() {
            out.put_slice(chunk);
        }
        out.freeze()
    }

    /// Sequential reader over the payload
    pub fn reader(&self) -> FrameReader<'_> {
        FrameReader {
            frame: self,
            index: 0,
            offset: 0,
            position: 0,
        }
    }

    /// Sequential writer over the capacity, starting at offset 0
    pub fn writer(&mut self) -> FrameWriter<'_> {
        FrameWriter {
            frame: self,
            index: 0,
            offset: 0,
            position: 0,
        }
    }
}

/// Read cursor crossing buffer boundaries
#[derive(Debug)]
pub struct FrameReader<'a> {
    frame: &'a Frame,
    index: usize,
    offset: usize,
    position: usize,
}

impl FrameReader<'_> {
    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.position
    }
}

impl io::Read for FrameReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(buffer) = self.frame.buffers.get(self.index) else {
                break;
            };
            if self.offset >= buffer.payload() {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let n = buffer.read(self.offset, &mut buf[copied..]);
            self.offset += n;
            copied += n;
        }
        self.position += copied;
        Ok(copied)
    }
}

/// Write cursor crossing buffer boundaries
#[derive(Debug)]
pub struct FrameWriter<'a> {
    frame: &'a mut Frame,
    index: usize,
    offset: usize,
    position: usize,
}

impl FrameWriter<'_> {
    /// Bytes written so far
    pub fn position(&self) -> usize {
        self.position
    }
}

impl io::Write for FrameWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let Some(buffer) = self.frame.buffers.get_mut(self.index) else {
                break;
            };
            if self.offset >= buffer.capacity() {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let n = buffer.write(self.offset, &buf[written..]);
            self.offset += n;
            written += n;
        }
        self.position += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn three_buffer_frame() -> Frame {
        let mut frame = Frame::new();
        for _ in 0..3 {
            let mut buffer = Buffer::new(8);
            buffer.set_head_room(2);
            frame.push_buffer(buffer);
        }
        frame
    }

    #[test]
    fn test_write_crosses_buffers() {
        let mut frame = three_buffer_frame();
        assert_eq!(frame.capacity(), 18);

        let data: Vec<u8> = (0..15).collect();
        assert_eq!(frame.write_at(0, &data), 15);
        assert_eq!(frame.payload(), 15);
        assert_eq!(frame.buffers()[0].payload(), 6);
        assert_eq!(frame.buffers()[2].payload(), 3);

        let mut out = vec![0u8; 20];
        assert_eq!(frame.read_at(0, &mut out), 15);
        assert_eq!(&out[..15], data.as_slice());
    }

    #[test]
    fn test_short_write_when_full() {
        let mut frame = three_buffer_frame();
        assert_eq!(frame.write_at(0, &[1u8; 40]), 18);
        assert_eq!(frame.available(), 0);
        assert_eq!(frame.write_at(18, b"x"), 0);
    }

    #[test]
    fn test_read_at_offset() {
        let mut frame = three_buffer_frame();
        frame.write_at(0, b"abcdefghijklmnop");

        let mut out = [0u8; 4];
        assert_eq!(frame.read_at(5, &mut out), 4);
        assert_eq!(&out, b"fghi");
        assert_eq!(frame.read_at(14, &mut out), 2);
        assert_eq!(&out[..2], b"op");
        assert_eq!(frame.read_at(16, &mut out), 0);
    }

    #[test]
    fn test_reader_and_writer_cursors() {
        let mut frame = three_buffer_frame();
        {
            let mut writer = frame.writer();
            writer.write_all(b"hello ").unwrap();
            writer.write_all(b"cursor world").unwrap();
            assert_eq!(writer.position(), 18);
            assert_eq!(writer.write(b"!").unwrap(), 0);
        }

        let mut text = String::new();
        frame.reader().read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello cursor world");
    }

    #[test]
    fn test_set_payload_and_to_bytes() {
        let mut frame = three_buffer_frame();
        frame.write_at(0, &[9u8; 18]);
        frame.set_payload(10);
        assert_eq!(frame.payload(), 10);
        assert_eq!(frame.to_bytes().len(), 10);
        assert_eq!(frame.chunks().count(), 2);
    }

    #[test]
    fn test_from_slice() {
        let frame = Frame::from_slice(b"payload");
        assert_eq!(frame.payload(), 7);
        assert_eq!(frame.to_bytes().as_ref(), b"payload");
        assert!(!frame.is_empty());
        assert!(Frame::new().is_empty());
    }

    #[test]
    fn test_error_and_flags() {
        let mut frame = Frame::new();
        frame.set_error(crate::constants::ERR_CRC);
        frame.set_flags(0x42);
        assert_eq!(frame.error(), crate::constants::ERR_CRC);
        assert_eq!(frame.flags(), 0x42);
    }
}
