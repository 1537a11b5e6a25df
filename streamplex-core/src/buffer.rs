//! Contiguous memory blocks with header-room and payload accounting
//!
//! A [`Buffer`] is laid out as:
//!
//! ```text
//! 0            head_room              count          raw - tail_room     raw
//! | header room |   payload (used)    |   available   |    tail room     |
//! ```
//!
//! `count` is the used length including header room. Reads never leave
//! `[head_room, count)`; writes never leave `[head_room, raw - tail_room)`.

use core::fmt;
use std::sync::Arc;

/// Receives a buffer's storage when the buffer is released
///
/// Implemented by pools; an external allocator (a DMA ring, for instance)
/// can implement it to get its memory back.
pub trait BufferOwner: Send + Sync {
    /// Take back storage of a released buffer
    fn return_buffer(&self, data: Vec<u8>);
}

/// A single raw memory block
///
/// Ownership is exclusive: a buffer belongs to one frame (or one holder) at a
/// time and moves on handoff. Dropping it is the only path back to its owner.
pub struct Buffer {
    data: Vec<u8>,
    head_room: usize,
    tail_room: usize,
    count: usize,
    error: u32,
    flags: u32,
    owner: Option<Arc<dyn BufferOwner>>,
}

impl Buffer {
    /// Allocate an unpooled, zeroed buffer of `raw_size` bytes
    pub fn new(raw_size: usize) -> Self {
        Self::from_vec(vec![0u8; raw_size])
    }

    /// Wrap existing storage; the whole vector becomes raw capacity
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            head_room: 0,
            tail_room: 0,
            count: 0,
            error: 0,
            flags: 0,
            owner: None,
        }
    }

    /// Wrap storage that goes back to `owner` when the buffer is released
    pub fn with_owner(data: Vec<u8>, owner: Arc<dyn BufferOwner>) -> Self {
        let mut buffer = Self::from_vec(data);
        buffer.owner = Some(owner);
        buffer
    }

    /// Raw capacity in bytes
    pub fn raw_size(&self) -> usize {
        self.data.len()
    }

    /// Bytes reserved in front of the payload
    pub fn head_room(&self) -> usize {
        self.head_room
    }

    /// Bytes reserved after the writable region
    pub fn tail_room(&self) -> usize {
        self.tail_room
    }

    /// Used length, header room included
    pub fn count(&self) -> usize {
        self.count
    }

    /// Payload bytes beyond the header room
    pub fn payload(&self) -> usize {
        self.count - self.head_room
    }

    /// Largest payload this buffer can hold
    pub fn capacity(&self) -> usize {
        self.raw_size() - self.head_room - self.tail_room
    }

    /// Bytes that can still be written past the current payload
    pub fn available(&self) -> usize {
        self.raw_size() - self.tail_room - self.count
    }

    /// Reserve `head_room` bytes in front of the payload
    ///
    /// Lowering the header room turns those bytes into payload; raising it
    /// above the used length grows the used length to match.
    pub fn set_head_room(&mut self, head_room: usize) {
        self.head_room = head_room.min(self.raw_size() - self.tail_room);
        self.count = self.count.max(self.head_room);
    }

    /// Reserve `tail_room` bytes at the end of the buffer, truncating payload
    /// that would overlap it
    pub fn set_tail_room(&mut self, tail_room: usize) {
        self.tail_room = tail_room.min(self.raw_size() - self.head_room);
        self.count = self.count.min(self.raw_size() - self.tail_room);
    }

    /// Set the payload size, clipped to capacity
    pub fn set_payload(&mut self, len: usize) {
        self.count = self.head_room + len.min(self.capacity());
    }

    /// Copy up to `dst.len()` payload bytes starting at `offset`
    ///
    /// Returns the number of bytes copied; zero past the end of the payload.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> usize {
        let payload = self.payload();
        if offset >= payload {
            return 0;
        }
        let n = dst.len().min(payload - offset);
        let start = self.head_room + offset;
        dst[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }

    /// Copy `src` into the payload region starting at `offset`
    ///
    /// Short writes stop at the writable capacity. Writing past the current
    /// payload extends the used length to `offset + head_room + written`.
    pub fn write(&mut self, offset: usize, src: &[u8]) -> usize {
        let capacity = self.capacity();
        if offset >= capacity {
            return 0;
        }
        let n = src.len().min(capacity - offset);
        let start = self.head_room + offset;
        self.data[start..start + n].copy_from_slice(&src[..n]);
        self.count = self.count.max(start + n);
        n
    }

    /// Payload bytes in place
    pub fn payload_slice(&self) -> &[u8] {
        &self.data[self.head_room..self.count]
    }

    /// Payload bytes in place, mutable
    pub fn payload_slice_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head_room..self.count]
    }

    /// Error word
    pub fn error(&self) -> u32 {
        self.error
    }

    /// Set the error word
    pub fn set_error(&mut self, error: u32) {
        self.error = error;
    }

    /// Flag word
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Set the flag word
    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    /// True when dropping this buffer returns storage to an owner
    pub fn is_pooled(&self) -> bool {
        self.owner.is_some()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.return_buffer(core::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("raw_size", &self.raw_size())
            .field("head_room", &self.head_room)
            .field("tail_room", &self.tail_room)
            .field("count", &self.count)
            .field("error", &self.error)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
