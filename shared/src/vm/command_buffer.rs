//! Ring buffer for batched one-way calls
//!
//! Frequent low-latency calls (sound and render commands) skip the channel
//! round trip: the module appends them to a ring and the engine drains it.
//! The writer always stays [`SAFETY_OFFSET`] bytes ahead of the reader so a
//! full ring and an empty ring are distinguishable. Both pointers advance in
//! multiples of 4 bytes and reads and writes wrap around the end.
//!
//! Records are framed as a little-endian payload length, the message id and
//! the payload. An in-process module shares one ring with the engine through
//! [`SharedCommandBuffer`].

use super::Frame;
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

pub const SAFETY_OFFSET: usize = 4;

/// Length and id words in front of every record
pub const RECORD_HEADER: usize = 8;

/// Default ring size for a game module
pub const DEFAULT_SIZE: usize = 64 * 1024;

pub type SharedCommandBuffer = Arc<Mutex<CommandBuffer>>;

pub fn shared_command_buffer(size: usize) -> SharedCommandBuffer {
    Arc::new(Mutex::new(CommandBuffer::new(size)))
}

#[derive(Debug, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl CommandBuffer {
    /// Creates a ring of `size` bytes; `size` should be a multiple of 4
    pub fn new(size: usize) -> Self {
        let size = size.max(2 * SAFETY_OFFSET);
        Self {
            data: vec![0; size],
            reader: 0,
            writer: SAFETY_OFFSET,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn reset(&mut self) {
        self.reader = 0;
        self.writer = SAFETY_OFFSET;
    }

    fn normalize(&self, mut offset: usize) -> usize {
        let size = self.size();
        if offset >= size {
            offset -= size;
        }
        if offset >= size {
            offset -= size;
        }
        offset
    }

    fn from_read(&self, mut offset: usize) -> usize {
        if offset < self.reader {
            offset += self.size();
        }
        offset - self.reader
    }

    fn from_write(&self, mut offset: usize) -> usize {
        if offset < self.writer {
            offset += self.size();
        }
        offset - self.writer
    }

    pub fn max_read_len(&self) -> usize {
        self.from_read(self.writer) - SAFETY_OFFSET
    }

    pub fn max_write_len(&self) -> usize {
        self.from_write(self.reader) - SAFETY_OFFSET
    }

    pub fn can_read(&self, len: usize) -> bool {
        self.max_read_len() >= len
    }

    pub fn can_write(&self, len: usize) -> bool {
        self.max_write_len() >= len
    }

    /// Copies `out.len()` bytes starting `offset` bytes past the read pointer
    pub fn read(&self, out: &mut [u8], offset: usize) {
        self.internal_read(self.reader + offset + SAFETY_OFFSET, out);
    }

    /// Writes `input` starting `offset` bytes past the write pointer
    pub fn write(&mut self, input: &[u8], offset: usize) {
        self.internal_write(self.writer + offset, input);
    }

    pub fn advance_read(&mut self, len: usize) {
        let len = (len + 3) & !3;
        if len > self.size() {
            warn!("Command buffer read advance of {} exceeds size {}", len, self.size());
        }
        self.reader = self.normalize(self.reader + len);
    }

    pub fn advance_write(&mut self, len: usize) {
        let len = (len + 3) & !3;
        if len > self.size() {
            warn!("Command buffer write advance of {} exceeds size {}", len, self.size());
        }
        self.writer = self.normalize(self.writer + len);
    }

    /// Appends one record; returns false when the ring has no room for it
    pub fn push_frame(&mut self, frame: &Frame) -> bool {
        let len = RECORD_HEADER + frame.payload.len();
        if !self.can_write((len + 3) & !3) {
            return false;
        }
        self.write(&(frame.payload.len() as u32).to_le_bytes(), 0);
        self.write(&frame.id.to_le_bytes(), 4);
        self.write(&frame.payload, RECORD_HEADER);
        self.advance_write(len);
        true
    }

    /// Takes the oldest complete record out of the ring
    pub fn pop_frame(&mut self) -> Option<Frame> {
        if !self.can_read(RECORD_HEADER) {
            return None;
        }
        let mut header = [0u8; RECORD_HEADER];
        self.read(&mut header, 0);
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if !self.can_read(RECORD_HEADER + len) {
            warn!("Command buffer record {:#x} claims {} bytes past the write pointer", id, len);
            return None;
        }
        let mut payload = vec![0; len];
        self.read(&mut payload, RECORD_HEADER);
        self.advance_read(RECORD_HEADER + len);
        Some(Frame { id, payload })
    }

    fn internal_read(&self, offset: usize, out: &mut [u8]) {
        let offset = self.normalize(offset);
        let until_end = self.size() - offset;
        if out.len() >= until_end {
            let (head, tail) = out.split_at_mut(until_end);
            head.copy_from_slice(&self.data[offset..]);
            tail.copy_from_slice(&self.data[..tail.len()]);
        } else {
            out.copy_from_slice(&self.data[offset..offset + out.len()]);
        }
    }

    fn internal_write(&mut self, offset: usize, input: &[u8]) {
        let offset = self.normalize(offset);
        let until_end = self.size() - offset;
        if input.len() >= until_end {
            let (head, tail) = input.split_at(until_end);
            self.data[offset..].copy_from_slice(head);
            self.data[..tail.len()].copy_from_slice(tail);
        } else {
            self.data[offset..offset + input.len()].copy_from_slice(input);
        }
    }
}
