//! Byte arena for connection buffers.
//!
//! One contiguous block is allocated at startup and carved into fixed-size
//! slices, one per operation context. Each slice holds a receive region
//! followed by a send region:
//!
//! ```text
//! | recv 0 | send 0 | recv 1 | send 1 | ... | recv n-1 | send n-1 |
//! ```
//!
//! Slices are handed out in ascending order and never move. The block is
//! only released once every slice has been dropped.

use bytes::BytesMut;
use thiserror::Error;

/// Errors raised while sizing the arena.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// `(receive_size + send_size) * slice_count` does not fit in memory.
    #[error("arena of {slices} slices x {slice_size} bytes overflows addressable memory")]
    TooLarge { slices: usize, slice_size: usize },
    /// A slice must have room to receive and to send.
    #[error("receive and send sizes must be non-zero (got {receive}/{send})")]
    EmptySlice { receive: usize, send: usize },
}

/// Owner of the pre-allocated block.
pub struct BufferArena {
    /// Not yet assigned tail of the block.
    unassigned: BytesMut,
    /// Offset of `unassigned` within the original block.
    next_offset: usize,
    receive_size: usize,
    send_size: usize,
    slice_count: usize,
    assigned: usize,
}

impl BufferArena {
    /// Allocate the block for `slice_count` slices.
    pub fn new(slice_count: usize, receive_size: usize, send_size: usize) -> Result<Self, ArenaError> {
        if receive_size == 0 || send_size == 0 {
            return Err(ArenaError::EmptySlice {
                receive: receive_size,
                send: send_size,
            });
        }

        let slice_size = receive_size
            .checked_add(send_size)
            .ok_or(ArenaError::TooLarge {
                slices: slice_count,
                slice_size: usize::MAX,
            })?;
        let total = slice_size
            .checked_mul(slice_count)
            .filter(|&total| total <= isize::MAX as usize)
            .ok_or(ArenaError::TooLarge {
                slices: slice_count,
                slice_size,
            })?;

        Ok(Self {
            unassigned: BytesMut::zeroed(total),
            next_offset: 0,
            receive_size,
            send_size,
            slice_count,
            assigned: 0,
        })
    }

    /// Carve out the next slice, or `None` once the block is used up.
    pub fn assign(&mut self) -> Option<Slice> {
        if self.assigned == self.slice_count {
            return None;
        }

        let buf = self.unassigned.split_to(self.slice_size());
        let offset = self.next_offset;
        self.next_offset += self.slice_size();
        self.assigned += 1;

        Some(Slice {
            buf,
            offset: Some(offset),
            receive_size: self.receive_size,
        })
    }

    /// Build a slice outside the block, used when the pool has to grow.
    pub fn detached(&self) -> Slice {
        Slice {
            buf: BytesMut::zeroed(self.slice_size()),
            offset: None,
            receive_size: self.receive_size,
        }
    }

    /// Size of one slice (receive + send).
    pub fn slice_size(&self) -> usize {
        self.receive_size + self.send_size
    }

    pub fn receive_size(&self) -> usize {
        self.receive_size
    }

    pub fn send_size(&self) -> usize {
        self.send_size
    }

    /// Total bytes in the block.
    pub fn total_size(&self) -> usize {
        self.slice_size() * self.slice_count
    }

    /// Number of slices still available.
    pub fn remaining(&self) -> usize {
        self.slice_count - self.assigned
    }
}

/// Exclusive handle to one receive/send region.
#[derive(Debug)]
pub struct Slice {
    buf: BytesMut,
    /// Start within the arena block; `None` for detached slices.
    offset: Option<usize>,
    receive_size: usize,
}

impl Slice {
    /// Arena offset of the receive region.
    pub fn receive_offset(&self) -> Option<usize> {
        self.offset
    }

    /// Arena offset of the send region.
    pub fn send_offset(&self) -> Option<usize> {
        self.offset.map(|offset| offset + self.receive_size)
    }

    pub fn receive_len(&self) -> usize {
        self.receive_size
    }

    pub fn send_len(&self) -> usize {
        self.buf.len() - self.receive_size
    }

    pub fn receive(&self) -> &[u8] {
        &self.buf[..self.receive_size]
    }

    pub fn receive_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.receive_size]
    }

    pub fn send(&self) -> &[u8] {
        &self.buf[self.receive_size..]
    }

    pub fn send_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.receive_size..]
    }

    pub fn is_detached(&self) -> bool {
        self.offset.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slices_are_disjoint_and_ordered() {
        let mut arena = BufferArena::new(3, 16, 32).unwrap();
        assert_eq!(arena.total_size(), 3 * 48);

        let a = arena.assign().unwrap();
        let b = arena.assign().unwrap();
        let c = arena.assign().unwrap();
        assert!(arena.assign().is_none());
        assert_eq!(arena.remaining(), 0);

        assert_eq!(a.receive_offset(), Some(0));
        assert_eq!(a.send_offset(), Some(16));
        assert_eq!(b.receive_offset(), Some(48));
        assert_eq!(b.send_offset(), Some(64));
        assert_eq!(c.receive_offset(), Some(96));

        for slice in [&a, &b, &c] {
            assert_eq!(slice.receive_len(), 16);
            assert_eq!(slice.send_len(), 32);
        }
    }

    #[test]
    fn test_writes_stay_in_their_slice() {
        let mut arena = BufferArena::new(2, 4, 4).unwrap();
        let mut a = arena.assign().unwrap();
        let mut b = arena.assign().unwrap();

        a.receive_mut().copy_from_slice(b"aaaa");
        a.send_mut().copy_from_slice(b"AAAA");
        b.receive_mut().copy_from_slice(b"bbbb");

        assert_eq!(a.receive(), b"aaaa");
        assert_eq!(b.receive(), b"bbbb");
        assert!(b.send_mut().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_oversized_arena_is_rejected() {
        let err = BufferArena::new(usize::MAX / 2, 1024, 1024).err().unwrap();
        assert!(matches!(err, ArenaError::TooLarge { .. }));

        let err = BufferArena::new(4, 0, 1024).err().unwrap();
        assert!(matches!(err, ArenaError::EmptySlice { .. }));
    }

    #[test]
    fn test_detached_slice() {
        let arena = BufferArena::new(1, 8, 8).unwrap();
        let slice = arena.detached();
        assert!(slice.is_detached());
        assert_eq!(slice.send_offset(), None);
        assert_eq!(slice.send_len(), 8);
        // Detached slices do not consume the block.
        assert_eq!(arena.remaining(), 1);
    }
}
