//! Decode buffer for the unwrap path
//!
//! The handshake engine writes decrypted plaintext into a bounded slice and
//! signals overflow when that slice is too small for the next record. This
//! buffer keeps a linear fill region at the front of a fixed allocation, and
//! grows by a constant factor whenever the engine asks for more room.
//! Capacity never shrinks for the lifetime of the buffer.

use bytes::Bytes;

use crate::buffer_queue::BufferPool;

/// A fixed-capacity write-then-drain buffer that only ever grows.
///
/// # Example
/// ```ignore
/// let mut buf = GrowableBuffer::new(8192);
/// let n = engine_output(buf.write_slice());
/// buf.advance_write(n);
/// let plaintext = buf.take_filled(&mut pool);
/// ```
pub struct GrowableBuffer {
    /// Backing storage; `data.len()` is the capacity.
    data: Vec<u8>,
    /// End offset of filled data (exclusive)
    end: usize,
}

impl GrowableBuffer {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            end: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of filled bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.end]
    }

    /// The unfilled tail, for the engine to write into.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Mark n bytes as written (after writing to `write_slice()`).
    #[inline]
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(
            self.end + n <= self.data.len(),
            "GrowableBuffer advance_write overflow: end={}, n={}, capacity={}",
            self.end,
            n,
            self.data.len()
        );
        self.end += n;
    }

    /// Empties the buffer without releasing its allocation.
    #[inline]
    pub fn clear(&mut self) {
        self.end = 0;
    }

    /// Multiplies the capacity by `factor`, keeping any filled bytes.
    pub fn grow(&mut self, factor: usize) {
        let new_capacity = self.data.len().saturating_mul(factor.max(2)).max(1);
        self.data.resize(new_capacity, 0);
    }

    /// Hands the filled bytes off and swaps in a pooled buffer of the same
    /// capacity. Returns `None` if nothing was written.
    pub fn take_filled(&mut self, pool: &mut BufferPool) -> Option<Bytes> {
        if self.end == 0 {
            return None;
        }
        let replacement = pool.obtain(self.data.len());
        let mut filled = std::mem::replace(&mut self.data, replacement);
        filled.truncate(self.end);
        self.end = 0;
        Some(Bytes::from(filled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer() {
        let buf = GrowableBuffer::new(1024);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(buf.write_slice_len(), 1024);
    }

    #[test]
    fn test_write_and_take() {
        let mut pool = BufferPool::default();
        let mut buf = GrowableBuffer::new(16);
        buf.write_slice()[..5].copy_from_slice(b"hello");
        buf.advance_write(5);
        assert_eq!(buf.as_slice(), b"hello");

        let taken = buf.take_filled(&mut pool).unwrap();
        assert_eq!(&taken[..], b"hello");
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 16);
        assert!(buf.take_filled(&mut pool).is_none());
    }

    #[test]
    fn test_grow_keeps_contents_and_never_shrinks() {
        let mut buf = GrowableBuffer::new(4);
        buf.write_slice().copy_from_slice(b"abcd");
        buf.advance_write(4);
        buf.grow(2);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.as_slice(), b"abcd");

        let mut last = buf.capacity();
        for _ in 0..5 {
            buf.clear();
            buf.grow(2);
            assert!(buf.capacity() > last);
            last = buf.capacity();
        }
    }

    impl GrowableBuffer {
        fn write_slice_len(&self) -> usize {
            self.data.len() - self.end
        }
    }
}
