//! Ordered byte-buffer queue and a small free-list buffer pool.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// Ordered list of byte chunks with total-remaining accounting.
///
/// Empty chunks are never stored, so `len()` is the number of chunks that
/// still hold data.
#[derive(Debug, Default, Clone)]
pub struct BufferQueue {
    chunks: VecDeque<Bytes>,
    remaining: usize,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: Bytes) -> Self {
        let mut queue = Self::new();
        queue.push_back(data);
        queue
    }

    /// Total number of bytes across all chunks.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Number of chunks.
    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn push_back(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.remaining += data.len();
        self.chunks.push_back(data);
    }

    pub fn push_front(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.remaining += data.len();
        self.chunks.push_front(data);
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.remaining -= chunk.len();
        Some(chunk)
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Moves every chunk of `other` to the back of this queue.
    pub fn append(&mut self, other: &mut BufferQueue) {
        self.remaining += other.remaining;
        self.chunks.append(&mut other.chunks);
        other.remaining = 0;
    }

    /// Coalesces all chunks into one and leaves it as the only chunk.
    ///
    /// Returns a cheap handle to the merged bytes.
    pub fn merge_all(&mut self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut merged = BytesMut::with_capacity(self.remaining);
                for chunk in self.chunks.drain(..) {
                    merged.extend_from_slice(&chunk);
                }
                let merged = merged.freeze();
                self.chunks.push_back(merged.clone());
                merged
            }
        }
    }

    /// Drops `count` bytes from the front of the queue.
    pub fn advance(&mut self, mut count: usize) {
        assert!(
            count <= self.remaining,
            "cannot advance past end of queue: {} > {}",
            count,
            self.remaining
        );
        self.remaining -= count;
        while count > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() > count {
                front.advance(count);
                break;
            }
            count -= front.len();
            self.chunks.pop_front();
        }
    }

    /// Removes and returns every byte in the queue as one contiguous buffer.
    pub fn take_all(&mut self) -> Bytes {
        let merged = self.merge_all();
        self.clear();
        merged
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.remaining = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }
}

impl From<Bytes> for BufferQueue {
    fn from(data: Bytes) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&[u8]> for BufferQueue {
    fn from(data: &[u8]) -> Self {
        Self::from_bytes(Bytes::copy_from_slice(data))
    }
}

const DEFAULT_MAX_POOLED_BUFFERS: usize = 16;
const DEFAULT_MAX_POOLED_SIZE: usize = 256 * 1024;

/// Free-list of scratch buffers.
///
/// `obtain` hands out a zero-filled buffer of exactly the requested length,
/// reusing a pooled allocation with enough capacity when one exists.
#[derive(Debug)]
pub struct BufferPool {
    free_list: Vec<Vec<u8>>,
    max_buffers: usize,
    max_buffer_size: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED_BUFFERS, DEFAULT_MAX_POOLED_SIZE)
    }
}

impl BufferPool {
    pub fn new(max_buffers: usize, max_buffer_size: usize) -> Self {
        Self {
            free_list: Vec::new(),
            max_buffers,
            max_buffer_size,
        }
    }

    pub fn obtain(&mut self, size: usize) -> Vec<u8> {
        let found = self
            .free_list
            .iter()
            .position(|buf| buf.capacity() >= size);
        let mut buf = match found {
            Some(index) => self.free_list.swap_remove(index),
            None => Vec::with_capacity(size),
        };
        buf.clear();
        buf.resize(size, 0);
        buf
    }

    pub fn reclaim(&mut self, buf: Vec<u8>) {
        if buf.capacity() == 0
            || buf.capacity() > self.max_buffer_size
            || self.free_list.len() >= self.max_buffers
        {
            return;
        }
        self.free_list.push(buf);
    }

    pub fn pooled_count(&self) -> usize {
        self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_accounting() {
        let mut queue = BufferQueue::new();
        queue.push_back(Bytes::from_static(b"hello"));
        queue.push_back(Bytes::new());
        queue.push_back(Bytes::from_static(b" world"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remaining(), 11);

        queue.push_front(Bytes::new());
        assert_eq!(queue.len(), 2);

        let first = queue.pop_front().unwrap();
        assert_eq!(&first[..], b"hello");
        assert_eq!(queue.remaining(), 6);
    }

    #[test]
    fn test_merge_all_leaves_single_chunk() {
        let mut queue = BufferQueue::new();
        queue.push_back(Bytes::from_static(b"ab"));
        queue.push_back(Bytes::from_static(b"cd"));
        queue.push_back(Bytes::from_static(b"ef"));

        let merged = queue.merge_all();
        assert_eq!(&merged[..], b"abcdef");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remaining(), 6);
    }

    #[test]
    fn test_advance_across_chunks() {
        let mut queue = BufferQueue::new();
        queue.push_back(Bytes::from_static(b"abc"));
        queue.push_back(Bytes::from_static(b"defg"));
        queue.advance(4);
        assert_eq!(queue.remaining(), 3);
        assert_eq!(queue.len(), 1);
        assert_eq!(&queue.take_all()[..], b"efg");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_append_moves_chunks() {
        let mut a = BufferQueue::from(&b"123"[..]);
        let mut b = BufferQueue::from(&b"456"[..]);
        a.append(&mut b);
        assert!(b.is_empty());
        assert_eq!(&a.take_all()[..], b"123456");
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let mut pool = BufferPool::new(2, 1024);
        let buf = pool.obtain(100);
        assert_eq!(buf.len(), 100);
        pool.reclaim(buf);
        assert_eq!(pool.pooled_count(), 1);

        let buf = pool.obtain(50);
        assert_eq!(buf.len(), 50);
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(pool.pooled_count(), 0);

        pool.reclaim(vec![0u8; 4096]);
        assert_eq!(pool.pooled_count(), 0);
    }
}
