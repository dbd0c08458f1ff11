//! Pooled data segments.
//!
//! A [`DataSegment`] is one logical message. Its storage is rented from a
//! shared [`BufferPool`] and handed back when the segment is released or
//! dropped, so every exit path (success, validation failure, cancellation)
//! returns the buffer exactly once.

use crate::checksum::checksum;
use crate::framing::FRAME_DELIMITER;
use crossbeam::queue::ArrayQueue;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Byte values a random payload may contain: everything but the delimiter
const PAYLOAD_ALPHABET: [u8; 255] = payload_alphabet();

const fn payload_alphabet() -> [u8; 255] {
    let mut alphabet = [0u8; 255];
    let mut value = 0usize;
    let mut next = 0usize;
    while value < 256 {
        if value as u8 != FRAME_DELIMITER {
            alphabet[next] = value as u8;
            next += 1;
        }
        value += 1;
    }
    alphabet
}

/// Thread-safe pool of reusable byte buffers
///
/// Rent and return are lock-free. Buffers returned while the pool is full,
/// or whose capacity grew beyond `max_retained_capacity`, are dropped.
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    max_retained_capacity: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a pool retaining at most `max_buffers` idle buffers
    pub fn new(max_buffers: usize, max_retained_capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(max_buffers.max(1)),
            max_retained_capacity,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Pool sized for `workers` concurrent connections exchanging
    /// payloads up to `max_buffer_length` bytes
    pub fn for_workers(workers: usize, max_buffer_length: usize) -> Arc<Self> {
        Arc::new(Self::new(workers.max(1) * 8, max_buffer_length.max(64)))
    }

    fn rent(&self, length: usize) -> Vec<u8> {
        let mut buffer = self.buffers.pop().unwrap_or_default();
        buffer.clear();
        buffer.resize(length, 0);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        buffer
    }

    fn give_back(&self, buffer: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if buffer.capacity() <= self.max_retained_capacity {
            // A full pool just drops the buffer.
            let _ = self.buffers.push(buffer);
        }
    }

    /// Number of buffers currently rented and not yet returned
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Number of idle buffers ready for reuse
    pub fn idle(&self) -> usize {
        self.buffers.len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// One logical message backed by pooled storage
pub struct DataSegment {
    // None only after the buffer went back to the pool.
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl DataSegment {
    /// Rent a zero-filled segment of exactly `length` bytes
    pub fn with_length(pool: &Arc<BufferPool>, length: usize) -> Self {
        Self {
            buffer: Some(pool.rent(length)),
            pool: Arc::clone(pool),
        }
    }

    /// Zero-length end-of-stream sentinel
    pub fn empty(pool: &Arc<BufferPool>) -> Self {
        Self::with_length(pool, 0)
    }

    /// Segment of `length` pseudo-random bytes, never containing the delimiter
    pub fn random_with_length<R: Rng + ?Sized>(
        pool: &Arc<BufferPool>,
        rng: &mut R,
        length: usize,
    ) -> Self {
        let mut segment = Self::with_length(pool, length);
        for byte in segment.as_bytes_mut() {
            *byte = PAYLOAD_ALPHABET[rng.gen_range(0..PAYLOAD_ALPHABET.len())];
        }
        segment
    }

    /// Random data segment with a length uniformly drawn from `1..=max_length`.
    ///
    /// Zero length is reserved for the sentinel.
    pub fn random<R: Rng + ?Sized>(pool: &Arc<BufferPool>, rng: &mut R, max_length: usize) -> Self {
        let length = rng.gen_range(1..=max_length.max(1));
        Self::random_with_length(pool, rng, length)
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live payload bytes, never including pool slack
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }

    /// Checksum of the live payload bytes
    pub fn checksum(&self) -> u64 {
        checksum(self.as_bytes())
    }

    /// Return the backing buffer to the pool
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DataSegment {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(buffer);
        }
    }
}

impl fmt::Debug for DataSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSegment")
            .field("length", &self.len())
            .field("checksum", &self.checksum())
            .finish()
    }
}
