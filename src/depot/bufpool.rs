#![forbid(unsafe_code)]

//! A bounded pool of block-sized metadata buffers.
//!
//! Scrubbing claims one buffer per slab; slabs beyond the pool size park
//! as waiter tags. Releasing a buffer hands it to the oldest parked tag
//! and returns the pair to the caller, which runs that tag's work. The
//! dispatch is caller-driven so suspended work stays a plain value
//! instead of a captured callback.

use crate::primitives::waitq::WaitQueue;
use crate::types::BLOCK_SIZE;

/// One reusable block buffer.
#[derive(Debug)]
pub struct MetadataBuffer {
    data: Vec<u8>,
}

impl MetadataBuffer {
    fn new() -> Self {
        Self {
            data: vec![0u8; BLOCK_SIZE],
        }
    }

    /// The buffer contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The buffer contents, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// The pool itself, parking waiter tags of type `T` when exhausted.
#[derive(Debug)]
pub struct BufferPool<T> {
    free: Vec<MetadataBuffer>,
    waiters: WaitQueue<T>,
    total: usize,
}

impl<T> BufferPool<T> {
    /// Preallocates `size` buffers.
    pub fn new(size: usize) -> Self {
        Self {
            free: (0..size).map(|_| MetadataBuffer::new()).collect(),
            waiters: WaitQueue::new(),
            total: size,
        }
    }

    /// Total buffers owned by the pool.
    pub fn size(&self) -> usize {
        self.total
    }

    /// Buffers currently available.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Tags parked waiting for a buffer.
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Takes a buffer for `tag`, or parks the tag until one is released.
    pub fn acquire_or_wait(&mut self, tag: T) -> Option<MetadataBuffer> {
        match self.free.pop() {
            Some(buffer) => Some(buffer),
            None => {
                self.waiters.enqueue(tag);
                None
            }
        }
    }

    /// Returns a buffer. When a tag is parked, the buffer is handed to
    /// the oldest one and the pair comes back for the caller to run;
    /// otherwise the buffer rejoins the free list.
    pub fn release(&mut self, buffer: MetadataBuffer) -> Option<(T, MetadataBuffer)> {
        let mut handoff = None;
        self.waiters.notify_next(|tag| handoff = Some(tag));
        match handoff {
            Some(tag) => Some((tag, buffer)),
            None => {
                self.free.push(buffer);
                None
            }
        }
    }

    /// Drops every parked tag. Returns how many were aborted.
    pub fn abort_waiters(&mut self) -> usize {
        self.waiters.notify_all(|_| {})
    }
}
