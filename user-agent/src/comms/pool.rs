//! Reusable fixed-size receive buffers.
//!
//! Every buffer is sized for one full port frame (header + largest variant).
//! A [`PooledBuffer`] is owned by exactly one holder at a time
//! (receiver → job queue → worker) and goes back to the free list when it is
//! dropped, so a burst of frames costs no allocation once the pool is warm.

use crossbeam::queue::SegQueue;
use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

pub struct BufferPool {
    free: SegQueue<Box<[u8]>>,
    buf_size: usize,
    allocated: AtomicUsize,
}

impl BufferPool {
    pub fn new(buf_size: usize) -> Arc<Self> {
        Arc::new(Self {
            free: SegQueue::new(),
            buf_size,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Take a buffer from the free list, allocating only when it is empty.
    pub fn lease(self: &Arc<Self>) -> PooledBuffer {
        let buf = self.free.pop().unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buf_size].into_boxed_slice()
        });
        PooledBuffer { buf: Some(buf), pool: Arc::clone(self) }
    }

    pub fn buffer_size(&self) -> usize {
        self.buf_size
    }

    /// Buffers ever allocated; equals the peak number of concurrent leases.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }

    fn release(&self, mut buf: Box<[u8]>) {
        // stale bytes must never be read as part of the next frame
        buf.fill(0);
        self.free.push(buf);
    }
}

/// Exclusive lease on one pool buffer.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
