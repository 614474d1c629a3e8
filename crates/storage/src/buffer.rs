use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use common::PAGE_SIZE;
use serde::Serialize;

use crate::error::BufferError;

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    outstanding: AtomicUsize,
    allocations: AtomicU64,
    failures: AtomicU64,
}

/// Bounded pool of I/O pages.
///
/// Every [`PageBuf`] hands its pages back when dropped.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(capacity_pages: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity: capacity_pages,
                outstanding: AtomicUsize::new(0),
                allocations: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn alloc(&self, pages: usize) -> Result<PageBuf, BufferError> {
        let inner = &self.inner;
        let reserved = inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(pages).filter(|&total| total <= inner.capacity)
            });

        match reserved {
            Ok(_) => {
                inner.allocations.fetch_add(1, Ordering::Relaxed);
                Ok(PageBuf {
                    data: BytesMut::zeroed(pages * PAGE_SIZE),
                    pages,
                    pool: Arc::clone(inner),
                })
            }
            Err(used) => {
                inner.failures.fetch_add(1, Ordering::Relaxed);
                Err(BufferError::Exhausted {
                    requested: pages,
                    available: inner.capacity.saturating_sub(used),
                })
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Pages currently handed out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            capacity: self.inner.capacity,
            outstanding: self.outstanding(),
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferPoolStats {
    pub capacity: usize,
    pub outstanding: usize,
    pub allocations: u64,
    pub failures: u64,
}

/// Pages borrowed from a [`BufferPool`].
#[derive(Debug)]
pub struct PageBuf {
    data: BytesMut,
    pages: usize,
    pool: Arc<PoolInner>,
}

impl PageBuf {
    pub fn pages(&self) -> usize {
        self.pages
    }
}

impl Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PageBuf {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(self.pages, Ordering::AcqRel);
    }
}
