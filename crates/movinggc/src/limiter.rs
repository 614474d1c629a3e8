use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{GcError, GcResult};

#[derive(Debug, Default)]
struct LimiterCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    peak: AtomicUsize,
}

/// Counting limiter on relocations in flight.
///
/// Cloning shares the same slots.
#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<LimiterCounters>,
}

/// One admission slot. Dropping it returns the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    counters: Arc<LimiterCounters>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        // Slot first, so `released` never runs ahead of `in_flight`.
        drop(self.permit.take());
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}

impl AdmissionLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(LimiterCounters::default()),
        }
    }

    fn granted(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        self.counters
            .peak
            .fetch_max(self.in_flight(), Ordering::Relaxed);
        AdmissionPermit {
            permit: Some(permit),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> GcResult<AdmissionPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GcError::LimiterClosed)?;
        Ok(self.granted(permit))
    }

    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.granted(permit))
    }

    /// Wake pending acquirers with an error and refuse new ones.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Highest number of slots held at once since creation.
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak.load(Ordering::Relaxed)
    }

    pub fn acquired(&self) -> u64 {
        self.counters.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.counters.released.load(Ordering::Relaxed)
    }
}
