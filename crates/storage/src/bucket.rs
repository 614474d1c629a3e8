use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use common::GcMark;
use serde::Serialize;

/// Per-bucket state of a cache device.
///
/// Fields are atomics so the collector's key predicate and staleness checks
/// can read them without the bucket lock; every mutation other than pinning
/// goes through [`crate::BucketGuard`].
#[derive(Debug, Default)]
pub struct Bucket {
    gen: AtomicU8,
    pin: AtomicU32,
    sectors_used: AtomicU32,
    mark: AtomicU8,
    moving: AtomicBool,
}

impl Bucket {
    pub fn gen(&self) -> u8 {
        self.gen.load(Ordering::Acquire)
    }

    pub fn sectors_used(&self) -> u32 {
        self.sectors_used.load(Ordering::Acquire)
    }

    pub fn mark(&self) -> GcMark {
        GcMark::from_raw(self.mark.load(Ordering::Acquire))
    }

    pub fn pin_count(&self) -> u32 {
        self.pin.load(Ordering::Acquire)
    }

    /// Whether the last selection pass chose this bucket for evacuation.
    pub fn is_moving(&self) -> bool {
        self.moving.load(Ordering::Acquire)
    }

    pub fn pin(&self) {
        self.pin.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let _ = self
            .pin
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pins| pins.checked_sub(1));
    }

    pub(crate) fn set_moving(&self, moving: bool) {
        self.moving.store(moving, Ordering::Release);
    }

    pub(crate) fn set_mark(&self, mark: GcMark) {
        self.mark.store(mark.to_raw(), Ordering::Release);
    }

    pub(crate) fn set_sectors_used(&self, sectors: u32) {
        self.sectors_used.store(sectors, Ordering::Release);
    }

    pub(crate) fn bump_gen(&self) -> u8 {
        self.gen.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn snapshot(&self, index: u64) -> BucketSnapshot {
        BucketSnapshot {
            index,
            gen: self.gen(),
            sectors_used: self.sectors_used(),
            mark: self.mark(),
            pin_count: self.pin_count(),
            moving: self.is_moving(),
        }
    }
}

/// Point-in-time copy of a bucket, for reporting and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    pub index: u64,
    pub gen: u8,
    pub sectors_used: u32,
    pub mark: GcMark,
    pub pin_count: u32,
    pub moving: bool,
}

/// Usage and classification installed by the full collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub sectors_used: u32,
    pub mark: GcMark,
}

impl BucketState {
    pub fn new(sectors_used: u32, mark: GcMark) -> Self {
        Self { sectors_used, mark }
    }
}
