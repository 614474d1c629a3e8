use common::{DeviceId, GcMark};
use serde::Serialize;
use storage::{Bucket, BucketGuard, CacheDevice, StorageError};
use tracing::{debug, instrument};

use crate::heap::{BucketHeap, Candidate};

/// Outcome of selecting evacuation targets on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSelection {
    pub device: DeviceId,
    /// Space the moving-GC reserve can absorb this pass.
    pub reserve_sectors: u64,
    pub heap_capacity: usize,
    /// Buckets that passed the reclaimability filter.
    pub candidates: usize,
    /// Retained candidates dropped to fit the reserve.
    pub trimmed: usize,
    pub buckets_marked: usize,
    pub sectors_to_move: u64,
    /// Marked bucket indices, least used first.
    pub marked: Vec<u64>,
}

/// Whether a bucket is worth evacuating: partially filled live data that
/// nothing is writing into.
pub fn is_reclaimable(bucket: &Bucket, bucket_size: u32) -> bool {
    let used = bucket.sectors_used();
    matches!(bucket.mark(), GcMark::Reclaimable(_))
        && used > 0
        && used < bucket_size
        && bucket.pin_count() == 0
}

/// Picks the least-utilised buckets of each device and flags them for
/// evacuation.
///
/// The heap is reused across devices and passes.
#[derive(Debug, Default)]
pub struct BucketSelector {
    heap: BucketHeap,
    heap_capacity: Option<usize>,
}

impl BucketSelector {
    pub fn new(heap_capacity: Option<usize>) -> Self {
        Self {
            heap: BucketHeap::default(),
            heap_capacity,
        }
    }

    /// Sweep one device. Move flags left over from earlier passes are
    /// cleared, so afterwards exactly the returned buckets are flagged.
    #[instrument(level = "debug", skip(self, guard, device), fields(device = %device.id()))]
    pub fn select_device(
        &mut self,
        guard: &mut BucketGuard<'_>,
        device: &CacheDevice,
    ) -> Result<DeviceSelection, StorageError> {
        let id = device.id();
        let bucket_size = device.bucket_size();
        let reserve_buckets = guard.movinggc_reserve(id);
        let reserve_sectors = u64::from(bucket_size) * reserve_buckets as u64;
        let heap_capacity = self.heap_capacity.unwrap_or(reserve_buckets);
        self.heap.reset(heap_capacity);

        let mut candidates = 0usize;
        for (index, bucket) in device.buckets() {
            if bucket.is_moving() {
                guard.set_moving(id, index, false)?;
            }
            if !is_reclaimable(bucket, bucket_size) {
                continue;
            }
            candidates += 1;
            self.heap
                .push_or_replace(Candidate::new(index, bucket.sectors_used()));
        }

        let trimmed = self.heap.trim_to(reserve_sectors);
        let sectors_to_move = self.heap.sectors_to_move();
        let marked: Vec<u64> = self
            .heap
            .drain_sorted()
            .into_iter()
            .map(|candidate| candidate.bucket)
            .collect();
        for &index in &marked {
            guard.set_moving(id, index, true)?;
        }

        debug!(
            candidates,
            trimmed,
            marked = marked.len(),
            sectors_to_move,
            reserve_sectors,
            "buckets selected"
        );

        Ok(DeviceSelection {
            device: id,
            reserve_sectors,
            heap_capacity,
            candidates,
            trimmed,
            buckets_marked: marked.len(),
            sectors_to_move,
            marked,
        })
    }

    /// Sweep every device of the cache set, in device order.
    pub fn select_all(&mut self, guard: &mut BucketGuard<'_>) -> Result<Vec<DeviceSelection>, StorageError> {
        let devices = guard.devices();
        let mut selections = Vec::with_capacity(devices.len());
        for device in devices {
            selections.push(self.select_device(guard, device)?);
        }
        Ok(selections)
    }
}
