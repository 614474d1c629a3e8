use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use common::{CacheSetId, DeviceId, ExtentKey, GcMark, Pointer, Reserve, Residency};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bucket::{Bucket, BucketSnapshot, BucketState};
use crate::error::StorageError;

/// Shape of one cache device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    pub buckets: u64,
    /// Bucket size in sectors.
    pub bucket_size: u32,
    /// Free buckets held back for the moving collector.
    pub movinggc_reserve: usize,
}

impl Default for DeviceGeometry {
    fn default() -> Self {
        Self {
            buckets: 1024,
            bucket_size: 1024,
            movinggc_reserve: 8,
        }
    }
}

/// A cache device and its bucket table.
#[derive(Debug)]
pub struct CacheDevice {
    id: DeviceId,
    bucket_size: u32,
    reserve_target: usize,
    buckets: Box<[Bucket]>,
}

impl CacheDevice {
    fn new(id: DeviceId, geometry: &DeviceGeometry) -> Self {
        let buckets = (0..geometry.buckets).map(|_| Bucket::default()).collect();
        Self {
            id,
            bucket_size: geometry.bucket_size,
            reserve_target: geometry.movinggc_reserve,
            buckets,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    pub fn nbuckets(&self) -> u64 {
        self.buckets.len() as u64
    }

    pub fn bucket(&self, index: u64) -> Option<&Bucket> {
        usize::try_from(index).ok().and_then(|i| self.buckets.get(i))
    }

    pub fn buckets(&self) -> impl Iterator<Item = (u64, &Bucket)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(index, bucket)| (index as u64, bucket))
    }

    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        self.buckets()
            .map(|(index, bucket)| bucket.snapshot(index))
            .collect()
    }
}

#[derive(Debug, Default)]
struct FreeLists {
    general: VecDeque<u64>,
    movinggc: VecDeque<u64>,
}

#[derive(Debug, Default)]
struct AllocState {
    free: Vec<FreeLists>,
}

/// A set of cache devices sharing one bucket lock.
#[derive(Debug)]
pub struct CacheSet {
    id: CacheSetId,
    devices: Vec<CacheDevice>,
    bucket_lock: Mutex<AllocState>,
    stopping: AtomicBool,
}

impl CacheSet {
    /// Build a cache set whose buckets all start free, filling each
    /// device's moving-GC reserve first.
    pub fn new(geometries: &[DeviceGeometry]) -> Self {
        let mut devices = Vec::with_capacity(geometries.len());
        let mut state = AllocState::default();

        for (i, geometry) in geometries.iter().enumerate() {
            let device = CacheDevice::new(DeviceId(i as u16), geometry);
            let mut lists = FreeLists::default();
            for index in 0..device.nbuckets() {
                if lists.movinggc.len() < device.reserve_target {
                    lists.movinggc.push_back(index);
                } else {
                    lists.general.push_back(index);
                }
            }
            state.free.push(lists);
            devices.push(device);
        }

        let set = Self {
            id: CacheSetId::new(),
            devices,
            bucket_lock: Mutex::new(state),
            stopping: AtomicBool::new(false),
        };
        info!(
            cache_set = %set.id.as_uuid(),
            devices = set.devices.len(),
            "cache set assembled"
        );
        set
    }

    pub fn id(&self) -> CacheSetId {
        self.id
    }

    pub fn devices(&self) -> &[CacheDevice] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&CacheDevice> {
        self.devices.get(id.0 as usize)
    }

    /// Take the bucket lock. Selection, allocation and recycling all run
    /// under it.
    pub fn lock_buckets(&self) -> Result<BucketGuard<'_>, StorageError> {
        let state = self
            .bucket_lock
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(BucketGuard { set: self, state })
    }

    pub fn ptr_available(&self, ptr: &Pointer) -> bool {
        self.bucket(ptr).is_some()
    }

    pub fn bucket(&self, ptr: &Pointer) -> Option<&Bucket> {
        self.device(ptr.device)
            .and_then(|device| device.bucket(ptr.bucket))
    }

    /// Whether pointer `i` of `key` targets a bucket that has been recycled
    /// since the pointer was written. Missing pointers count as stale.
    pub fn ptr_stale(&self, key: &ExtentKey, i: usize) -> bool {
        key.ptrs
            .get(i)
            .and_then(|ptr| self.bucket(ptr).map(|bucket| bucket.gen() != ptr.gen))
            .unwrap_or(true)
    }

    pub fn stop(&self) {
        info!(cache_set = %self.id.as_uuid(), "cache set stopping");
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Recycle every bucket whose live data has drained away.
    pub fn reclaim_empty(&self) -> Result<usize, StorageError> {
        let mut guard = self.lock_buckets()?;
        let mut reclaimed = 0usize;
        for device in &self.devices {
            for (index, bucket) in device.buckets() {
                let recyclable = matches!(bucket.mark(), GcMark::Reclaimable(_))
                    && bucket.sectors_used() == 0
                    && bucket.pin_count() == 0;
                if recyclable {
                    guard.invalidate(device.id(), index)?;
                    reclaimed += 1;
                }
            }
        }
        debug!(reclaimed, "recycled empty buckets");
        Ok(reclaimed)
    }
}

/// Exclusive access to bucket state and free lists.
pub struct BucketGuard<'a> {
    set: &'a CacheSet,
    state: MutexGuard<'a, AllocState>,
}

impl<'a> BucketGuard<'a> {
    pub fn devices(&self) -> &'a [CacheDevice] {
        &self.set.devices
    }

    fn device(&self, id: DeviceId) -> Result<&'a CacheDevice, StorageError> {
        self.set.device(id).ok_or(StorageError::NoDevice(id))
    }

    fn bucket(&self, device: DeviceId, index: u64) -> Result<&'a Bucket, StorageError> {
        self.device(device)?
            .bucket(index)
            .ok_or(StorageError::NoBucket {
                device,
                bucket: index,
            })
    }

    fn lists(&mut self, device: DeviceId) -> Result<&mut FreeLists, StorageError> {
        self.state
            .free
            .get_mut(device.0 as usize)
            .ok_or(StorageError::NoDevice(device))
    }

    /// Free buckets currently held in the device's moving-GC reserve.
    pub fn movinggc_reserve(&self, device: DeviceId) -> usize {
        self.state
            .free
            .get(device.0 as usize)
            .map_or(0, |lists| lists.movinggc.len())
    }

    pub fn free_buckets(&self, device: DeviceId) -> usize {
        self.state
            .free
            .get(device.0 as usize)
            .map_or(0, |lists| lists.general.len() + lists.movinggc.len())
    }

    pub fn set_moving(&mut self, device: DeviceId, index: u64, moving: bool) -> Result<(), StorageError> {
        self.bucket(device, index)?.set_moving(moving);
        Ok(())
    }

    /// Install usage and classification, as the full collector would.
    pub fn set_bucket(&mut self, device: DeviceId, index: u64, state: BucketState) -> Result<(), StorageError> {
        let bucket = self.bucket(device, index)?;
        bucket.set_sectors_used(state.sectors_used);
        bucket.set_mark(state.mark);
        let lists = self.lists(device)?;
        lists.general.retain(|&b| b != index);
        lists.movinggc.retain(|&b| b != index);
        Ok(())
    }

    /// Pop a free bucket. Moving-GC writes fall back to their reserve once
    /// the general list runs dry.
    pub fn alloc(&mut self, device: DeviceId, reserve: Reserve) -> Result<Option<u64>, StorageError> {
        let lists = self.lists(device)?;
        let index = match reserve {
            Reserve::None => lists.general.pop_front(),
            Reserve::MovingGc => lists
                .general
                .pop_front()
                .or_else(|| lists.movinggc.pop_front()),
        };
        Ok(index)
    }

    /// Recycle a bucket: bump its generation, invalidating every pointer
    /// into it, clear its state and return it to the free lists.
    pub fn invalidate(&mut self, device: DeviceId, index: u64) -> Result<u8, StorageError> {
        let dev = self.device(device)?;
        let bucket = self.bucket(device, index)?;
        if bucket.pin_count() > 0 {
            return Err(StorageError::Pinned {
                device,
                bucket: index,
            });
        }
        let gen = bucket.bump_gen();
        bucket.set_sectors_used(0);
        bucket.set_mark(GcMark::Free);
        bucket.set_moving(false);

        let target = dev.reserve_target;
        let lists = self.lists(device)?;
        if lists.movinggc.len() < target {
            lists.movinggc.push_back(index);
        } else {
            lists.general.push_back(index);
        }
        Ok(gen)
    }

    /// Record `sectors` of new live data written into a bucket.
    pub fn account_write(&mut self, ptr: &Pointer, sectors: u32, dirty: bool) -> Result<(), StorageError> {
        let bucket = self.bucket(ptr.device, ptr.bucket)?;
        bucket.set_sectors_used(bucket.sectors_used().saturating_add(sectors));
        let mark = match (bucket.mark(), dirty) {
            (GcMark::Metadata, _) => GcMark::Metadata,
            (_, true) | (GcMark::Reclaimable(Residency::Dirty), _) => {
                GcMark::Reclaimable(Residency::Dirty)
            }
            _ => GcMark::Reclaimable(Residency::Clean),
        };
        bucket.set_mark(mark);
        Ok(())
    }

    /// Record that `sectors` of live data in a bucket were superseded.
    pub fn account_release(&mut self, ptr: &Pointer, sectors: u32) -> Result<(), StorageError> {
        let bucket = self.bucket(ptr.device, ptr.bucket)?;
        if bucket.gen() == ptr.gen {
            bucket.set_sectors_used(bucket.sectors_used().saturating_sub(sectors));
        }
        Ok(())
    }
}
