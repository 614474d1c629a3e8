use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::traits::{BlockIo, DataInsert, InsertOp, InsertOutcome};
use common::{
    DeviceId, ExtentKey, GcMark, IoError, IoPriority, Pointer, Reserve, Residency, SECTOR_SIZE,
};
use futures::future::BoxFuture;
use storage::{BucketState, CacheSet, StorageError};
use tracing::{debug, trace};

use crate::tree::ExtentTree;

#[derive(Debug, Clone, Copy)]
struct OpenBucket {
    bucket: u64,
    gen: u8,
    next_offset: u32,
}

fn reserve_name(reserve: Reserve) -> &'static str {
    match reserve {
        Reserve::None => "general",
        Reserve::MovingGc => "moving-gc",
    }
}

fn unavailable(err: StorageError) -> IoError {
    IoError::Unavailable(err.to_string())
}

/// Data-insertion path: place the data in an open bucket, write it, then
/// commit the new key to the index.
///
/// Open buckets stay pinned while they accept writes so the collector never
/// selects a bucket that is still being filled.
#[derive(Debug)]
pub struct InsertPath<B> {
    cache: Arc<CacheSet>,
    tree: Arc<ExtentTree>,
    io: Arc<B>,
    open: Mutex<HashMap<(DeviceId, Reserve), OpenBucket>>,
}

impl<B: BlockIo> InsertPath<B> {
    pub fn new(cache: Arc<CacheSet>, tree: Arc<ExtentTree>, io: Arc<B>) -> Self {
        Self {
            cache,
            tree,
            io,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn tree(&self) -> &Arc<ExtentTree> {
        &self.tree
    }

    fn open(&self) -> MutexGuard<'_, HashMap<(DeviceId, Reserve), OpenBucket>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unpin(&self, device: DeviceId, open: &OpenBucket) {
        let ptr = Pointer::new(device, open.bucket, 0, open.gen);
        if let Some(bucket) = self.cache.bucket(&ptr) {
            bucket.unpin();
        }
    }

    /// Unpin every open bucket so it becomes eligible for collection.
    pub fn close_open_buckets(&self) {
        let drained: Vec<_> = self.open().drain().collect();
        for ((device, _), open) in drained {
            self.unpin(device, &open);
        }
    }

    fn allocate_on(&self, device: DeviceId, sectors: u32, reserve: Reserve) -> Result<Pointer, IoError> {
        let bucket_size = self
            .cache
            .device(device)
            .ok_or(IoError::NoDevice(device))?
            .bucket_size();
        if sectors > bucket_size {
            return Err(IoError::OutOfRange {
                offset: 0,
                sectors,
                bucket_size,
            });
        }

        let mut open = self.open();
        if let Some(current) = open.get_mut(&(device, reserve)) {
            if current.next_offset + sectors <= bucket_size {
                let ptr = Pointer::new(device, current.bucket, current.next_offset, current.gen);
                current.next_offset += sectors;
                return Ok(ptr);
            }
        }
        if let Some(full) = open.remove(&(device, reserve)) {
            self.unpin(device, &full);
        }

        let mut guard = self.cache.lock_buckets().map_err(unavailable)?;
        let index = guard
            .alloc(device, reserve)
            .map_err(unavailable)?
            .ok_or(IoError::NoSpace {
                reserve: reserve_name(reserve),
            })?;
        guard
            .set_bucket(device, index, BucketState::new(0, GcMark::Reclaimable(Residency::Clean)))
            .map_err(unavailable)?;
        drop(guard);

        let probe = Pointer::new(device, index, 0, 0);
        let bucket = self
            .cache
            .bucket(&probe)
            .ok_or_else(|| IoError::media(device, index, "allocated bucket vanished"))?;
        bucket.pin();
        let gen = bucket.gen();
        open.insert(
            (device, reserve),
            OpenBucket {
                bucket: index,
                gen,
                next_offset: sectors,
            },
        );
        trace!(%device, bucket = index, gen, "opened bucket");
        Ok(Pointer::new(device, index, 0, gen))
    }

    /// Place `sectors` on the preferred device, spilling to the others in
    /// order when it is out of space.
    fn allocate(&self, preferred: DeviceId, sectors: u32, reserve: Reserve) -> Result<Pointer, IoError> {
        let mut last_err = IoError::NoSpace {
            reserve: reserve_name(reserve),
        };
        let others = self
            .cache
            .devices()
            .iter()
            .map(|device| device.id())
            .filter(|&id| id != preferred);
        for device in std::iter::once(preferred).chain(others) {
            match self.allocate_on(device, sectors, reserve) {
                Ok(ptr) => return Ok(ptr),
                Err(err @ IoError::NoSpace { .. }) | Err(err @ IoError::NoDevice(_)) => {
                    last_err = err
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    fn account(&self, new: &ExtentKey, old: Option<&ExtentKey>) -> Result<(), IoError> {
        let mut guard = self.cache.lock_buckets().map_err(unavailable)?;
        for ptr in &new.ptrs {
            guard
                .account_write(ptr, new.size, new.dirty)
                .map_err(unavailable)?;
        }
        if let Some(old) = old {
            for ptr in &old.ptrs {
                if self.cache.ptr_available(ptr) {
                    guard.account_release(ptr, old.size).map_err(unavailable)?;
                }
            }
        }
        Ok(())
    }

    /// Foreground write of a whole extent.
    pub async fn write(&self, inode: u64, offset: u64, data: &[u8], dirty: bool) -> Result<ExtentKey, IoError> {
        let sectors = data.len().div_ceil(SECTOR_SIZE) as u32;
        let op = InsertOp {
            inode,
            offset,
            sectors,
            data,
            replace_key: None,
            writeback: dirty,
            csum: false,
            reserve: Reserve::None,
            prio: IoPriority::Normal,
        };
        match self.insert(op).await? {
            InsertOutcome::Committed(key) => Ok(key),
            InsertOutcome::Collision => Err(IoError::Unavailable(
                "unconditional insert reported a collision".to_string(),
            )),
        }
    }
}

impl<B: BlockIo> DataInsert for InsertPath<B> {
    fn insert<'a>(&'a self, op: InsertOp<'a>) -> BoxFuture<'a, Result<InsertOutcome, IoError>> {
        Box::pin(async move {
            let len = op.sectors as usize * SECTOR_SIZE;
            if op.data.len() + SECTOR_SIZE <= len {
                return Err(IoError::ShortBuffer {
                    len: op.data.len(),
                    needed: len,
                });
            }
            let payload = &op.data[..len.min(op.data.len())];

            let preferred = op
                .replace_key
                .as_ref()
                .and_then(|key| key.ptrs.first())
                .map_or(DeviceId(0), |ptr| ptr.device);
            let ptr = self.allocate(preferred, op.sectors, op.reserve)?;
            self.io.write(&ptr, payload, op.prio).await?;

            let new_key = ExtentKey {
                inode: op.inode,
                offset: op.offset,
                size: op.sectors,
                ptrs: vec![ptr],
                dirty: op.writeback,
                csum: op.csum,
            };

            match op.replace_key {
                Some(expected) => {
                    let source_stale =
                        (0..expected.ptrs.len()).any(|i| self.cache.ptr_stale(&expected, i));
                    if source_stale {
                        debug!(key = %expected, "replace source went stale");
                        return Ok(InsertOutcome::Collision);
                    }
                    if !self.tree.replace(&expected, new_key.clone()) {
                        debug!(key = %expected, "replace found key changed");
                        return Ok(InsertOutcome::Collision);
                    }
                    self.account(&new_key, Some(&expected))?;
                }
                None => {
                    let old = self.tree.insert(new_key.clone());
                    self.account(&new_key, old.as_ref())?;
                }
            }
            Ok(InsertOutcome::Committed(new_key))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::KeyPos;
    use storage::{DeviceGeometry, MemBlockIo};

    fn setup() -> (Arc<CacheSet>, Arc<MemBlockIo>, InsertPath<MemBlockIo>) {
        let cache = Arc::new(CacheSet::new(&[DeviceGeometry {
            buckets: 4,
            bucket_size: 32,
            movinggc_reserve: 1,
        }]));
        let io = Arc::new(MemBlockIo::new(Arc::clone(&cache)));
        let tree = Arc::new(ExtentTree::new());
        let path = InsertPath::new(Arc::clone(&cache), tree, Arc::clone(&io));
        (cache, io, path)
    }

    #[tokio::test]
    async fn foreground_writes_fill_open_bucket_sequentially() {
        let (cache, _io, path) = setup();
        let a = path.write(1, 0, &[1u8; 8 * SECTOR_SIZE], false).await.unwrap();
        let b = path.write(1, 8, &[2u8; 8 * SECTOR_SIZE], true).await.unwrap();
        assert_eq!(a.ptrs[0].bucket, b.ptrs[0].bucket);
        assert_eq!(b.ptrs[0].offset, 8);

        let bucket = cache.bucket(&a.ptrs[0]).unwrap();
        assert_eq!(bucket.sectors_used(), 16);
        assert_eq!(bucket.mark(), GcMark::Reclaimable(Residency::Dirty));
        assert_eq!(bucket.pin_count(), 1);

        path.close_open_buckets();
        assert_eq!(bucket.pin_count(), 0);
    }

    #[tokio::test]
    async fn replace_commits_and_moves_usage() {
        let (cache, io, path) = setup();
        let original = path.write(2, 0, &[7u8; 4 * SECTOR_SIZE], false).await.unwrap();
        path.close_open_buckets();

        let mut data = vec![0u8; 4 * SECTOR_SIZE];
        io.read(&original.ptrs[0], 4, &mut data, IoPriority::Idle).await.unwrap();
        let op = InsertOp {
            inode: 2,
            offset: 0,
            sectors: 4,
            data: &data,
            replace_key: Some(original.clone()),
            writeback: false,
            csum: true,
            reserve: Reserve::MovingGc,
            prio: IoPriority::Background,
        };
        let InsertOutcome::Committed(moved) = path.insert(op).await.unwrap() else {
            panic!("expected commit");
        };
        assert_ne!(moved.ptrs[0].bucket, original.ptrs[0].bucket);
        assert!(moved.csum);
        assert_eq!(cache.bucket(&original.ptrs[0]).unwrap().sectors_used(), 0);
        assert_eq!(cache.bucket(&moved.ptrs[0]).unwrap().sectors_used(), 4);
        assert_eq!(path.tree().get(&KeyPos::new(2, 0)), Some(moved));
    }

    #[tokio::test]
    async fn replace_of_rewritten_key_collides() {
        let (_cache, _io, path) = setup();
        let original = path.write(3, 0, &[1u8; SECTOR_SIZE], false).await.unwrap();
        let rewritten = path.write(3, 0, &[9u8; SECTOR_SIZE], false).await.unwrap();

        let data = vec![1u8; SECTOR_SIZE];
        let op = InsertOp {
            inode: 3,
            offset: 0,
            sectors: 1,
            data: &data,
            replace_key: Some(original),
            writeback: false,
            csum: false,
            reserve: Reserve::MovingGc,
            prio: IoPriority::Background,
        };
        assert_eq!(path.insert(op).await.unwrap(), InsertOutcome::Collision);
        assert_eq!(path.tree().get(&KeyPos::new(3, 0)), Some(rewritten));
    }

    #[tokio::test]
    async fn exhausted_device_reports_no_space() {
        let (_cache, _io, path) = setup();
        for i in 0..3 {
            path.write(4, i * 32, &[0u8; 32 * SECTOR_SIZE], false).await.unwrap();
        }
        let err = path.write(4, 96, &[0u8; 32 * SECTOR_SIZE], false).await.unwrap_err();
        assert_eq!(err, IoError::NoSpace { reserve: "general" });
    }
}
