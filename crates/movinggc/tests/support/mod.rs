#![allow(dead_code)]

use std::sync::Arc;

use common::traits::BlockIo;
use common::{DeviceId, ExtentKey, IoError, IoPriority, Pointer, SECTOR_SIZE};
use extent_index::{ExtentTree, InsertPath};
use futures::future::BoxFuture;
use movinggc::{GcConfig, MovingGc};
use storage::{CacheSet, DeviceGeometry, MemBlockIo, MemIoConfig};

pub type Writer = InsertPath<MemBlockIo>;
pub type Gc<B = MemBlockIo> = MovingGc<ExtentTree, B, Writer>;

pub fn geometry(buckets: u64, bucket_size: u32, movinggc_reserve: usize) -> DeviceGeometry {
    DeviceGeometry {
        buckets,
        bucket_size,
        movinggc_reserve,
    }
}

pub fn config(max_in_flight: usize) -> GcConfig {
    GcConfig {
        max_in_flight,
        keybuf_capacity: 4 * max_in_flight.max(4),
        ..GcConfig::default()
    }
}

pub fn fill_byte(inode: u64, index: u64) -> u8 {
    (inode * 31 + index) as u8
}

pub struct Harness {
    pub cache: Arc<CacheSet>,
    pub io: Arc<MemBlockIo>,
    pub tree: Arc<ExtentTree>,
    pub writer: Arc<Writer>,
}

impl Harness {
    pub fn new(geometries: &[DeviceGeometry]) -> Self {
        Self::with_io_config(geometries, MemIoConfig::default())
    }

    pub fn with_io_config(geometries: &[DeviceGeometry], io_config: MemIoConfig) -> Self {
        let cache = Arc::new(CacheSet::new(geometries));
        let io = Arc::new(MemBlockIo::with_config(Arc::clone(&cache), io_config));
        let tree = Arc::new(ExtentTree::new());
        let writer = Arc::new(InsertPath::new(
            Arc::clone(&cache),
            Arc::clone(&tree),
            Arc::clone(&io),
        ));
        Self {
            cache,
            io,
            tree,
            writer,
        }
    }

    pub fn gc(&self, config: GcConfig) -> Gc {
        self.gc_with(Arc::clone(&self.io), config)
    }

    pub fn gc_with<B: BlockIo + 'static>(&self, io: Arc<B>, config: GcConfig) -> Gc<B> {
        MovingGc::initialize(
            Arc::clone(&self.cache),
            Arc::clone(&self.tree),
            io,
            Arc::clone(&self.writer),
            config,
        )
        .expect("initialize collector")
    }

    /// Write `count` extents of `sectors` each for `inode`, then discard
    /// every extent whose index is not in `keep`. Returns the survivors.
    pub async fn write_sparse(
        &self,
        inode: u64,
        count: u64,
        sectors: u32,
        keep: &[u64],
        dirty: bool,
    ) -> Vec<ExtentKey> {
        let mut kept = Vec::new();
        for index in 0..count {
            let data = vec![fill_byte(inode, index); sectors as usize * SECTOR_SIZE];
            let key = self
                .writer
                .write(inode, index * u64::from(sectors), &data, dirty)
                .await
                .expect("foreground write");
            if keep.contains(&index) {
                kept.push(key);
            } else {
                self.discard(&key);
            }
        }
        kept
    }

    /// Drop an extent from the index and give its space back.
    pub fn discard(&self, key: &ExtentKey) {
        self.tree.remove(&key.pos());
        let mut guard = self.cache.lock_buckets().expect("bucket lock");
        for ptr in &key.ptrs {
            guard.account_release(ptr, key.size).expect("release usage");
        }
    }

    /// Unpin every bucket the foreground path has open.
    pub fn seal(&self) {
        self.writer.close_open_buckets();
    }

    pub async fn read_key(&self, key: &ExtentKey) -> Vec<u8> {
        let mut buf = vec![0u8; key.bytes()];
        self.io
            .read(&key.ptrs[0], key.size, &mut buf, IoPriority::Normal)
            .await
            .expect("read extent");
        buf
    }

    pub fn sectors_used(&self, device: DeviceId, bucket: u64) -> u32 {
        self.cache.devices()[device.0 as usize]
            .bucket(bucket)
            .expect("bucket in range")
            .sectors_used()
    }

    pub fn keys_in(&self, device: DeviceId, bucket: u64) -> Vec<ExtentKey> {
        self.tree
            .keys()
            .into_iter()
            .filter(|key| {
                key.ptrs
                    .iter()
                    .any(|ptr| ptr.device == device && ptr.bucket == bucket)
            })
            .collect()
    }
}

pub type ReadHook = Arc<dyn Fn(Pointer) -> BoxFuture<'static, ()> + Send + Sync>;

/// Block device that runs a hook after every successful read, to interleave
/// foreground activity with a relocation in flight.
pub struct HookedIo {
    inner: Arc<MemBlockIo>,
    hook: ReadHook,
}

impl HookedIo {
    pub fn new(inner: Arc<MemBlockIo>, hook: ReadHook) -> Self {
        Self { inner, hook }
    }
}

impl BlockIo for HookedIo {
    fn read<'a>(
        &'a self,
        ptr: &'a Pointer,
        sectors: u32,
        buf: &'a mut [u8],
        prio: IoPriority,
    ) -> BoxFuture<'a, Result<(), IoError>> {
        Box::pin(async move {
            self.inner.read(ptr, sectors, buf, prio).await?;
            (self.hook)(*ptr).await;
            Ok(())
        })
    }

    fn write<'a>(
        &'a self,
        ptr: &'a Pointer,
        data: &'a [u8],
        prio: IoPriority,
    ) -> BoxFuture<'a, Result<(), IoError>> {
        self.inner.write(ptr, data, prio)
    }
}
