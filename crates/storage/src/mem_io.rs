//! RAM-backed block device for exercising the collector without hardware.
//!
//! Data lives in per-bucket byte vectors allocated on first write. Reads of
//! never-written sectors return zeroes. Faults and latency can be injected
//! to drive the error paths of anything issuing I/O through [`BlockIo`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::traits::BlockIo;
use common::{DeviceId, IoError, IoPriority, Pointer, SECTOR_SIZE};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cache_set::CacheSet;

/// Configuration for the in-memory block device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemIoConfig {
    /// Delay applied before each request completes, in microseconds.
    #[serde(default)]
    pub simulated_latency_us: u64,
}

#[derive(Debug, Default)]
struct FaultPlan {
    failing_reads: HashSet<(DeviceId, u64)>,
    fail_writes: bool,
}

#[derive(Debug, Default)]
struct IoCounters {
    reads: AtomicU64,
    idle_reads: AtomicU64,
    writes: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoCountersSnapshot {
    pub reads: u64,
    pub idle_reads: u64,
    pub writes: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

#[derive(Debug)]
struct MemIoInner {
    config: MemIoConfig,
    data: Mutex<HashMap<(DeviceId, u64), Vec<u8>>>,
    faults: Mutex<FaultPlan>,
    counters: IoCounters,
}

#[derive(Debug, Clone)]
pub struct MemBlockIo {
    cache: Arc<CacheSet>,
    inner: Arc<MemIoInner>,
}

impl MemBlockIo {
    pub fn new(cache: Arc<CacheSet>) -> Self {
        Self::with_config(cache, MemIoConfig::default())
    }

    pub fn with_config(cache: Arc<CacheSet>, config: MemIoConfig) -> Self {
        if config.simulated_latency_us > 0 {
            debug!(latency_us = config.simulated_latency_us, "simulated latency enabled");
        }
        Self {
            cache,
            inner: Arc::new(MemIoInner {
                config,
                data: Mutex::new(HashMap::new()),
                faults: Mutex::new(FaultPlan::default()),
                counters: IoCounters::default(),
            }),
        }
    }

    /// Fail every subsequent read that targets the given bucket.
    pub fn fail_reads_from(&self, device: DeviceId, bucket: u64) {
        self.faults().failing_reads.insert((device, bucket));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.faults().fail_writes = fail;
    }

    pub fn clear_faults(&self) {
        *self.faults() = FaultPlan::default();
    }

    pub fn counters(&self) -> IoCountersSnapshot {
        let c = &self.inner.counters;
        IoCountersSnapshot {
            reads: c.reads.load(Ordering::Relaxed),
            idle_reads: c.idle_reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
        }
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, FaultPlan> {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket_size(&self, ptr: &Pointer) -> Result<u32, IoError> {
        let device = self
            .cache
            .device(ptr.device)
            .ok_or(IoError::NoDevice(ptr.device))?;
        if device.bucket(ptr.bucket).is_none() {
            return Err(IoError::media(ptr.device, ptr.bucket, "bucket out of range"));
        }
        Ok(device.bucket_size())
    }

    fn check_range(&self, ptr: &Pointer, sectors: u32) -> Result<u32, IoError> {
        let bucket_size = self.bucket_size(ptr)?;
        if ptr.offset as u64 + sectors as u64 > bucket_size as u64 {
            return Err(IoError::OutOfRange {
                offset: ptr.offset,
                sectors,
                bucket_size,
            });
        }
        Ok(bucket_size)
    }

    async fn simulate_latency(&self) {
        let latency = self.inner.config.simulated_latency_us;
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
    }

    fn do_read(&self, ptr: &Pointer, sectors: u32, buf: &mut [u8]) -> Result<(), IoError> {
        self.check_range(ptr, sectors)?;
        let len = sectors as usize * SECTOR_SIZE;
        if buf.len() < len {
            return Err(IoError::ShortBuffer {
                len: buf.len(),
                needed: len,
            });
        }
        if self.faults().failing_reads.contains(&(ptr.device, ptr.bucket)) {
            return Err(IoError::media(ptr.device, ptr.bucket, "injected read fault"));
        }

        let start = ptr.offset as usize * SECTOR_SIZE;
        let data = self
            .inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match data.get(&(ptr.device, ptr.bucket)) {
            Some(bucket) => buf[..len].copy_from_slice(&bucket[start..start + len]),
            None => buf[..len].fill(0),
        }
        Ok(())
    }

    fn do_write(&self, ptr: &Pointer, data: &[u8]) -> Result<(), IoError> {
        let sectors = data.len().div_ceil(SECTOR_SIZE) as u32;
        let bucket_size = self.check_range(ptr, sectors)?;
        if self.faults().fail_writes {
            return Err(IoError::media(ptr.device, ptr.bucket, "injected write fault"));
        }

        let start = ptr.offset as usize * SECTOR_SIZE;
        let mut store = self
            .inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let bucket = store
            .entry((ptr.device, ptr.bucket))
            .or_insert_with(|| vec![0u8; bucket_size as usize * SECTOR_SIZE]);
        bucket[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl BlockIo for MemBlockIo {
    fn read<'a>(
        &'a self,
        ptr: &'a Pointer,
        sectors: u32,
        buf: &'a mut [u8],
        prio: IoPriority,
    ) -> BoxFuture<'a, Result<(), IoError>> {
        Box::pin(async move {
            self.simulate_latency().await;
            let counters = &self.inner.counters;
            counters.reads.fetch_add(1, Ordering::Relaxed);
            if prio == IoPriority::Idle {
                counters.idle_reads.fetch_add(1, Ordering::Relaxed);
            }
            let result = self.do_read(ptr, sectors, buf);
            if result.is_err() {
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
            }
            trace!(device = %ptr.device, bucket = ptr.bucket, sectors, ok = result.is_ok(), "read");
            result
        })
    }

    fn write<'a>(
        &'a self,
        ptr: &'a Pointer,
        data: &'a [u8],
        _prio: IoPriority,
    ) -> BoxFuture<'a, Result<(), IoError>> {
        Box::pin(async move {
            self.simulate_latency().await;
            let counters = &self.inner.counters;
            counters.writes.fetch_add(1, Ordering::Relaxed);
            let result = self.do_write(ptr, data);
            if result.is_err() {
                counters.write_errors.fetch_add(1, Ordering::Relaxed);
            }
            trace!(device = %ptr.device, bucket = ptr.bucket, bytes = data.len(), ok = result.is_ok(), "write");
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_set::DeviceGeometry;

    fn io() -> MemBlockIo {
        let cache = Arc::new(CacheSet::new(&[DeviceGeometry {
            buckets: 4,
            bucket_size: 64,
            movinggc_reserve: 1,
        }]));
        MemBlockIo::new(cache)
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let io = io();
        let ptr = Pointer::new(DeviceId(0), 2, 8, 0);
        let payload = vec![0xAB; 4 * SECTOR_SIZE];
        io.write(&ptr, &payload, IoPriority::Normal).await.unwrap();

        let mut buf = vec![0u8; 4 * SECTOR_SIZE];
        io.read(&ptr, 4, &mut buf, IoPriority::Idle).await.unwrap();
        assert_eq!(buf, payload);

        let counters = io.counters();
        assert_eq!(counters.reads, 1);
        assert_eq!(counters.idle_reads, 1);
        assert_eq!(counters.writes, 1);
    }

    #[tokio::test]
    async fn injected_read_fault_is_reported() {
        let io = io();
        io.fail_reads_from(DeviceId(0), 1);
        let ptr = Pointer::new(DeviceId(0), 1, 0, 0);
        let mut buf = vec![0u8; SECTOR_SIZE];
        let err = io.read(&ptr, 1, &mut buf, IoPriority::Idle).await.unwrap_err();
        assert!(matches!(err, IoError::Media { bucket: 1, .. }));
        assert_eq!(io.counters().read_errors, 1);

        io.clear_faults();
        io.read(&ptr, 1, &mut buf, IoPriority::Idle).await.unwrap();
    }

    #[tokio::test]
    async fn requests_past_bucket_end_are_rejected() {
        let io = io();
        let ptr = Pointer::new(DeviceId(0), 0, 60, 0);
        let mut buf = vec![0u8; 8 * SECTOR_SIZE];
        let err = io.read(&ptr, 8, &mut buf, IoPriority::Idle).await.unwrap_err();
        assert!(matches!(err, IoError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn unknown_device_is_rejected() {
        let io = io();
        let ptr = Pointer::new(DeviceId(3), 0, 0, 0);
        let err = io.write(&ptr, &[0u8; 512], IoPriority::Normal).await.unwrap_err();
        assert_eq!(err, IoError::NoDevice(DeviceId(3)));
    }
}
