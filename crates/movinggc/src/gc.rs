use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use common::pages_for_sectors;
use common::traits::{BlockIo, DataInsert, ExtentIndex};
use extent_index::Keybuf;
use futures::future::join_all;
use storage::{BufferPool, CacheSet};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::config::GcConfig;
use crate::error::GcResult;
use crate::io::{MoveContext, MoveOperation, MoveOutcome};
use crate::limiter::AdmissionLimiter;
use crate::scan::ExtentScanner;
use crate::select::{BucketSelector, DeviceSelection};
use crate::stats::{GcStats, GcStatsSnapshot, PassReport, PassStop};

/// Moving garbage collector for one cache set.
///
/// Each pass flags the least-utilised buckets of every device, then copies
/// the live extents out of them through the data-insertion path so the
/// allocator can recycle the emptied buckets.
pub struct MovingGc<I: ExtentIndex, B, W> {
    cache: Arc<CacheSet>,
    keybuf: Arc<Keybuf<I>>,
    io: Arc<B>,
    writer: Arc<W>,
    buffers: BufferPool,
    limiter: AdmissionLimiter,
    stats: Arc<GcStats>,
    config: GcConfig,
    enabled: AtomicBool,
    // Held for the whole pass; passes never overlap.
    selector: Mutex<BucketSelector>,
}

impl<I, B, W> MovingGc<I, B, W>
where
    I: ExtentIndex + 'static,
    B: BlockIo + 'static,
    W: DataInsert + 'static,
{
    /// Set up the collector's keybuf, copy buffers and admission limiter.
    pub fn initialize(
        cache: Arc<CacheSet>,
        index: Arc<I>,
        io: Arc<B>,
        writer: Arc<W>,
        config: GcConfig,
    ) -> GcResult<Self> {
        config.validate()?;
        info!(
            cache_set = %cache.id().as_uuid(),
            devices = cache.devices().len(),
            max_in_flight = config.max_in_flight,
            keybuf_capacity = config.keybuf_capacity,
            enabled = config.enabled,
            "moving gc initialised"
        );
        Ok(Self {
            keybuf: Arc::new(Keybuf::new(index, config.keybuf_capacity)),
            buffers: BufferPool::new(config.buffer_pages),
            limiter: AdmissionLimiter::new(config.max_in_flight),
            stats: Arc::new(GcStats::default()),
            enabled: AtomicBool::new(config.enabled),
            selector: Mutex::new(BucketSelector::new(config.heap_capacity)),
            cache,
            io,
            writer,
            config,
        })
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable future passes. A pass already running finishes.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(enabled, "moving gc toggled");
        }
    }

    /// Stop the collector for good. Later passes return immediately and a
    /// pass waiting for an admission slot stops admitting; relocations
    /// already admitted still finish.
    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::Release);
        if !self.limiter.is_closed() {
            self.limiter.close();
            info!(cache_set = %self.cache.id().as_uuid(), "moving gc shut down");
        }
    }

    pub fn stats(&self) -> GcStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    pub fn keybuf(&self) -> &Keybuf<I> {
        &self.keybuf
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Run one selection pass followed by relocation of every key in the
    /// selected buckets. Returns once every admitted relocation has
    /// finished.
    #[instrument(skip(self), fields(cache_set = %self.cache.id().as_uuid()))]
    pub async fn run_pass(&self) -> PassReport {
        let started = Instant::now();
        let mut report = PassReport::default();

        if !self.is_enabled() {
            debug!("moving gc disabled; pass skipped");
            report.stop = PassStop::Disabled;
            return report;
        }
        if self.cache.is_stopping() || self.limiter.is_closed() {
            report.stop = PassStop::Shutdown;
            return report;
        }

        let mut selector = self.selector.lock().await;
        match self.select_buckets(&mut selector) {
            Ok(devices) => report.devices = devices,
            Err(err) => {
                error!(error = %err, "bucket selection failed");
                report.stop = PassStop::Aborted;
                report.elapsed = started.elapsed();
                return report;
            }
        }
        self.stats.record_pass(report.buckets_marked() as u64);

        if report.buckets_marked() > 0 {
            self.read_moving(&mut report).await;
        }

        report.elapsed = started.elapsed();
        info!(
            buckets = report.buckets_marked(),
            sectors_selected = report.sectors_selected(),
            admitted = report.admitted,
            moved = report.moved,
            collisions = report.collisions,
            stale = report.stale,
            read_errors = report.read_errors,
            write_errors = report.write_errors,
            stop = ?report.stop,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "moving gc pass complete"
        );
        report
    }

    fn select_buckets(&self, selector: &mut BucketSelector) -> GcResult<Vec<DeviceSelection>> {
        let mut guard = self.cache.lock_buckets()?;
        let devices = selector.select_all(&mut guard)?;
        for selection in &devices {
            info!(
                device = %selection.device,
                buckets = selection.buckets_marked,
                sectors_to_move = selection.sectors_to_move,
                reserve_sectors = selection.reserve_sectors,
                "device buckets selected"
            );
        }
        Ok(devices)
    }

    fn context(&self) -> MoveContext<I, B, W> {
        MoveContext {
            cache: Arc::clone(&self.cache),
            keybuf: Arc::clone(&self.keybuf),
            io: Arc::clone(&self.io),
            writer: Arc::clone(&self.writer),
            stats: Arc::clone(&self.stats),
        }
    }

    async fn read_moving(&self, report: &mut PassReport) {
        let ctx = self.context();
        let mut scanner = ExtentScanner::start(&self.cache, &self.keybuf, &self.stats);
        let mut handles: Vec<JoinHandle<MoveOutcome>> = Vec::new();

        while let Some(pending) = scanner.next_key() {
            let permit = match self.limiter.acquire().await {
                Ok(permit) => permit,
                Err(err) => {
                    info!(error = %err, "admission closed");
                    self.keybuf.release(pending);
                    report.stop = PassStop::Shutdown;
                    break;
                }
            };

            let buffer = match self.buffers.alloc(pages_for_sectors(pending.key().size)) {
                Ok(buffer) => buffer,
                Err(err) => {
                    warn!(key = %pending.key(), error = %err, "copy buffer allocation failed");
                    self.stats.record_alloc_failure();
                    self.keybuf.release(pending);
                    drop(permit);
                    report.stop = PassStop::BufferExhausted;
                    break;
                }
            };

            debug!(key = %pending.key(), "gc copy");
            self.stats.record_admitted();
            report.admitted += 1;
            let op = MoveOperation::new(ctx.clone(), pending, permit, buffer);
            handles.push(tokio::spawn(op.run().in_current_span()));
        }

        if scanner.stopped() {
            report.stop = PassStop::Shutdown;
        }
        report.stale += scanner.skipped_stale();

        for joined in join_all(handles).await {
            match joined {
                Ok(outcome) => report.record_outcome(&outcome),
                Err(err) => {
                    error!(error = %err, "relocation task failed");
                    report.lost += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GcError;
    use common::traits::{InsertOp, InsertOutcome};
    use common::{DeviceId, ExtentKey, GcMark, IoError, IoPriority, Pointer, Residency, SECTOR_SIZE};
    use extent_index::{ExtentTree, InsertPath};
    use futures::future::BoxFuture;
    use storage::{BucketState, DeviceGeometry, MemBlockIo, MemIoConfig};
    use tracing_test::traced_test;

    struct Fixture {
        cache: Arc<CacheSet>,
        io: Arc<MemBlockIo>,
        tree: Arc<ExtentTree>,
    }

    /// One 8-sector extent living alone in bucket 3.
    async fn fixture() -> Fixture {
        let cache = Arc::new(CacheSet::new(&[DeviceGeometry {
            buckets: 8,
            bucket_size: 64,
            movinggc_reserve: 2,
        }]));
        let io = Arc::new(MemBlockIo::new(Arc::clone(&cache)));
        let tree = Arc::new(ExtentTree::new());

        let ptr = Pointer::new(DeviceId(0), 3, 0, 0);
        io.write(&ptr, &[0x5A; 8 * SECTOR_SIZE], IoPriority::Normal)
            .await
            .unwrap();
        tree.insert(ExtentKey::new(9, 0, 8, ptr));
        cache
            .lock_buckets()
            .unwrap()
            .set_bucket(
                DeviceId(0),
                3,
                BucketState::new(8, GcMark::Reclaimable(Residency::Clean)),
            )
            .unwrap();
        Fixture { cache, io, tree }
    }

    struct Refuse(Option<IoError>);

    impl DataInsert for Refuse {
        fn insert<'a>(&'a self, _op: InsertOp<'a>) -> BoxFuture<'a, Result<InsertOutcome, IoError>> {
            let result = match &self.0 {
                Some(err) => Err(err.clone()),
                None => Ok(InsertOutcome::Collision),
            };
            Box::pin(async move { result })
        }
    }

    fn small_config() -> GcConfig {
        GcConfig {
            max_in_flight: 2,
            keybuf_capacity: 8,
            ..GcConfig::default()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn pass_logs_selection_copies_and_summary() {
        let f = fixture().await;
        let writer = Arc::new(InsertPath::new(
            Arc::clone(&f.cache),
            Arc::clone(&f.tree),
            Arc::clone(&f.io),
        ));
        let gc = MovingGc::initialize(
            Arc::clone(&f.cache),
            Arc::clone(&f.tree),
            Arc::clone(&f.io),
            writer,
            small_config(),
        )
        .unwrap();

        let report = gc.run_pass().await;
        assert_eq!(report.moved, 1);
        assert!(logs_contain("device buckets selected"));
        assert!(logs_contain("gc copy"));
        assert!(logs_contain("moving gc pass complete"));
    }

    #[tokio::test]
    #[traced_test]
    async fn collision_is_counted_and_logged() {
        let f = fixture().await;
        let gc = MovingGc::initialize(
            Arc::clone(&f.cache),
            Arc::clone(&f.tree),
            Arc::clone(&f.io),
            Arc::new(Refuse(None)),
            small_config(),
        )
        .unwrap();

        let report = gc.run_pass().await;
        assert_eq!(report.collisions, 1);
        assert_eq!(report.moved, 0);
        assert!(logs_contain("gc copy collision"));
        assert_eq!(gc.keybuf().outstanding_claims(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn write_failure_is_counted_and_released() {
        let f = fixture().await;
        let gc = MovingGc::initialize(
            Arc::clone(&f.cache),
            Arc::clone(&f.tree),
            Arc::clone(&f.io),
            Arc::new(Refuse(Some(IoError::NoSpace {
                reserve: "moving-gc",
            }))),
            small_config(),
        )
        .unwrap();

        let report = gc.run_pass().await;
        assert_eq!(report.write_errors, 1);
        assert_eq!(gc.stats().write_errors, 1);
        assert!(logs_contain("relocation failed"));
        assert_eq!(gc.limiter().in_flight(), 0);
        assert_eq!(gc.buffers().outstanding(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn toggling_is_logged_once_per_change() {
        let f = fixture().await;
        let gc = MovingGc::initialize(
            Arc::clone(&f.cache),
            Arc::clone(&f.tree),
            Arc::clone(&f.io),
            Arc::new(Refuse(None)),
            small_config(),
        )
        .unwrap();
        gc.set_enabled(true);
        assert!(!logs_contain("moving gc toggled"));
        gc.set_enabled(false);
        assert!(!gc.is_enabled());
        assert!(logs_contain("moving gc toggled"));
    }

    #[tokio::test]
    #[traced_test]
    async fn shutdown_while_waiting_for_a_slot_ends_the_pass() {
        let cache = Arc::new(CacheSet::new(&[DeviceGeometry {
            buckets: 8,
            bucket_size: 64,
            movinggc_reserve: 2,
        }]));
        let io = Arc::new(MemBlockIo::with_config(
            Arc::clone(&cache),
            MemIoConfig {
                simulated_latency_us: 50_000,
            },
        ));
        let tree = Arc::new(ExtentTree::new());
        for i in 0..2u64 {
            tree.insert(ExtentKey::new(9, i * 8, 8, Pointer::new(DeviceId(0), 3, i as u32 * 8, 0)));
        }
        cache
            .lock_buckets()
            .unwrap()
            .set_bucket(
                DeviceId(0),
                3,
                BucketState::new(16, GcMark::Reclaimable(Residency::Clean)),
            )
            .unwrap();

        let gc = Arc::new(
            MovingGc::initialize(
                Arc::clone(&cache),
                tree,
                io,
                Arc::new(Refuse(None)),
                GcConfig {
                    max_in_flight: 1,
                    keybuf_capacity: 8,
                    ..GcConfig::default()
                },
            )
            .unwrap(),
        );
        let pass = {
            let gc = Arc::clone(&gc);
            tokio::spawn(async move { gc.run_pass().await }.in_current_span())
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        gc.shutdown();

        let report = pass.await.unwrap();
        assert_eq!(report.stop, PassStop::Shutdown);
        assert_eq!(report.admitted, 1);
        assert_eq!(report.collisions, 1);
        assert_eq!(gc.keybuf().outstanding_claims(), 0);
        assert_eq!(gc.limiter().in_flight(), 0);
        assert!(logs_contain("moving gc shut down"));
        assert!(logs_contain("admission closed"));

        let later = gc.run_pass().await;
        assert_eq!(later.stop, PassStop::Disabled);
        gc.set_enabled(true);
        assert_eq!(gc.run_pass().await.stop, PassStop::Shutdown);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_initialize() {
        let f = fixture().await;
        let result = MovingGc::initialize(
            f.cache,
            f.tree,
            f.io,
            Arc::new(Refuse(None)),
            GcConfig {
                max_in_flight: 0,
                ..GcConfig::default()
            },
        );
        assert!(matches!(result, Err(GcError::Config(_))));
    }
}
