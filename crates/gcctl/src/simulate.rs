use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use extent_index::{ExtentTree, InsertPath};
use movinggc::{GcConfig, GcStatsSnapshot, MovingGc, PassReport};
use serde::Serialize;
use storage::{CacheSet, DeviceGeometry, IoCountersSnapshot, MemBlockIo, MemIoConfig};
use tracing::{info, instrument};

use crate::workload::{Workload, WorkloadSpec, WorkloadSummary};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

#[derive(Clone, Debug, Args)]
pub struct SimulateArgs {
    /// Cache devices in the set.
    #[arg(long, default_value_t = 1)]
    pub devices: u16,
    /// Buckets per device.
    #[arg(long, default_value_t = 256)]
    pub buckets: u64,
    /// Bucket size in sectors.
    #[arg(long, default_value_t = 256)]
    pub bucket_size: u32,
    /// Free buckets per device held for the collector.
    #[arg(long, default_value_t = 8)]
    pub reserve: usize,
    #[arg(long, default_value_t = 8)]
    pub inodes: u64,
    #[arg(long, default_value_t = 2048)]
    pub extents: u64,
    #[arg(long, default_value_t = 8)]
    pub extent_sectors: u32,
    /// Fraction of extents rewritten after the initial fill.
    #[arg(long, default_value_t = 0.6)]
    pub overwrite_ratio: f64,
    /// Fraction of writes issued writeback-dirty.
    #[arg(long, default_value_t = 0.2)]
    pub dirty_ratio: f64,
    /// Collection passes to run.
    #[arg(long, default_value_t = 3)]
    pub passes: u32,
    /// Simulated device latency per request.
    #[arg(long, default_value_t = 0)]
    pub latency_us: u64,
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
    /// YAML collector configuration; MOVINGGC_* variables apply otherwise.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl SimulateArgs {
    fn geometry(&self) -> DeviceGeometry {
        DeviceGeometry {
            buckets: self.buckets,
            bucket_size: self.bucket_size,
            movinggc_reserve: self.reserve,
        }
    }

    fn workload(&self) -> WorkloadSpec {
        WorkloadSpec {
            inodes: self.inodes,
            extents: self.extents,
            extent_sectors: self.extent_sectors,
            overwrite_ratio: self.overwrite_ratio,
            dirty_ratio: self.dirty_ratio,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PassSummary {
    pub pass: u32,
    #[serde(flatten)]
    pub report: PassReport,
    /// Buckets recycled after the pass.
    pub reclaimed: usize,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub cache_set: String,
    pub devices: u16,
    pub geometry: DeviceGeometry,
    pub config: GcConfig,
    pub workload: WorkloadSummary,
    pub free_before: usize,
    pub free_after: usize,
    pub passes: Vec<PassSummary>,
    pub totals: GcStatsSnapshot,
    pub io: IoCountersSnapshot,
    pub verified_extents: u64,
}

pub fn load_config(path: Option<&Path>) -> Result<GcConfig> {
    match path {
        Some(path) => GcConfig::from_yaml_file(path)
            .with_context(|| format!("loading collector config from {}", path.display())),
        None => GcConfig::from_env().context("reading MOVINGGC_* environment"),
    }
}

fn free_buckets(cache: &CacheSet) -> Result<usize> {
    let guard = cache.lock_buckets()?;
    Ok(guard
        .devices()
        .iter()
        .map(|device| guard.free_buckets(device.id()))
        .sum())
}

/// Populate an in-memory cache set, run collection passes over it and
/// check that every extent still reads back intact.
#[instrument(skip(args), fields(devices = args.devices, passes = args.passes, seed = args.seed))]
pub async fn run(args: &SimulateArgs) -> Result<SimulationReport> {
    let config = load_config(args.config.as_deref())?;
    let geometry = args.geometry();
    let geometries = vec![geometry; usize::from(args.devices.max(1))];

    let cache = Arc::new(CacheSet::new(&geometries));
    let io = Arc::new(MemBlockIo::with_config(
        Arc::clone(&cache),
        MemIoConfig {
            simulated_latency_us: args.latency_us,
        },
    ));
    let tree = Arc::new(ExtentTree::new());
    let writer = Arc::new(InsertPath::new(
        Arc::clone(&cache),
        Arc::clone(&tree),
        Arc::clone(&io),
    ));

    let mut workload = Workload::new(args.workload())?;
    let summary = workload.populate(&writer).await?;
    let free_before = free_buckets(&cache)?;

    let gc = MovingGc::initialize(
        Arc::clone(&cache),
        Arc::clone(&tree),
        Arc::clone(&io),
        Arc::clone(&writer),
        config.clone(),
    )?;

    let mut passes = Vec::with_capacity(args.passes as usize);
    for pass in 1..=args.passes {
        let report = gc.run_pass().await;
        // Copies land in open buckets; close them so later passes may
        // select them.
        writer.close_open_buckets();
        let reclaimed = cache.reclaim_empty()?;
        info!(pass, moved = report.moved, reclaimed, "simulation pass finished");
        passes.push(PassSummary {
            pass,
            report,
            reclaimed,
        });
    }

    gc.shutdown();
    let verified_extents = workload.verify(&tree, &io).await?;
    Ok(SimulationReport {
        cache_set: cache.id().as_uuid().to_string(),
        devices: args.devices.max(1),
        geometry,
        config,
        workload: summary,
        free_before,
        free_after: free_buckets(&cache)?,
        passes,
        totals: gc.stats(),
        io: io.counters(),
        verified_extents,
    })
}

pub fn render(report: &SimulationReport, format: OutputFormat) -> Result<String> {
    let text = match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)?,
        OutputFormat::Yaml => serde_yaml::to_string(report)?,
        OutputFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!("Cache set: {}\n", report.cache_set));
            out.push_str(&format!(
                "Workload: {} writes, {} rewrites, {} sectors\n",
                report.workload.written, report.workload.overwritten, report.workload.sectors_written
            ));
            out.push_str(&format!("Free buckets before: {}\n", report.free_before));
            out.push_str("Pass\tBuckets\tMoved\tSectors\tCollide\tStale\tErrors\tReclaimed\tStop\n");
            for pass in &report.passes {
                let r = &pass.report;
                out.push_str(&format!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:?}\n",
                    pass.pass,
                    r.buckets_marked(),
                    r.moved,
                    r.sectors_moved,
                    r.collisions,
                    r.stale,
                    r.read_errors + r.write_errors,
                    pass.reclaimed,
                    r.stop
                ));
            }
            out.push_str(&format!("Free buckets after: {}\n", report.free_after));
            out.push_str(&format!("Extents verified: {}\n", report.verified_extents));
            out
        }
    };
    Ok(text)
}
