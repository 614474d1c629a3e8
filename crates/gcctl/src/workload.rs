//! Seeded foreground workload used to fragment a simulated cache set.

use std::collections::HashMap;

use anyhow::{bail, ensure, Context, Result};
use common::traits::BlockIo;
use common::{IoPriority, KeyPos, SECTOR_SIZE};
use extent_index::{ExtentTree, InsertPath};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use storage::MemBlockIo;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub inodes: u64,
    pub extents: u64,
    pub extent_sectors: u32,
    /// Fraction of extents rewritten after the initial fill.
    pub overwrite_ratio: f64,
    /// Fraction of writes issued writeback-dirty.
    pub dirty_ratio: f64,
    pub seed: u64,
}

impl WorkloadSpec {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.inodes > 0, "inodes must be at least 1");
        ensure!(self.extent_sectors > 0, "extent_sectors must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.overwrite_ratio),
            "overwrite_ratio must be within [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&self.dirty_ratio),
            "dirty_ratio must be within [0, 1]"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadSummary {
    pub written: u64,
    pub overwritten: u64,
    pub sectors_written: u64,
}

/// Drives writes through the foreground path and remembers what every live
/// extent should contain.
pub struct Workload {
    spec: WorkloadSpec,
    rng: StdRng,
    expected: HashMap<KeyPos, u8>,
}

impl Workload {
    pub fn new(spec: WorkloadSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            rng: StdRng::seed_from_u64(spec.seed),
            spec,
            expected: HashMap::new(),
        })
    }

    fn position(&self, index: u64) -> (u64, u64) {
        let inode = index % self.spec.inodes;
        let offset = (index / self.spec.inodes) * u64::from(self.spec.extent_sectors);
        (inode, offset)
    }

    async fn write_one(&mut self, writer: &InsertPath<MemBlockIo>, index: u64) -> Result<()> {
        let (inode, offset) = self.position(index);
        let fill: u8 = self.rng.random();
        let dirty = self.rng.random_bool(self.spec.dirty_ratio);
        let data = vec![fill; self.spec.extent_sectors as usize * SECTOR_SIZE];
        writer
            .write(inode, offset, &data, dirty)
            .await
            .with_context(|| format!("write of extent {inode}:{offset} failed; shrink the workload"))?;
        self.expected.insert(KeyPos::new(inode, offset), fill);
        Ok(())
    }

    /// Fill the index, then rewrite a random subset so older buckets thin
    /// out.
    pub async fn populate(&mut self, writer: &InsertPath<MemBlockIo>) -> Result<WorkloadSummary> {
        let mut summary = WorkloadSummary::default();
        for index in 0..self.spec.extents {
            self.write_one(writer, index).await?;
            summary.written += 1;
        }

        let rewrites = (self.spec.extents as f64 * self.spec.overwrite_ratio) as u64;
        if self.spec.extents > 0 {
            for _ in 0..rewrites {
                let index = self.rng.random_range(0..self.spec.extents);
                self.write_one(writer, index).await?;
                summary.overwritten += 1;
            }
        }
        summary.sectors_written =
            (summary.written + summary.overwritten) * u64::from(self.spec.extent_sectors);

        writer.close_open_buckets();
        info!(
            written = summary.written,
            overwritten = summary.overwritten,
            "workload populated"
        );
        Ok(summary)
    }

    /// Read back every indexed extent and compare it with what was last
    /// written there. Returns the number of extents checked.
    pub async fn verify(&self, tree: &ExtentTree, io: &MemBlockIo) -> Result<u64> {
        let keys = tree.keys();
        if keys.len() != self.expected.len() {
            bail!(
                "index holds {} extents, workload wrote {}",
                keys.len(),
                self.expected.len()
            );
        }

        let mut checked = 0u64;
        for key in keys {
            let Some(&fill) = self.expected.get(&key.pos()) else {
                bail!("unexpected extent {key} in index");
            };
            let ptr = key
                .ptrs
                .first()
                .with_context(|| format!("extent {key} has no pointers"))?;
            let mut buf = vec![0u8; key.bytes()];
            io.read(ptr, key.size, &mut buf, IoPriority::Normal)
                .await
                .with_context(|| format!("read of {key} failed"))?;
            if buf.iter().any(|&b| b != fill) {
                bail!("extent {key} does not hold its last written data");
            }
            checked += 1;
        }
        debug!(checked, "extents verified");
        Ok(checked)
    }
}
