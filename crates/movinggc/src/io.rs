//! Relocation of a single extent.
//!
//! A [`MoveOperation`] owns everything a relocation holds: the keybuf claim,
//! the admission slot and the copy buffer. All three are given back when the
//! operation is dropped, whichever way it ends.

use std::sync::Arc;

use common::traits::{BlockIo, DataInsert, ExtentIndex, InsertOp, InsertOutcome};
use common::{ExtentKey, IoPriority, Reserve};
use extent_index::{Keybuf, PendingKey};
use serde::Serialize;
use storage::{CacheSet, PageBuf};
use tracing::{debug, info, trace, warn};

use crate::error::MoveError;
use crate::limiter::AdmissionPermit;
use crate::stats::GcStats;

/// Progress of a relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveState {
    Allocated,
    ReadSubmitted,
    ReadComplete,
    WriteSubmitted,
    Done,
}

/// How a relocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The copy was committed in place of the source key.
    Moved { sectors: u32 },
    /// The source key changed while it was being copied; the copy was
    /// discarded.
    Collision,
    /// The source bucket was recycled before the copy could be written.
    Stale,
    Failed(MoveError),
}

/// Shared handles every relocation needs.
pub(crate) struct MoveContext<I, B, W> {
    pub cache: Arc<CacheSet>,
    pub keybuf: Arc<Keybuf<I>>,
    pub io: Arc<B>,
    pub writer: Arc<W>,
    pub stats: Arc<GcStats>,
}

impl<I, B, W> Clone for MoveContext<I, B, W> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            keybuf: Arc::clone(&self.keybuf),
            io: Arc::clone(&self.io),
            writer: Arc::clone(&self.writer),
            stats: Arc::clone(&self.stats),
        }
    }
}

// Gives back the keybuf claim, then the admission slot.
struct Finalizer<I: ExtentIndex> {
    keybuf: Arc<Keybuf<I>>,
    pending: Option<PendingKey>,
    _permit: AdmissionPermit,
}

impl<I: ExtentIndex> Drop for Finalizer<I> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.keybuf.release(pending);
        }
    }
}

pub(crate) struct MoveOperation<I: ExtentIndex, B, W> {
    ctx: MoveContext<I, B, W>,
    key: ExtentKey,
    state: MoveState,
    buffer: PageBuf,
    _finalizer: Finalizer<I>,
}

impl<I, B, W> MoveOperation<I, B, W>
where
    I: ExtentIndex,
    B: BlockIo,
    W: DataInsert,
{
    pub(crate) fn new(
        ctx: MoveContext<I, B, W>,
        pending: PendingKey,
        permit: AdmissionPermit,
        buffer: PageBuf,
    ) -> Self {
        let key = pending.key().clone();
        let finalizer = Finalizer {
            keybuf: Arc::clone(&ctx.keybuf),
            pending: Some(pending),
            _permit: permit,
        };
        Self {
            ctx,
            key,
            state: MoveState::Allocated,
            buffer,
            _finalizer: finalizer,
        }
    }

    /// Copy the extent and commit it, then release everything held.
    pub(crate) async fn run(mut self) -> MoveOutcome {
        let outcome = self.relocate().await;
        let reached = self.state;
        self.state = MoveState::Done;
        match &outcome {
            MoveOutcome::Moved { sectors } => {
                trace!(key = %self.key, sectors, "extent relocated");
            }
            MoveOutcome::Collision => info!(key = %self.key, "gc copy collision"),
            MoveOutcome::Stale => debug!(key = %self.key, "source went stale during copy"),
            MoveOutcome::Failed(err) => {
                warn!(key = %self.key, state = ?reached, error = %err, "relocation failed")
            }
        }
        self.ctx.stats.record_outcome(&outcome);
        outcome
    }

    async fn relocate(&mut self) -> MoveOutcome {
        let Some(ptr) = self.key.ptrs.first().copied() else {
            return MoveOutcome::Stale;
        };
        let sectors = self.key.size;

        self.state = MoveState::ReadSubmitted;
        let read = self
            .ctx
            .io
            .read(&ptr, sectors, &mut self.buffer, IoPriority::Idle)
            .await;
        self.state = MoveState::ReadComplete;
        // A dirty extent that keeps failing here is never moved, and its
        // writeback can stall behind it.
        if let Err(source) = read {
            return MoveOutcome::Failed(MoveError::Read { source });
        }

        if !self.key.dirty && self.ctx.cache.ptr_stale(&self.key, 0) {
            return MoveOutcome::Stale;
        }

        self.state = MoveState::WriteSubmitted;
        let len = self.key.bytes().min(self.buffer.len());
        let op = InsertOp {
            inode: self.key.inode,
            offset: self.key.offset,
            sectors,
            data: &self.buffer[..len],
            replace_key: Some(self.key.clone()),
            writeback: self.key.dirty,
            csum: self.key.csum,
            reserve: Reserve::MovingGc,
            prio: IoPriority::Background,
        };
        match self.ctx.writer.insert(op).await {
            Ok(InsertOutcome::Committed(_)) => MoveOutcome::Moved { sectors },
            Ok(InsertOutcome::Collision) => MoveOutcome::Collision,
            Err(source) => MoveOutcome::Failed(MoveError::Write { source }),
        }
    }
}
