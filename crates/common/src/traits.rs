use futures::future::BoxFuture;

use crate::{ExtentKey, IoError, IoPriority, KeyPos, Pointer, Reserve};

/// Keys collected by one ordered pass over the index.
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    pub keys: Vec<ExtentKey>,
    /// Position the next scan should resume from (inclusive).
    pub resume_at: KeyPos,
    /// The scan reached `end` without filling the batch.
    pub exhausted: bool,
}

/// Ordered extent index the collector scans.
pub trait ExtentIndex: Send + Sync {
    /// Collect up to `limit` keys in `[start, end)` that satisfy `pred`.
    fn scan_matching(
        &self,
        start: &KeyPos,
        end: &KeyPos,
        limit: usize,
        pred: &dyn Fn(&ExtentKey) -> bool,
    ) -> ScanBatch;

    fn lookup(&self, pos: &KeyPos) -> Option<ExtentKey>;
}

/// Asynchronous block submission against cache devices.
pub trait BlockIo: Send + Sync {
    fn read<'a>(
        &'a self,
        ptr: &'a Pointer,
        sectors: u32,
        buf: &'a mut [u8],
        prio: IoPriority,
    ) -> BoxFuture<'a, Result<(), IoError>>;

    fn write<'a>(
        &'a self,
        ptr: &'a Pointer,
        data: &'a [u8],
        prio: IoPriority,
    ) -> BoxFuture<'a, Result<(), IoError>>;
}

/// Request handed to the data-insertion path.
#[derive(Debug, Clone)]
pub struct InsertOp<'a> {
    pub inode: u64,
    pub offset: u64,
    pub sectors: u32,
    pub data: &'a [u8],
    /// Commit only if the index still holds exactly this key.
    pub replace_key: Option<ExtentKey>,
    pub writeback: bool,
    pub csum: bool,
    pub reserve: Reserve,
    pub prio: IoPriority,
}

/// Result of a successful insertion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Committed(ExtentKey),
    /// `replace_key` no longer matched the index; nothing was committed.
    Collision,
}

/// Write data to a fresh location and commit the resulting key.
pub trait DataInsert: Send + Sync {
    fn insert<'a>(&'a self, op: InsertOp<'a>) -> BoxFuture<'a, Result<InsertOutcome, IoError>>;
}
