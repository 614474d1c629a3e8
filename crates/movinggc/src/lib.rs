//! Moving garbage collector for a bcache-style cache set.
//!
//! Cache devices are carved into fixed-size buckets that are only reused
//! whole. As extents are overwritten a bucket's live data thins out, and a
//! bucket holding a little live data still cannot be recycled. The moving
//! collector picks the least-utilised buckets of each device, sized to fit
//! the device's moving-GC reserve, and copies their live extents elsewhere
//! so the allocator can invalidate and reuse them.
//!
//! A pass runs in two phases:
//!
//! 1. [`BucketSelector`] sweeps every device under the bucket lock and
//!    flags the chosen buckets.
//! 2. [`ExtentScanner`] walks the extent index for keys pointing into
//!    flagged buckets, and each key is relocated by its own task, bounded by
//!    the [`AdmissionLimiter`].

pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod io;
pub mod limiter;
pub mod scan;
pub mod select;
pub mod stats;

pub use config::GcConfig;
pub use error::{GcError, GcResult, MoveError};
pub use gc::MovingGc;
pub use heap::{BucketHeap, Candidate};
pub use io::{MoveOutcome, MoveState};
pub use limiter::{AdmissionLimiter, AdmissionPermit};
pub use scan::{moving_predicate, ExtentScanner};
pub use select::{is_reclaimable, BucketSelector, DeviceSelection};
pub use stats::{GcStats, GcStatsSnapshot, PassReport, PassStop};
