use common::traits::ExtentIndex;
use common::{ExtentKey, KeyPos};
use extent_index::{Keybuf, PendingKey};
use storage::CacheSet;
use tracing::trace;

use crate::stats::GcStats;

/// Matches keys with at least one live pointer into a bucket flagged for
/// evacuation.
pub fn moving_predicate(cache: &CacheSet) -> impl Fn(&ExtentKey) -> bool + '_ {
    move |key| {
        key.ptrs.iter().any(|ptr| {
            cache.ptr_available(ptr) && cache.bucket(ptr).is_some_and(|bucket| bucket.is_moving())
        })
    }
}

/// One ordered sweep of the index for keys living in flagged buckets.
///
/// Keys whose first pointer is already stale are released on the spot and
/// never reach the caller.
pub struct ExtentScanner<'a, I> {
    cache: &'a CacheSet,
    keybuf: &'a Keybuf<I>,
    stats: &'a GcStats,
    end: KeyPos,
    skipped_stale: u64,
    stopped: bool,
}

impl<'a, I: ExtentIndex> ExtentScanner<'a, I> {
    /// Begin a sweep from the start of the index.
    pub fn start(cache: &'a CacheSet, keybuf: &'a Keybuf<I>, stats: &'a GcStats) -> Self {
        keybuf.reset_cursor();
        Self {
            cache,
            keybuf,
            stats,
            end: KeyPos::MAX,
            skipped_stale: 0,
            stopped: false,
        }
    }

    /// Claim the next relocatable key, or `None` once the sweep is finished
    /// or the cache set is stopping.
    pub fn next_key(&mut self) -> Option<PendingKey> {
        let pred = moving_predicate(self.cache);
        loop {
            if self.cache.is_stopping() {
                self.stopped = true;
                return None;
            }
            let pending = self.keybuf.next_rescan(&self.end, &pred)?;
            if self.cache.ptr_stale(pending.key(), 0) {
                trace!(key = %pending.key(), "dropping stale key");
                self.keybuf.release(pending);
                self.skipped_stale += 1;
                self.stats.record_stale();
                continue;
            }
            return Some(pending);
        }
    }

    /// Whether the sweep ended because of shutdown.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn skipped_stale(&self) -> u64 {
        self.skipped_stale
    }
}
