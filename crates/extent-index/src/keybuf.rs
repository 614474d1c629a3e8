use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::traits::ExtentIndex;
use common::{ExtentKey, KeyPos};
use tracing::{debug, trace};

/// Keys buffered per refill unless configured otherwise.
pub const DEFAULT_KEYBUF_CAPACITY: usize = 500;

/// Exclusive claim on one buffered key.
///
/// Must be handed back through [`Keybuf::release`]; until then the key is
/// invisible to every other caller of [`Keybuf::next_rescan`].
#[must_use = "a pending key stays claimed until released"]
#[derive(Debug)]
pub struct PendingKey {
    key: ExtentKey,
}

impl PendingKey {
    pub fn key(&self) -> &ExtentKey {
        &self.key
    }

    pub fn pos(&self) -> KeyPos {
        self.key.pos()
    }
}

#[derive(Debug)]
struct Slot {
    key: ExtentKey,
    claimed: bool,
}

#[derive(Debug)]
struct KeybufState {
    /// Next index position a refill resumes from.
    cursor: KeyPos,
    keys: BTreeMap<KeyPos, Slot>,
}

/// Resumable scan buffer over an [`ExtentIndex`].
///
/// Matching keys are pulled from the index in batches and handed out one at
/// a time. A handed-out key stays in the buffer, claimed, until released, so
/// a refill that meets it again will not hand it out twice.
#[derive(Debug)]
pub struct Keybuf<I> {
    index: Arc<I>,
    capacity: usize,
    state: Mutex<KeybufState>,
    granted: AtomicU64,
    released: AtomicU64,
}

impl<I: ExtentIndex> Keybuf<I> {
    pub fn new(index: Arc<I>, capacity: usize) -> Self {
        Self {
            index,
            capacity: capacity.max(1),
            state: Mutex::new(KeybufState {
                cursor: KeyPos::ZERO,
                keys: BTreeMap::new(),
            }),
            granted: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> &Arc<I> {
        &self.index
    }

    fn state(&self) -> MutexGuard<'_, KeybufState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the first unclaimed buffered key that still satisfies `pred`,
    /// refilling from the cursor while none is left and the scan has not
    /// reached `end`. Unclaimed keys failing `pred` are dropped.
    pub fn next_rescan(&self, end: &KeyPos, pred: &dyn Fn(&ExtentKey) -> bool) -> Option<PendingKey> {
        loop {
            let (start, room) = {
                let mut state = self.state();
                let mut unmatched = Vec::new();
                let mut granted = None;
                for (pos, slot) in state.keys.iter_mut().filter(|(_, slot)| !slot.claimed) {
                    if pred(&slot.key) {
                        slot.claimed = true;
                        granted = Some(slot.key.clone());
                        break;
                    }
                    unmatched.push(*pos);
                }
                // Left over from an earlier scan and no longer wanted.
                for pos in &unmatched {
                    state.keys.remove(pos);
                }
                if !unmatched.is_empty() {
                    trace!(dropped = unmatched.len(), "dropped buffered keys that stopped matching");
                }
                if let Some(key) = granted {
                    self.granted.fetch_add(1, Ordering::Relaxed);
                    return Some(PendingKey { key });
                }
                if state.cursor >= *end {
                    debug!("scan finished");
                    return None;
                }
                (state.cursor, self.capacity.saturating_sub(state.keys.len()))
            };

            if room == 0 {
                debug!(capacity = self.capacity, "keybuf saturated with claimed keys");
                return None;
            }

            let batch = self.index.scan_matching(&start, end, room, pred);
            let mut state = self.state();
            let mut added = 0usize;
            for key in batch.keys {
                state.keys.entry(key.pos()).or_insert_with(|| {
                    added += 1;
                    Slot {
                        key,
                        claimed: false,
                    }
                });
            }
            if batch.resume_at > state.cursor {
                state.cursor = batch.resume_at;
            }
            trace!(added, cursor = %state.cursor, "keybuf refilled");
        }
    }

    /// Drop a claim and forget the key. Releasing a key that is no longer
    /// claimed is a no-op.
    pub fn release(&self, pending: PendingKey) {
        let pos = pending.pos();
        let mut state = self.state();
        if state.keys.get(&pos).is_some_and(|slot| slot.claimed) {
            state.keys.remove(&pos);
            self.released.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Restart the next scan from the beginning of the index.
    pub fn reset_cursor(&self) {
        self.state().cursor = KeyPos::ZERO;
    }

    pub fn cursor(&self) -> KeyPos {
        self.state().cursor
    }

    /// Keys currently buffered, claimed or not.
    pub fn buffered(&self) -> usize {
        self.state().keys.len()
    }

    pub fn claims_granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    pub fn claims_released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    pub fn outstanding_claims(&self) -> usize {
        self.state().keys.values().filter(|slot| slot.claimed).count()
    }
}
