use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use common::traits::{ExtentIndex, ScanBatch};
use common::{ExtentKey, KeyPos};

/// Ordered in-memory extent index.
///
/// Keys are assumed not to overlap; a key written at an occupied position
/// supersedes the previous one.
#[derive(Debug, Default)]
pub struct ExtentTree {
    keys: RwLock<BTreeMap<KeyPos, ExtentKey>>,
}

impl ExtentTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<KeyPos, ExtentKey>> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<KeyPos, ExtentKey>> {
        self.keys.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert unconditionally, returning the key previously at that position.
    pub fn insert(&self, key: ExtentKey) -> Option<ExtentKey> {
        self.write().insert(key.pos(), key)
    }

    pub fn remove(&self, pos: &KeyPos) -> Option<ExtentKey> {
        self.write().remove(pos)
    }

    pub fn get(&self, pos: &KeyPos) -> Option<ExtentKey> {
        self.read().get(pos).cloned()
    }

    /// Swap in `new` only if the index still holds exactly `expected`.
    pub fn replace(&self, expected: &ExtentKey, new: ExtentKey) -> bool {
        let mut keys = self.write();
        match keys.get_mut(&expected.pos()) {
            Some(current) if current == expected => {
                *current = new;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn keys(&self) -> Vec<ExtentKey> {
        self.read().values().cloned().collect()
    }
}

impl ExtentIndex for ExtentTree {
    fn scan_matching(
        &self,
        start: &KeyPos,
        end: &KeyPos,
        limit: usize,
        pred: &dyn Fn(&ExtentKey) -> bool,
    ) -> ScanBatch {
        let mut batch = ScanBatch {
            keys: Vec::new(),
            resume_at: *end,
            exhausted: true,
        };
        if start >= end || limit == 0 {
            batch.resume_at = *start.max(end);
            batch.exhausted = start >= end;
            return batch;
        }

        let keys = self.read();
        for (pos, key) in keys.range(*start..*end) {
            if !pred(key) {
                continue;
            }
            batch.keys.push(key.clone());
            if batch.keys.len() == limit {
                batch.resume_at = pos.successor();
                batch.exhausted = false;
                break;
            }
        }
        batch
    }

    fn lookup(&self, pos: &KeyPos) -> Option<ExtentKey> {
        self.get(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DeviceId, Pointer};

    fn key(inode: u64, offset: u64, bucket: u64) -> ExtentKey {
        ExtentKey::new(inode, offset, 8, Pointer::new(DeviceId(0), bucket, 0, 0))
    }

    #[test]
    fn scan_respects_limit_and_resume_position() {
        let tree = ExtentTree::new();
        for i in 0..6 {
            tree.insert(key(1, i * 8, i));
        }

        let even = |k: &ExtentKey| k.ptrs[0].bucket % 2 == 0;
        let first = tree.scan_matching(&KeyPos::ZERO, &KeyPos::MAX, 2, &even);
        assert_eq!(first.keys.len(), 2);
        assert!(!first.exhausted);
        assert_eq!(first.resume_at, KeyPos::new(1, 17));

        let rest = tree.scan_matching(&first.resume_at, &KeyPos::MAX, 2, &even);
        assert_eq!(rest.keys.len(), 1);
        assert_eq!(rest.keys[0].offset, 32);
        assert!(rest.exhausted);
        assert_eq!(rest.resume_at, KeyPos::MAX);
    }

    #[test]
    fn replace_detects_changed_keys() {
        let tree = ExtentTree::new();
        let original = key(3, 0, 1);
        tree.insert(original.clone());

        let rewritten = key(3, 0, 2);
        tree.insert(rewritten.clone());
        assert!(!tree.replace(&original, key(3, 0, 5)));
        assert_eq!(tree.get(&original.pos()), Some(rewritten.clone()));

        assert!(tree.replace(&rewritten, key(3, 0, 5)));
        assert_eq!(tree.get(&original.pos()).unwrap().ptrs[0].bucket, 5);
    }

    #[test]
    fn replace_of_removed_key_fails() {
        let tree = ExtentTree::new();
        let original = key(4, 0, 1);
        tree.insert(original.clone());
        tree.remove(&original.pos());
        assert!(!tree.replace(&original, key(4, 0, 2)));
        assert!(tree.is_empty());
    }
}
