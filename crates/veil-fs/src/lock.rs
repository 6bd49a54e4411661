//! Per-inode write serialisation
//!
//! Every backing file has one `RwLock`, shared by all open handles of that
//! file (keyed by st_ino, not by handle). Writes and truncates take the
//! exclusive side so no read-modify-write can interleave; reads take the
//! shared side. Entries are weak so a mount that touches many files does not
//! grow the table forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

#[derive(Default)]
pub struct InodeLocks {
    inner: Mutex<HashMap<u64, Weak<RwLock<()>>>>,
}

impl InodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for a backing inode, creating it on first use.
    pub fn lock_for(&self, ino: u64) -> Arc<RwLock<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = map.get(&ino).and_then(Weak::upgrade) {
            return existing;
        }

        // Drop entries whose files are fully closed before inserting.
        map.retain(|_, weak| weak.strong_count() > 0);

        let lock = Arc::new(RwLock::new(()));
        map.insert(ino, Arc::downgrade(&lock));
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inode_shares_lock() {
        let locks = InodeLocks::new();
        let a = locks.lock_for(7);
        let b = locks.lock_for(7);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_inodes_do_not() {
        let locks = InodeLocks::new();
        let a = locks.lock_for(1);
        let b = locks.lock_for(2);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn dead_entries_are_pruned() {
        let locks = InodeLocks::new();
        let first = locks.lock_for(1);
        drop(first);
        let _other = locks.lock_for(2);
        let map = locks.inner.lock().unwrap();
        assert!(!map.contains_key(&1));
    }
}
