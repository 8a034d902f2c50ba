//! Two-tier write-back node/object cache C.
//!
//! An "unmodified" ring of fixed capacity `K` (slot = `uid mod K`) holds clean
//! entries; a "modified" hash map holds entries with pending writes, unbounded. A
//! modified entry always shadows whatever sits in the unmodified ring's slot for the
//! same uid — callers never see a stale clean copy once a modification exists.
//!
//! `load`/`save` are not stored on the cache itself (storing a closure here would tie
//! the cache's lifetime to its backing store's borrow and fight the borrow checker the
//! moment the owner also needs to hold both); callers pass them per call, the same way
//! `crate::blob::BlobFile` takes `index_get`/`reindex` closures instead of holding a
//! reference to the index.

pub struct Cache<T: Clone> {
    capacity: usize,
    ring: Vec<Option<(u64, T)>>,
    modified: std::collections::HashMap<u64, T>,
    flush_delay: u32,
    pending: u32,
}

impl<T: Clone> Cache<T> {
    pub fn new(capacity: usize, flush_delay: u32) -> Self {
        assert!(capacity > 0, "cache capacity must be nonzero");
        Cache {
            capacity,
            ring: vec![None; capacity],
            modified: std::collections::HashMap::new(),
            flush_delay,
            pending: 0,
        }
    }

    fn slot(&self, uid: u64) -> usize {
        (uid as usize) % self.capacity
    }

    /// Fetch `uid`, consulting the modified map, then the unmodified ring, then
    /// falling back to `load` on a full miss and caching the result unmodified.
    pub fn get(&mut self, uid: u64, load: impl FnOnce() -> crate::error::Result<T>) -> crate::error::Result<T> {
        if let Some(v) = self.modified.get(&uid) {
            return Ok(v.clone());
        }
        let slot = self.slot(uid);
        if let Some((ring_uid, v)) = &self.ring[slot] {
            if *ring_uid == uid {
                return Ok(v.clone());
            }
        }
        let v = load()?;
        self.ring[slot] = Some((uid, v.clone()));
        Ok(v)
    }

    /// Insert/overwrite `uid` in the unmodified ring without marking it dirty (used
    /// right after a backing-store write that is already durable).
    pub fn insert_unmodified(&mut self, uid: u64, value: T) {
        self.modified.remove(&uid);
        let slot = self.slot(uid);
        self.ring[slot] = Some((uid, value));
    }

    /// Mark `uid` modified, shadowing any unmodified copy at the same uid.
    pub fn insert_modified(&mut self, uid: u64, value: T) {
        let slot = self.slot(uid);
        if matches!(&self.ring[slot], Some((ring_uid, _)) if *ring_uid == uid) {
            self.ring[slot] = None;
        }
        self.modified.insert(uid, value);
    }

    pub fn delete(&mut self, uid: u64) {
        self.modified.remove(&uid);
        let slot = self.slot(uid);
        if matches!(&self.ring[slot], Some((ring_uid, _)) if *ring_uid == uid) {
            self.ring[slot] = None;
        }
    }

    pub fn is_modified(&self, uid: u64) -> bool {
        self.modified.contains_key(&uid)
    }

    /// Write every modified entry through `save`, then promote it to the unmodified
    /// ring. A non-forced call is a no-op until `flush_delay` calls have accumulated,
    /// letting bursts of mutation batch their writes.
    pub fn flush(
        &mut self,
        force: bool,
        mut save: impl FnMut(u64, &T) -> crate::error::Result<()>,
    ) -> crate::error::Result<()> {
        self.pending += 1;
        if !force && self.pending < self.flush_delay {
            return Ok(());
        }
        self.pending = 0;
        let entries: Vec<(u64, T)> = self.modified.drain().collect();
        for (uid, value) in entries {
            save(uid, &value)?;
            let slot = self.slot(uid);
            self.ring[slot] = Some((uid, value));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.ring.iter_mut().for_each(|s| *s = None);
        self.modified.clear();
        self.pending = 0;
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.modified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modified_entry_shadows_unmodified_ring_slot() {
        let mut c: Cache<u64> = Cache::new(4, 2);
        c.insert_unmodified(1, 100);
        c.insert_modified(1, 200);
        let v = c.get(1, || panic!("should not load, modified copy present")).unwrap();
        assert_eq!(v, 200);
    }

    #[test]
    fn miss_calls_load_and_caches_unmodified() {
        let mut c: Cache<u64> = Cache::new(4, 2);
        let mut loads = 0;
        let v1 = c
            .get(5, || {
                loads += 1;
                Ok(50)
            })
            .unwrap();
        assert_eq!(v1, 50);
        let v2 = c.get(5, || panic!("should hit ring, not reload")).unwrap();
        assert_eq!(v2, 50);
        assert_eq!(loads, 1);
    }

    #[test]
    fn flush_defers_until_flush_delay_then_saves_and_promotes() {
        let mut c: Cache<u64> = Cache::new(4, 3);
        c.insert_modified(9, 900);
        let mut saved = vec![];
        c.flush(false, |uid, v| {
            saved.push((uid, *v));
            Ok(())
        })
        .unwrap();
        assert!(saved.is_empty(), "first call should defer");
        c.flush(false, |uid, v| {
            saved.push((uid, *v));
            Ok(())
        })
        .unwrap();
        c.flush(false, |uid, v| {
            saved.push((uid, *v));
            Ok(())
        })
        .unwrap();
        assert_eq!(saved, vec![(9, 900)]);
        assert!(!c.is_modified(9), "entry should be promoted to unmodified after flush");
    }

    #[test]
    fn forced_flush_runs_immediately() {
        let mut c: Cache<u64> = Cache::new(4, 100);
        c.insert_modified(1, 10);
        let mut saved = vec![];
        c.flush(true, |uid, v| {
            saved.push((uid, *v));
            Ok(())
        })
        .unwrap();
        assert_eq!(saved, vec![(1, 10)]);
    }

    #[test]
    fn delete_removes_from_both_tiers() {
        let mut c: Cache<u64> = Cache::new(4, 1);
        c.insert_unmodified(1, 10);
        c.insert_modified(1, 20);
        c.delete(1);
        assert!(!c.is_modified(1));
        let mut loads = 0;
        c.get(1, || {
            loads += 1;
            Ok(99)
        })
        .unwrap();
        assert_eq!(loads, 1, "deleted entry must not be served from either tier");
    }
}
