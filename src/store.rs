//! The public façade: wires the blob file (B), the B+Tree index (I), the
//! free-space manager (F), the dirty-flag lock, and the mark set together behind a
//! single `Store` handle. Mirrors `blob.rs`'s closure-passing idiom at one level up:
//! `check`/`repair` hand `BTreeIndex`/`FreeSpace` methods to `BlobFile` as closures
//! rather than giving `BlobFile` a reference to its siblings.

use std::path::Path;

use tracing::{info, warn};

use crate::blob::{BlobFile, CheckReport};
use crate::btree::BTreeIndex;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::freespace::FreeSpace;
use crate::lockfile::StoreLock;
use crate::markset::MarkSet;
use crate::progress::Progress;

pub struct Store {
    config: StoreConfig,
    blob: BlobFile,
    index: BTreeIndex,
    freespace: FreeSpace,
    marks: Option<MarkSet>,
    lock: StoreLock,
    /// Whether `index.dirty` already existed at open time, i.e. the previous session
    /// did not call `sync`/`close` cleanly.
    recovered_from_unclean_shutdown: bool,
}

impl Store {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let lock = StoreLock::acquire(
            config.dir.join("store.lock"),
            config.lock_timeout_secs,
            config.lock_max_retries,
            config.lock_pause_secs,
        )?;

        let recovered_from_unclean_shutdown = config.dirty_lock_path().exists();
        if recovered_from_unclean_shutdown {
            warn!("index.dirty present at open: previous session did not shut down cleanly");
        }

        let mut blob = BlobFile::open(config.blob_path())?;
        let mut index = BTreeIndex::open(
            config.index_path(),
            config.btree_order,
            config.cache_capacity,
            config.flush_delay,
        )?;
        let mut freespace = FreeSpace::open(config.spaces_path())?;

        let legacy_path = config.legacy_spaces_path();
        if legacy_path.exists() {
            info!("legacy free-space file found, rebuilding free space from a full blob scan");
            let report = Self::migrate_legacy_spaces(&mut blob, &mut index, &mut freespace)?;
            if report.error_count() > 0 {
                warn!(
                    errors = report.error_count(),
                    "legacy free-space migration found and fixed blob inconsistencies"
                );
            }
            std::fs::remove_file(&legacy_path)?;
        }

        let mut store = Store {
            config,
            blob,
            index,
            freespace,
            marks: None,
            lock,
            recovered_from_unclean_shutdown,
        };

        if store.recovered_from_unclean_shutdown {
            let report = store.check(true)?;
            if report.error_count() > 0 {
                warn!(
                    errors = report.error_count(),
                    "repair after unclean shutdown found and fixed inconsistencies"
                );
            }
        }

        Ok(store)
    }

    /// The legacy free-space file's on-disk layout predates this version; rather than
    /// port its reader, rebuild F from a full blob-file scan the same way `repair`
    /// does, discarding whatever the legacy file held.
    fn migrate_legacy_spaces(
        blob: &mut BlobFile,
        index: &mut BTreeIndex,
        freespace: &mut FreeSpace,
    ) -> Result<CheckReport> {
        // `repair` resets both the index and `freespace` itself before rescanning.
        let index_cell = std::cell::RefCell::new(index);
        let report = blob.repair(
            || index_cell.borrow_mut().clear(),
            |id| index_cell.borrow_mut().get(id),
            |id, offset| index_cell.borrow_mut().insert(id, offset).map(|_| ()),
            freespace,
        )?;
        Ok(report)
    }

    pub fn was_recovered_from_unclean_shutdown(&self) -> bool {
        self.recovered_from_unclean_shutdown
    }

    fn mark_dirty(&mut self) -> Result<()> {
        if !self.config.dirty_lock_path().exists() {
            std::fs::write(self.config.dirty_lock_path(), std::process::id().to_string())?;
        }
        Ok(())
    }

    fn clear_dirty(&mut self) -> Result<()> {
        match std::fs::remove_file(self.config.dirty_lock_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write algorithm: mark any existing record for `id` outdated,
    /// place and write the new payload, update the index, then clear the superseded
    /// record. Marking-outdated-before-writing-the-new-copy is what makes an
    /// interrupted overwrite recoverable: `repair` sees two candidate records and
    /// keeps the non-outdated one.
    #[tracing::instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub fn put(&mut self, id: u64, bytes: &[u8]) -> Result<()> {
        self.mark_dirty()?;
        let old_offset = self.index.get(id)?;
        if let Some(old) = old_offset {
            self.blob.mark_outdated(old)?;
        }
        let new_offset = self.blob.place_and_write(id, bytes, &mut self.freespace)?;
        self.index.insert(id, new_offset)?;
        if let Some(old) = old_offset {
            self.blob.clear_record(old, &mut self.freespace)?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn get(&mut self, id: u64) -> Result<Option<Vec<u8>>> {
        match self.index.get(id)? {
            Some(offset) => Ok(Some(self.blob.read_at(offset, id)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&mut self, id: u64) -> Result<bool> {
        Ok(self.index.get(id)?.is_some())
    }

    #[tracing::instrument(skip(self))]
    pub fn delete(&mut self, id: u64) -> Result<bool> {
        match self.index.remove(id)? {
            Some(offset) => {
                self.mark_dirty()?;
                self.blob.clear_record(offset, &mut self.freespace)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn entries_count(&self) -> u64 {
        self.index.entries_count()
    }

    /// Best match with a minimum gap, used by
    /// range-style lookups that tolerate the nearest id at least `min_miss_increment`
    /// away from `id` when there is no exact hit.
    pub fn get_best_match(&mut self, id: u64, min_miss_increment: u64) -> Result<Option<(u64, Vec<u8>)>> {
        match self.index.get_best_match(id, min_miss_increment)? {
            Some((key, offset)) => Ok(Some((key, self.blob.read_at(offset, key)?))),
            None => Ok(None),
        }
    }

    /// Place a new record for `id` without marking or clearing any existing copy --
    /// the building block `refresh_all` uses to rewrite every record in place;
    /// `put` is the normal single-record path and should be
    /// preferred unless the caller is doing its own bulk bookkeeping.
    pub fn write_raw(&mut self, id: u64, bytes: &[u8]) -> Result<u64> {
        self.mark_dirty()?;
        self.blob.place_and_write(id, bytes, &mut self.freespace)
    }

    /// Bulk migrate: re-encode every record currently in the index as a new record
    /// (fresh CRC, re-evaluated against the compression threshold) and retire its old
    /// copy. Used to pick up a change to the compression threshold or to squeeze out
    /// accumulated fragmentation without a full `repair`.
    pub fn refresh_all(&mut self) -> Result<()> {
        for (id, old_offset) in self.index.each()? {
            let bytes = self.blob.read_at(old_offset, id)?;
            let new_offset = self.write_raw(id, &bytes)?;
            self.index.insert(id, new_offset)?;
            self.blob.clear_record(old_offset, &mut self.freespace)?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.blob.sync()?;
        self.freespace.sync()?;
        self.index.sync()?;
        self.clear_dirty()
    }

    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        self.blob.close()?;
        self.index.close()?;
        self.freespace.close()?;
        if let Some(marks) = self.marks.take() {
            marks.erase()?;
        }
        self.lock.release()
    }

    /// Verify (or, if `repair` is true, fix) every cross-component invariant: blob
    /// checksums, index/blob agreement, free-space/blob agreement, and the B+Tree's
    /// own shape invariants. Returns the merged report.
    #[tracing::instrument(skip(self))]
    pub fn check(&mut self, repair: bool) -> Result<CheckReport> {
        let progress = Progress::hidden();
        if repair {
            // `repair` hands the index to three separate closures (reset, get,
            // insert) that must not all hold their own exclusive borrow of it at
            // once; a `RefCell` lets each borrow `&mut BTreeIndex` only for the
            // span of its own call.
            let index_cell = std::cell::RefCell::new(&mut self.index);
            let freespace = &mut self.freespace;
            let mut report = self.blob.repair(
                || index_cell.borrow_mut().clear(),
                |id| index_cell.borrow_mut().get(id),
                |id, offset| index_cell.borrow_mut().insert(id, offset).map(|_| ()),
                freespace,
            )?;
            drop(index_cell);
            self.index.check(|msg| report.note(msg))?;
            progress.finish();
            return Ok(report);
        }

        let index = &mut self.index;
        let freespace = &mut self.freespace;
        let mut report = self.blob.check(
            |id| index.get(id),
            |offset, size| freespace.has_space(offset, size),
        )?;
        self.index.check(|msg| report.note(msg))?;
        for msg in self.freespace.check()? {
            report.note(msg);
        }
        progress.finish();
        Ok(report)
    }

    /// Reset the mark set ahead of a GC sweep, sized loosely to the
    /// current entry count.
    pub fn clear_marks(&mut self) -> Result<()> {
        let expected = self.index.entries_count();
        let marks = self
            .marks
            .get_or_insert_with(|| MarkSet::new(self.config.marks_path()));
        marks.clear(expected)
    }

    pub fn mark(&mut self, id: u64) -> Result<()> {
        let marks = self
            .marks
            .get_or_insert_with(|| MarkSet::new(self.config.marks_path()));
        marks.insert(id)
    }

    pub fn is_marked(&mut self, id: u64) -> Result<bool> {
        match self.marks.as_mut() {
            Some(marks) => marks.includes(id),
            None => Ok(false),
        }
    }

    /// Delete every record whose id was not `mark`ed since the last `clear_marks`,
    /// then defragment. Returns the deleted ids.
    #[tracing::instrument(skip(self))]
    pub fn sweep(&mut self) -> Result<Vec<u64>> {
        self.mark_dirty()?;
        let entries = self.index.entries_count();
        let progress = Progress::new(entries, "sweep");
        let mut deleted = Vec::new();

        let marks = self.marks.as_mut();
        let freespace = &mut self.freespace;
        let report = match marks {
            Some(marks) => self.blob.delete_unmarked(
                freespace,
                |id| marks.includes(id).unwrap_or(false),
                |id| {
                    deleted.push(id);
                    progress.inc(1);
                },
            )?,
            None => {
                // No `clear_marks`/`mark` calls were made: treat every id as unmarked
                // and delete nothing, matching a sweep with an empty mark set.
                progress.finish();
                self.defragment()?;
                return Ok(deleted);
            }
        };
        for msg in &report.findings {
            warn!(%msg, "sweep recovered from blob corruption");
        }

        for id in &deleted {
            self.index.remove(*id)?;
        }
        progress.finish();
        self.defragment()?;
        Ok(deleted)
    }

    /// Rewrite the blob file eliminating every hole, keeping the index in step with
    /// each record's new offset.
    pub fn defragment(&mut self) -> Result<()> {
        self.mark_dirty()?;
        let progress = Progress::hidden();
        let index = &mut self.index;
        self.blob.defragment(&mut self.freespace, |id, offset| {
            index.insert(id, offset).map(|_| ())
        })?;
        progress.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> Store {
        Store::open(StoreConfig::new(dir).with_btree_order(5)).unwrap()
    }

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        assert!(store.get(1).unwrap().is_none());
        store.put(1, b"hello").unwrap();
        assert_eq!(store.get(1).unwrap().unwrap(), b"hello");
        assert!(store.contains(1).unwrap());
        assert!(store.delete(1).unwrap());
        assert!(store.get(1).unwrap().is_none());
        assert!(!store.delete(1).unwrap());
    }

    #[test]
    fn overwrite_reuses_a_hole_of_the_same_size() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        store.put(1, &vec![b'a'; 300]).unwrap();
        store.put(2, &vec![b'b'; 300]).unwrap();
        store.put(1, &vec![b'c'; 300]).unwrap();
        assert_eq!(store.get(1).unwrap().unwrap(), vec![b'c'; 300]);
        assert_eq!(store.get(2).unwrap().unwrap(), vec![b'b'; 300]);
    }

    #[test]
    fn sweep_deletes_unmarked_ids() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        for id in 1..=10u64 {
            store.put(id, format!("value-{id}").as_bytes()).unwrap();
        }
        store.clear_marks().unwrap();
        for id in (1..=10u64).filter(|i| i % 2 == 0) {
            store.mark(id).unwrap();
        }
        let deleted = store.sweep().unwrap();
        assert_eq!(deleted.len(), 5);
        for id in 1..=10u64 {
            assert_eq!(store.contains(id).unwrap(), id % 2 == 0);
        }
    }

    #[test]
    fn check_reports_no_errors_on_a_healthy_store() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        for id in 1..=50u64 {
            store.put(id, format!("value-{id}").as_bytes()).unwrap();
        }
        store.sync().unwrap();
        let report = store.check(false).unwrap();
        assert_eq!(report.error_count(), 0, "{:?}", report.findings);
    }

    #[test]
    fn refresh_all_rewrites_every_record_and_preserves_values() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        for id in 1..=20u64 {
            store.put(id, format!("value-{id}").as_bytes()).unwrap();
        }
        store.refresh_all().unwrap();
        for id in 1..=20u64 {
            assert_eq!(store.get(id).unwrap().unwrap(), format!("value-{id}").into_bytes());
        }
        let report = store.check(false).unwrap();
        assert_eq!(report.error_count(), 0, "{:?}", report.findings);
    }

    #[test]
    fn legacy_spaces_file_triggers_a_full_rebuild_from_the_blob_scan() {
        let dir = tempdir().unwrap();
        {
            let mut store = open(dir.path());
            for id in 1..=5u64 {
                store.put(id, format!("value-{id}").as_bytes()).unwrap();
            }
            store.delete(3).unwrap();
            store.close().unwrap();
        }
        assert!(!dir.path().join("index.dirty").exists());
        let legacy_path = dir.path().join("database_spaces.blobs.legacy");
        std::fs::write(&legacy_path, b"legacy-format-placeholder").unwrap();

        let mut store = open(dir.path());
        assert!(!store.was_recovered_from_unclean_shutdown());
        assert!(!legacy_path.exists());

        let report = store.check(false).unwrap();
        assert_eq!(report.error_count(), 0, "{:?}", report.findings);

        // The hole left by deleting id 3 should have been reconciled into F by the
        // migration; an exact-size write should reuse it without growing the file.
        let before = std::fs::metadata(dir.path().join("database.blobs")).unwrap().len();
        store.put(6, format!("value-{}", 3).as_bytes()).unwrap();
        let after = std::fs::metadata(dir.path().join("database.blobs")).unwrap().len();
        assert!(after <= before, "file grew: {after} > {before}");
        assert_eq!(store.get(6).unwrap().unwrap(), b"value-3");
    }

    #[test]
    fn reopen_after_sync_preserves_data_and_clears_dirty_flag() {
        let dir = tempdir().unwrap();
        {
            let mut store = open(dir.path());
            store.put(7, b"persisted").unwrap();
            store.close().unwrap();
        }
        assert!(!dir.path().join("index.dirty").exists());
        let mut store = open(dir.path());
        assert_eq!(store.get(7).unwrap().unwrap(), b"persisted");
        assert!(!store.was_recovered_from_unclean_shutdown());
    }
}
