//! End-to-end scenarios for the full `Store` façade.

use eikyu_store::{Store, StoreConfig};
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> Store {
    Store::open(StoreConfig::new(dir)).unwrap()
}

fn open_order(dir: &std::path::Path, order: u16) -> Store {
    Store::open(StoreConfig::new(dir).with_btree_order(order)).unwrap()
}

#[test]
fn scenario_1_empty_round_trip() {
    let dir = tempdir().unwrap();
    {
        let mut store = open(dir.path());
        store.put(1, b"hello").unwrap();
        store.sync().unwrap();
        store.close().unwrap();
    }
    let mut store = open(dir.path());
    assert_eq!(store.get(1).unwrap().unwrap(), b"hello");
    assert!(store.contains(1).unwrap());
    assert_eq!(store.entries_count(), 1);

    assert!(store.delete(1).unwrap());
    assert!(store.get(1).unwrap().is_none());
    assert_eq!(store.entries_count(), 0);
}

#[test]
fn scenario_2_compression_boundary() {
    let dir = tempdir().unwrap();
    let mut store = open(dir.path());
    let exactly_256 = vec![b'a'; 256];
    let just_over_256 = vec![b'a'; 257];

    store.put(2, &exactly_256).unwrap();
    store.put(3, &just_over_256).unwrap();

    assert_eq!(store.get(2).unwrap().unwrap(), exactly_256);
    assert_eq!(store.get(3).unwrap().unwrap(), just_over_256);
}

#[test]
fn scenario_3_hole_reuse_does_not_grow_the_file() {
    // The upstream scenario narrative (100/100/80 bytes, "leaving a 20 -
    // header_size hole") is internally inconsistent: header_size is 25 bytes, so an
    // 80-byte write into a 100-byte hole would leave only a 20-byte leftover, too
    // small to host another record header. An exact-fit write is what the
    // placement rule (blob.rs) actually reuses a hole for, so that's what this
    // checks: record 3 exactly fills the hole record 1 leaves.
    let dir = tempdir().unwrap();
    let mut store = open(dir.path());
    store.put(1, &vec![b'x'; 100]).unwrap();
    store.put(2, &vec![b'y'; 100]).unwrap();
    store.sync().unwrap();
    let high_water = std::fs::metadata(dir.path().join("database.blobs"))
        .unwrap()
        .len();

    store.delete(1).unwrap();
    store.put(3, &vec![b'z'; 100]).unwrap();
    store.sync().unwrap();

    let after = std::fs::metadata(dir.path().join("database.blobs"))
        .unwrap()
        .len();
    assert!(after <= high_water, "file grew: {after} > {high_water}");
    assert_eq!(store.get(3).unwrap().unwrap(), vec![b'z'; 100]);
    assert_eq!(store.get(2).unwrap().unwrap(), vec![b'y'; 100]);
}

#[test]
fn scenario_4_overwrite_and_crash_recovery() {
    use eikyu_store::blob::BlobFile;
    use eikyu_store::freespace::FreeSpace;

    let dir = tempdir().unwrap();

    // Simulate a crash between write-algorithm step 4 (new copy written, indexed)
    // and step 6 (old copy cleared): leave both copies of id 1 physically present
    // in the blob file, with the stale one correctly flagged outdated, but never
    // touch the index -- as if the process died before the in-memory index update
    // was even flushed.
    {
        let mut blob = BlobFile::open(dir.path().join("database.blobs")).unwrap();
        let mut freespace = FreeSpace::open(dir.path().join("database_spaces.blobs")).unwrap();
        let stale_offset = blob.place_and_write(1, b"a", &mut freespace).unwrap();
        blob.mark_outdated(stale_offset).unwrap();
        blob.place_and_write(1, b"bb", &mut freespace).unwrap();
        blob.sync().unwrap();
        freespace.sync().unwrap();
    }

    let mut store = open(dir.path());
    let report = store.check(true).unwrap();
    assert!(report.error_count() > 0, "repair should report the duplicate id");
    assert_eq!(store.get(1).unwrap().unwrap(), b"bb");
}

#[test]
fn scenario_5_btree_split_and_merge() {
    let dir = tempdir().unwrap();
    let mut store = open_order(dir.path(), 5);

    for key in 1..100u64 {
        store.put(key, format!("v{key}").as_bytes()).unwrap();
    }
    for key in 1..100u64 {
        assert_eq!(store.get(key).unwrap().unwrap(), format!("v{key}").into_bytes());
    }
    let report = store.check(false).unwrap();
    assert_eq!(report.error_count(), 0, "{:?}", report.findings);

    for key in (1..100u64).rev() {
        assert!(store.delete(key).unwrap(), "delete failed for key {key}");
        let report = store.check(false).unwrap();
        assert_eq!(
            report.error_count(),
            0,
            "check failed after removing key {key}: {:?}",
            report.findings
        );
    }
    assert_eq!(store.entries_count(), 0);
}

#[test]
fn scenario_6_sweep_keeps_only_marked_ids() {
    let dir = tempdir().unwrap();
    let mut store = open(dir.path());
    for id in 1..=1000u64 {
        store.put(id, format!("value-{id}").as_bytes()).unwrap();
    }

    store.clear_marks().unwrap();
    for id in (1..=1000u64).filter(|i| i % 2 == 0) {
        store.mark(id).unwrap();
    }
    let deleted = store.sweep().unwrap();
    assert_eq!(deleted.len(), 500);

    for id in 1..=1000u64 {
        assert_eq!(store.contains(id).unwrap(), id % 2 == 0, "id {id}");
    }

    // `sweep` itself finishes with a defragment pass -- no separate call needed.
    let size = std::fs::metadata(dir.path().join("database.blobs"))
        .unwrap()
        .len();
    // Every surviving record is "value-NNN" (9-10 bytes) plus a 25-byte header; 500
    // survivors bound the post-sweep file comfortably under 2x that payload.
    assert!(size < 500 * (25 + 16) as u64 * 2, "file size {size} too large after sweep");
}
