//! Equi-record file (E): fixed-size-record storage shared by the B+Tree index and
//! the free-space manager.
//!
//! On-disk layout (all integers little-endian):
//!
//! ```text
//! [0..8)   total_entries        (u64)
//! [8..16)  total_free_slots     (u64)
//! [16..24) first_entry_addr     (u64, 0 = none)
//! [24..32) first_free_slot_offset (u64, byte offset, 0 = none)
//! [32..36) custom_field_count   (u32)  -- admin word, see note below
//! [36..40) reserved             (u32, must be 0)
//! [40..)   custom_field_count * 8 bytes, one u64 value per registered field
//! [..)     slots: each is 1 marker byte (0=free,1=reserved,2=used) + record_bytes payload
//! ```
//!
//! The header keeps a 32-byte fixed portion (the four named u64 fields) followed
//! directly by custom fields; this implementation prefixes the custom-field region with
//! an 8-byte admin word (`custom_field_count` + reserved padding) so that a freshly
//! reopened file can learn how many custom fields are already on disk without the
//! caller needing to replay registration history. This is purely an internal
//! bookkeeping detail and is recorded in DESIGN.md.
//!
//! A free slot's payload holds, in its first 8 bytes, the file offset of the next free
//! slot (0 terminates the chain) -- the singly linked free-slot list of §4.1.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Result, StoreError};

pub const HEADER_SIZE: u64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotMarker {
    Free = 0,
    Reserved = 1,
    Used = 2,
}

impl SlotMarker {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(SlotMarker::Free),
            1 => Ok(SlotMarker::Reserved),
            2 => Ok(SlotMarker::Used),
            other => Err(StoreError::InvariantViolation(format!(
                "unknown slot marker byte {other}"
            ))),
        }
    }
}

/// A handle to one of the caller's registered custom header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomFieldId(u32);

#[derive(Debug, Default)]
struct Header {
    total_entries: u64,
    total_free_slots: u64,
    first_entry_addr: u64,
    first_free_slot_offset: u64,
    custom_field_count: u32,
}

/// Fixed-size-record file: the shared storage primitive for the B+Tree (§4.3) and
/// free-space map (§4.4). `record_bytes` is fixed for the lifetime of the file and must
/// match across reopens -- the caller (tree/space-map owner) is responsible for that.
pub struct EquiFile {
    f: File,
    path: std::path::PathBuf,
    header: Header,
    record_bytes: usize,
    field_names: Vec<String>,
    dirty_header: bool,
}

impl EquiFile {
    /// Open or create an equi-record file at `path` with the given fixed record size.
    pub fn open(path: impl AsRef<Path>, record_bytes: usize) -> Result<Self> {
        let path = path.as_ref();
        let is_new = !path.exists();
        let mut f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let header = if is_new || f.metadata()?.len() == 0 {
            let h = Header::default();
            let mut file = EquiFile {
                f,
                path: path.to_path_buf(),
                header: h,
                record_bytes,
                field_names: Vec::new(),
                dirty_header: true,
            };
            file.write_header()?;
            return Ok(file);
        } else {
            Self::read_header(&mut f)?
        };

        Ok(EquiFile {
            f,
            path: path.to_path_buf(),
            header,
            record_bytes,
            field_names: Vec::new(),
            dirty_header: false,
        })
    }

    fn read_header(f: &mut File) -> Result<Header> {
        f.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; HEADER_SIZE as usize];
        f.read_exact(&mut buf)?;
        Ok(Header {
            total_entries: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            total_free_slots: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            first_entry_addr: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            first_free_slot_offset: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            custom_field_count: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.header.total_entries.to_le_bytes());
        buf[8..16].copy_from_slice(&self.header.total_free_slots.to_le_bytes());
        buf[16..24].copy_from_slice(&self.header.first_entry_addr.to_le_bytes());
        buf[24..32].copy_from_slice(&self.header.first_free_slot_offset.to_le_bytes());
        buf[32..36].copy_from_slice(&self.header.custom_field_count.to_le_bytes());
        buf[36..40].copy_from_slice(&0u32.to_le_bytes());
        self.f.seek(SeekFrom::Start(0))?;
        self.f.write_all(&buf)?;
        self.dirty_header = false;
        Ok(())
    }

    fn custom_field_offset(&self, id: CustomFieldId) -> u64 {
        HEADER_SIZE + (id.0 as u64) * 8
    }

    fn slots_region_start(&self) -> u64 {
        HEADER_SIZE + (self.header.custom_field_count as u64) * 8
    }

    /// Register a field name used by the caller (the B+Tree registers `first_leaf`,
    /// `last_leaf`, `btree_size`; the free-space map currently registers none). Callers
    /// MUST register the same fields in the same order on every open of a given file.
    /// A brand-new field (beyond what is already persisted) may only be registered
    /// before any slot has ever been allocated, since the custom-field region sits
    /// directly before the slot region and cannot be grown once slots exist.
    pub fn register_custom_field(&mut self, name: &str, default: u64) -> Result<CustomFieldId> {
        if let Some(idx) = self.field_names.iter().position(|n| n == name) {
            return Ok(CustomFieldId(idx as u32));
        }
        let idx = self.field_names.len() as u32;
        if idx >= self.header.custom_field_count {
            if self.header.total_entries != 0 || self.header.total_free_slots != 0 {
                return Err(StoreError::invariant(
                    "cannot register a new custom field on a file that already has slots",
                ));
            }
            self.header.custom_field_count += 1;
            self.write_header()?;
            let off = self.custom_field_offset(CustomFieldId(idx));
            self.f.seek(SeekFrom::Start(off))?;
            self.f.write_all(&default.to_le_bytes())?;
        }
        self.field_names.push(name.to_string());
        Ok(CustomFieldId(idx))
    }

    pub fn get_custom_field(&mut self, id: CustomFieldId) -> Result<u64> {
        let off = self.custom_field_offset(id);
        self.f.seek(SeekFrom::Start(off))?;
        let mut buf = [0u8; 8];
        self.f.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn set_custom_field(&mut self, id: CustomFieldId, value: u64) -> Result<()> {
        let off = self.custom_field_offset(id);
        self.f.seek(SeekFrom::Start(off))?;
        self.f.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn first_entry(&self) -> u64 {
        self.header.first_entry_addr
    }

    pub fn set_first_entry(&mut self, addr: u64) -> Result<()> {
        self.header.first_entry_addr = addr;
        self.write_header()
    }

    pub fn entries_count(&self) -> u64 {
        self.header.total_entries
    }

    fn addr_to_offset(&self, addr: u64) -> Result<u64> {
        if addr == 0 {
            return Err(StoreError::InvalidAddress(addr));
        }
        Ok(self.slots_region_start() + (addr - 1) * (1 + self.record_bytes as u64))
    }

    fn offset_to_addr(&self, offset: u64) -> u64 {
        (offset - self.slots_region_start()) / (1 + self.record_bytes as u64) + 1
    }

    fn file_len(&mut self) -> Result<u64> {
        Ok(self.f.metadata()?.len())
    }

    fn read_marker_at(&mut self, offset: u64) -> Result<SlotMarker> {
        self.f.seek(SeekFrom::Start(offset))?;
        let mut b = [0u8; 1];
        self.f.read_exact(&mut b)?;
        SlotMarker::from_byte(b[0])
    }

    fn write_marker_at(&mut self, offset: u64, marker: SlotMarker) -> Result<()> {
        self.f.seek(SeekFrom::Start(offset))?;
        self.f.write_all(&[marker as u8])?;
        Ok(())
    }

    fn read_next_free_at(&mut self, offset: u64) -> Result<u64> {
        self.f.seek(SeekFrom::Start(offset + 1))?;
        let mut buf = [0u8; 8];
        self.f.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_next_free_at(&mut self, offset: u64, next: u64) -> Result<()> {
        self.f.seek(SeekFrom::Start(offset + 1))?;
        self.f.write_all(&next.to_le_bytes())?;
        Ok(())
    }

    /// Allocate a slot, preferring to pop the head of the free-slot chain (§4.1).
    pub fn allocate_slot(&mut self) -> Result<u64> {
        if self.header.first_free_slot_offset != 0 {
            let offset = self.header.first_free_slot_offset;
            let marker = self.read_marker_at(offset)?;
            if marker != SlotMarker::Free {
                return Err(StoreError::invariant(format!(
                    "free-slot chain head at offset {offset} is not marked free"
                )));
            }
            let next = self.read_next_free_at(offset)?;
            self.write_marker_at(offset, SlotMarker::Reserved)?;
            self.header.first_free_slot_offset = next;
            self.header.total_free_slots -= 1;
            self.write_header()?;
            Ok(self.offset_to_addr(offset))
        } else {
            let offset = self.file_len()?;
            self.f.seek(SeekFrom::Start(offset))?;
            let mut rec = vec![0u8; 1 + self.record_bytes];
            rec[0] = SlotMarker::Reserved as u8;
            self.f.write_all(&rec)?;
            Ok(self.offset_to_addr(offset))
        }
    }

    /// Store `bytes` (must be exactly `record_bytes` long) at `addr`. Valid for a
    /// freshly reserved slot or for overwriting an already-used one in place.
    pub fn store(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.record_bytes {
            return Err(StoreError::RecordSizeMismatch {
                expected: self.record_bytes,
                got: bytes.len(),
            });
        }
        let offset = self.addr_to_offset(addr)?;
        let marker = self.read_marker_at(offset)?;
        match marker {
            SlotMarker::Reserved => {
                self.header.total_entries += 1;
                self.write_header()?;
            }
            SlotMarker::Used => {}
            SlotMarker::Free => {
                return Err(StoreError::MarkerMismatch {
                    addr,
                    expected: &[1, 2],
                    found: marker as u8,
                });
            }
        }
        self.write_marker_at(offset, SlotMarker::Used)?;
        self.f.seek(SeekFrom::Start(offset + 1))?;
        self.f.write_all(bytes)?;
        Ok(())
    }

    /// Retrieve the payload stored at `addr`. Requires the slot to be marked used.
    pub fn retrieve(&mut self, addr: u64) -> Result<Vec<u8>> {
        let offset = self.addr_to_offset(addr)?;
        let marker = self.read_marker_at(offset)?;
        if marker != SlotMarker::Used {
            return Err(StoreError::MarkerMismatch {
                addr,
                expected: &[2],
                found: marker as u8,
            });
        }
        self.f.seek(SeekFrom::Start(offset + 1))?;
        let mut buf = vec![0u8; self.record_bytes];
        self.f.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Delete the slot at `addr`, returning it to the free-slot chain and trimming the
    /// file if it was the last physical slot (§4.1).
    pub fn delete(&mut self, addr: u64) -> Result<()> {
        let offset = self.addr_to_offset(addr)?;
        let marker = self.read_marker_at(offset)?;
        match marker {
            SlotMarker::Used => self.header.total_entries -= 1,
            SlotMarker::Reserved => {}
            SlotMarker::Free => {
                return Err(StoreError::MarkerMismatch {
                    addr,
                    expected: &[1, 2],
                    found: marker as u8,
                });
            }
        }
        self.write_marker_at(offset, SlotMarker::Free)?;
        self.write_next_free_at(offset, self.header.first_free_slot_offset)?;
        self.header.first_free_slot_offset = offset;
        self.header.total_free_slots += 1;
        self.write_header()?;

        self.trim_trailing_free_slots()?;
        Ok(())
    }

    /// Remove `offset` from the free-slot chain (used only when trimming trailing
    /// slots from the tail of the file).
    fn unlink_free_slot(&mut self, offset: u64) -> Result<()> {
        if self.header.first_free_slot_offset == offset {
            let next = self.read_next_free_at(offset)?;
            self.header.first_free_slot_offset = next;
            self.header.total_free_slots -= 1;
            self.write_header()?;
            return Ok(());
        }
        let mut cur = self.header.first_free_slot_offset;
        loop {
            if cur == 0 {
                return Err(StoreError::invariant(format!(
                    "offset {offset} not found in free-slot chain"
                )));
            }
            let next = self.read_next_free_at(cur)?;
            if next == offset {
                let next_next = self.read_next_free_at(offset)?;
                self.write_next_free_at(cur, next_next)?;
                self.header.total_free_slots -= 1;
                self.write_header()?;
                return Ok(());
            }
            cur = next;
        }
    }

    fn trim_trailing_free_slots(&mut self) -> Result<()> {
        let slot_size = 1 + self.record_bytes as u64;
        loop {
            let len = self.file_len()?;
            if len <= self.slots_region_start() {
                break;
            }
            let last_offset = len - slot_size;
            let marker = self.read_marker_at(last_offset)?;
            if marker != SlotMarker::Free {
                break;
            }
            self.unlink_free_slot(last_offset)?;
            self.f.set_len(last_offset)?;
        }
        Ok(())
    }

    /// Discard all entries, custom field values intact in count but zeroed in value.
    pub fn clear(&mut self) -> Result<()> {
        self.header = Header {
            custom_field_count: self.header.custom_field_count,
            ..Header::default()
        };
        let region_start = self.slots_region_start();
        self.f.set_len(region_start)?;
        self.write_header()?;
        for i in 0..self.header.custom_field_count {
            self.set_custom_field(CustomFieldId(i), 0)?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        if self.dirty_header {
            self.write_header()?;
        }
        self.f.sync_data()?;
        Ok(())
    }

    /// Flush and drop the file handle. Subsequent calls on an already-closed handle
    /// are simply not possible since `close` consumes `self`.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Remove the backing file entirely. Used by `Store::erase`/tests that want a
    /// fully clean slate rather than a zeroed-but-present file.
    pub fn erase(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.f);
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Verify internal consistency: every reachable free-slot offset is marked free,
    /// the chain terminates, and total_entries/total_free_slots match a direct scan.
    pub fn check(&mut self) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        let slot_size = 1 + self.record_bytes as u64;
        let region_start = self.slots_region_start();
        let len = self.file_len()?;
        if len < region_start || (len - region_start) % slot_size != 0 {
            errors.push(format!("file length {len} is not slot-aligned"));
            return Ok(errors);
        }
        let slot_count = (len - region_start) / slot_size;

        let mut free_offsets = std::collections::HashSet::new();
        let mut cur = self.header.first_free_slot_offset;
        let mut steps = 0u64;
        while cur != 0 {
            if !free_offsets.insert(cur) {
                errors.push(format!("free-slot chain has a cycle at offset {cur}"));
                break;
            }
            let marker = self.read_marker_at(cur)?;
            if marker != SlotMarker::Free {
                errors.push(format!(
                    "free-slot chain references non-free slot at offset {cur}"
                ));
                break;
            }
            cur = self.read_next_free_at(cur)?;
            steps += 1;
            if steps > slot_count + 1 {
                errors.push("free-slot chain longer than file".to_string());
                break;
            }
        }
        if free_offsets.len() as u64 != self.header.total_free_slots {
            errors.push(format!(
                "total_free_slots={} but chain has {} entries",
                self.header.total_free_slots,
                free_offsets.len()
            ));
        }

        let mut used = 0u64;
        for addr in 1..=slot_count {
            let offset = region_start + (addr - 1) * slot_size;
            let marker = self.read_marker_at(offset)?;
            if marker == SlotMarker::Used {
                used += 1;
            }
        }
        if used != self.header.total_entries {
            errors.push(format!(
                "total_entries={} but scan found {} used slots",
                self.header.total_entries, used
            ));
        }
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tmp_path(name: &str) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn allocate_store_retrieve_roundtrip() {
        let (_d, path) = tmp_path("e.blobs");
        let mut e = EquiFile::open(&path, 8).unwrap();
        let addr = e.allocate_slot().unwrap();
        e.store(addr, b"abcdefgh").unwrap();
        assert_eq!(e.retrieve(addr).unwrap(), b"abcdefgh");
        assert_eq!(e.entries_count(), 1);
    }

    #[test]
    fn delete_reuses_slot() {
        let (_d, path) = tmp_path("e.blobs");
        let mut e = EquiFile::open(&path, 8).unwrap();
        let a1 = e.allocate_slot().unwrap();
        e.store(a1, b"11111111").unwrap();
        let a2 = e.allocate_slot().unwrap();
        e.store(a2, b"22222222").unwrap();
        e.delete(a1).unwrap();
        let a3 = e.allocate_slot().unwrap();
        assert_eq!(a3, a1, "freed slot should be reused before growing the file");
        e.store(a3, b"33333333").unwrap();
        assert_eq!(e.retrieve(a3).unwrap(), b"33333333");
    }

    #[test]
    fn trim_truncates_trailing_free_slots() {
        let (_d, path) = tmp_path("e.blobs");
        let mut e = EquiFile::open(&path, 4).unwrap();
        let a1 = e.allocate_slot().unwrap();
        e.store(a1, b"aaaa").unwrap();
        let a2 = e.allocate_slot().unwrap();
        e.store(a2, b"bbbb").unwrap();
        let len_before = e.file_len().unwrap();
        e.delete(a2).unwrap();
        let len_after = e.file_len().unwrap();
        assert!(len_after < len_before, "trailing free slot should be trimmed");
        e.delete(a1).unwrap();
        assert_eq!(e.file_len().unwrap(), e.slots_region_start());
    }

    #[test]
    fn custom_fields_persist_across_reopen() {
        let (_d, path) = tmp_path("e.blobs");
        {
            let mut e = EquiFile::open(&path, 4).unwrap();
            let f = e.register_custom_field("counter", 0).unwrap();
            e.set_custom_field(f, 42).unwrap();
            e.sync().unwrap();
        }
        {
            let mut e = EquiFile::open(&path, 4).unwrap();
            let f = e.register_custom_field("counter", 0).unwrap();
            assert_eq!(e.get_custom_field(f).unwrap(), 42);
        }
    }

    #[test]
    fn reopen_after_close_keeps_entries() {
        let (_d, path) = tmp_path("e.blobs");
        let addr = {
            let mut e = EquiFile::open(&path, 4).unwrap();
            let a = e.allocate_slot().unwrap();
            e.store(a, b"data").unwrap();
            e.sync().unwrap();
            a
        };
        let mut e = EquiFile::open(&path, 4).unwrap();
        assert_eq!(e.retrieve(addr).unwrap(), b"data");
        assert_eq!(e.entries_count(), 1);
    }

    #[test]
    fn check_reports_no_errors_on_healthy_file() {
        let (_d, path) = tmp_path("e.blobs");
        let mut e = EquiFile::open(&path, 4).unwrap();
        let a1 = e.allocate_slot().unwrap();
        e.store(a1, b"1111").unwrap();
        let a2 = e.allocate_slot().unwrap();
        e.store(a2, b"2222").unwrap();
        e.delete(a1).unwrap();
        assert!(e.check().unwrap().is_empty());
    }
}
