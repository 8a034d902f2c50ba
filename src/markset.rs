//! Mark set: a compact, disk-spillable set of 64-bit ids used only
//! during a GC sweep (`Store::sweep`). In-memory pages partition the id space into
//! sorted, bounded ranges; a page that fills splits in two by id range. Once more
//! pages are resident than `RESIDENT_LIMIT`, the least-recently-used one spills to a
//! fixed-size-slot file built on the same equi-record primitive (`crate::equi`) the
//! B+Tree and free-space map use -- this component never exists on disk outside a
//! sweep, so it creates its spill file lazily and erases it on `clear`/drop.

use std::path::{Path, PathBuf};

use crate::equi::EquiFile;
use crate::error::Result;

const PAGE_CAPACITY: usize = 256;
const RESIDENT_LIMIT: usize = 8;

enum Location {
    Resident(Vec<u64>),
    Spilled(u64),
}

struct Page {
    /// Smallest id this page may hold (pages are ordered and contiguous: page i+1's
    /// `floor` is an exclusive upper bound for page i).
    floor: u64,
    location: Location,
    last_used: u64,
}

pub struct MarkSet {
    path: PathBuf,
    spill: Option<EquiFile>,
    pages: Vec<Page>,
    clock: u64,
}

impl MarkSet {
    pub fn new(path: impl AsRef<Path>) -> Self {
        MarkSet {
            path: path.as_ref().to_path_buf(),
            spill: None,
            pages: vec![Page {
                floor: 0,
                location: Location::Resident(Vec::new()),
                last_used: 0,
            }],
            clock: 0,
        }
    }

    /// Reset to a fresh, empty set, sized loosely for `expected_count` entries by
    /// pre-splitting into enough pages to avoid an initial burst of splits.
    pub fn clear(&mut self, expected_count: u64) -> Result<()> {
        if let Some(spill) = self.spill.take() {
            spill.erase()?;
        }
        self.pages = vec![Page {
            floor: 0,
            location: Location::Resident(Vec::new()),
            last_used: 0,
        }];
        self.clock = 0;
        let page_count = (expected_count / PAGE_CAPACITY as u64).max(1);
        if page_count > 1 {
            let stride = u64::MAX / page_count;
            for i in 1..page_count {
                self.pages.push(Page {
                    floor: stride.saturating_mul(i),
                    location: Location::Resident(Vec::new()),
                    last_used: 0,
                });
            }
        }
        Ok(())
    }

    pub fn erase(mut self) -> Result<()> {
        if let Some(spill) = self.spill.take() {
            spill.erase()?;
        } else if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn page_index_for(&self, id: u64) -> usize {
        match self.pages.binary_search_by(|p| p.floor.cmp(&id)) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        }
    }

    fn spill_record_bytes() -> usize {
        8 + PAGE_CAPACITY * 8 // count (u64) + fixed id slots
    }

    fn open_spill(&mut self) -> Result<&mut EquiFile> {
        if self.spill.is_none() {
            self.spill = Some(EquiFile::open(&self.path, Self::spill_record_bytes())?);
        }
        Ok(self.spill.as_mut().unwrap())
    }

    fn encode_page(ids: &[u64]) -> Vec<u8> {
        let mut buf = vec![0u8; Self::spill_record_bytes()];
        buf[0..8].copy_from_slice(&(ids.len() as u64).to_le_bytes());
        for (i, id) in ids.iter().enumerate() {
            let at = 8 + i * 8;
            buf[at..at + 8].copy_from_slice(&id.to_le_bytes());
        }
        buf
    }

    fn decode_page(buf: &[u8]) -> Vec<u64> {
        let count = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
        (0..count)
            .map(|i| {
                let at = 8 + i * 8;
                u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
            })
            .collect()
    }

    fn resident_count(&self) -> usize {
        self.pages
            .iter()
            .filter(|p| matches!(p.location, Location::Resident(_)))
            .count()
    }

    /// Ensure page `idx` is resident, spilling the least-recently-used other page if
    /// that would exceed `RESIDENT_LIMIT`.
    fn ensure_resident(&mut self, idx: usize) -> Result<()> {
        if matches!(self.pages[idx].location, Location::Resident(_)) {
            return Ok(());
        }
        if self.resident_count() >= RESIDENT_LIMIT {
            self.spill_lru(Some(idx))?;
        }
        if let Location::Spilled(addr) = self.pages[idx].location {
            let buf = self.open_spill()?.retrieve(addr)?;
            self.open_spill()?.delete(addr)?;
            self.pages[idx].location = Location::Resident(Self::decode_page(&buf));
        }
        Ok(())
    }

    fn spill_lru(&mut self, except: Option<usize>) -> Result<()> {
        let victim = self
            .pages
            .iter()
            .enumerate()
            .filter(|(i, p)| Some(*i) != except && matches!(p.location, Location::Resident(_)))
            .min_by_key(|(_, p)| p.last_used)
            .map(|(i, _)| i);
        let Some(victim) = victim else { return Ok(()) };
        let ids = match std::mem::replace(&mut self.pages[victim].location, Location::Spilled(0)) {
            Location::Resident(ids) => ids,
            Location::Spilled(_) => unreachable!(),
        };
        let encoded = Self::encode_page(&ids);
        let spill = self.open_spill()?;
        let addr = spill.allocate_slot()?;
        spill.store(addr, &encoded)?;
        self.pages[victim].location = Location::Spilled(addr);
        Ok(())
    }

    fn touch(&mut self, idx: usize) {
        self.clock += 1;
        self.pages[idx].last_used = self.clock;
    }

    pub fn insert(&mut self, id: u64) -> Result<()> {
        let idx = self.page_index_for(id);
        self.ensure_resident(idx)?;
        self.touch(idx);
        let Location::Resident(ids) = &mut self.pages[idx].location else {
            unreachable!("just ensured resident")
        };
        if let Err(pos) = ids.binary_search(&id) {
            ids.insert(pos, id);
        }
        if self.pages[idx].location_len() > PAGE_CAPACITY {
            self.split_page(idx)?;
        }
        Ok(())
    }

    fn split_page(&mut self, idx: usize) -> Result<()> {
        let Location::Resident(ids) = &mut self.pages[idx].location else {
            return Ok(());
        };
        let mid = ids.len() / 2;
        let right_ids = ids.split_off(mid);
        let right_floor = right_ids[0];
        self.pages.insert(
            idx + 1,
            Page {
                floor: right_floor,
                location: Location::Resident(right_ids),
                last_used: self.clock,
            },
        );
        Ok(())
    }

    pub fn includes(&mut self, id: u64) -> Result<bool> {
        let idx = self.page_index_for(id);
        self.ensure_resident(idx)?;
        self.touch(idx);
        let Location::Resident(ids) = &self.pages[idx].location else {
            unreachable!("just ensured resident")
        };
        Ok(ids.binary_search(&id).is_ok())
    }
}

impl Drop for MarkSet {
    fn drop(&mut self) {
        if let Some(spill) = self.spill.take() {
            let _ = spill.erase();
        } else if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Page {
    fn location_len(&self) -> usize {
        match &self.location {
            Location::Resident(ids) => ids.len(),
            Location::Spilled(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_and_include() {
        let dir = tempdir().unwrap();
        let mut set = MarkSet::new(dir.path().join("marks"));
        set.insert(5).unwrap();
        set.insert(3000000000).unwrap();
        assert!(set.includes(5).unwrap());
        assert!(set.includes(3000000000).unwrap());
        assert!(!set.includes(6).unwrap());
    }

    #[test]
    fn survives_spill_and_reload_of_many_pages() {
        let dir = tempdir().unwrap();
        let mut set = MarkSet::new(dir.path().join("marks"));
        for i in 0..5000u64 {
            set.insert(i * 2).unwrap();
        }
        for i in 0..5000u64 {
            assert!(set.includes(i * 2).unwrap(), "missing id {}", i * 2);
            assert!(!set.includes(i * 2 + 1).unwrap());
        }
    }

    #[test]
    fn clear_resets_to_empty() {
        let dir = tempdir().unwrap();
        let mut set = MarkSet::new(dir.path().join("marks"));
        set.insert(10).unwrap();
        set.clear(0).unwrap();
        assert!(!set.includes(10).unwrap());
    }
}
