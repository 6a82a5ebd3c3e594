// kernel/src/memory/mmap.rs
//
// Memory-mapped file regions.
//
// Each successful mmap records the exact extent it created, keyed by its
// start address.  munmap looks the region up by that address and tears
// down exactly those pages, never more.
//
// Layout of a mapping of `length` bytes of a file at `offset`:
//
//   page i reads  min(PAGE_SIZE, length - i*PAGE_SIZE, file_len - (offset + i*PAGE_SIZE))
//   bytes from the file and zero-fills the rest of the page.  Pages past
//   EOF are still file pages, with nothing to read.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use x86_64::VirtAddr;

use crate::process::file::BackingFile;

use super::{page_of, UserPage, PAGE_SIZE};

// ============================================================================
// Region
// ============================================================================

#[derive(Clone)]
pub struct MmapRegion {
    /// Page-aligned start address.
    pub start: VirtAddr,
    /// Number of 4 KiB pages in this region.
    pub page_count: usize,
    /// Reopened handle; lives as long as the mapping.
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    pub writable: bool,
}

impl MmapRegion {
    /// Exclusive end address.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start.as_u64() + (self.page_count * PAGE_SIZE) as u64
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start.as_u64() && addr < self.end()
    }

    /// Pages of the region, lowest first.
    pub fn pages(&self) -> impl Iterator<Item = UserPage> {
        let first = page_of(self.start);
        (0..self.page_count as u64).map(move |i| first + i)
    }
}

impl fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}..{:#x} ({} pages) [{} @ {:#x}] {}",
            self.start.as_u64(),
            self.end(),
            self.page_count,
            self.file.name(),
            self.offset,
            if self.writable { "rw" } else { "r-" }
        )
    }
}

/// Bytes page `index` of a mapping reads from its file.
pub fn read_bytes_for(index: usize, length: usize, file_len: u64, offset: u64) -> usize {
    let start = index * PAGE_SIZE;
    let in_mapping = length.saturating_sub(start);
    let in_file = file_len.saturating_sub(offset.saturating_add(start as u64));
    let in_file = usize::try_from(in_file).unwrap_or(usize::MAX);
    PAGE_SIZE.min(in_mapping).min(in_file)
}

// ============================================================================
// Per-address-space table
// ============================================================================

#[derive(Clone, Default)]
pub struct MmapTable {
    regions: BTreeMap<u64, MmapRegion>,
}

impl MmapTable {
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, region: MmapRegion) {
        self.regions.insert(region.start.as_u64(), region);
    }

    /// Region that starts exactly at `start`.
    pub fn get(&self, start: VirtAddr) -> Option<&MmapRegion> {
        self.regions.get(&start.as_u64())
    }

    pub fn remove(&mut self, start: VirtAddr) -> Option<MmapRegion> {
        self.regions.remove(&start.as_u64())
    }

    /// Region containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<&MmapRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    pub fn starts(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        self.regions.values().map(|region| region.start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MmapRegion> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
