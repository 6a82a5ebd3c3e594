// kernel/src/memory/swap.rs
//
// Swap slot table.
//
// The swap device is a flat array of page-sized slots, each slot being
// SECTORS_PER_PAGE consecutive sectors.  Bit i of the bitmap is set iff
// slot i holds the content of some anonymous page that is not resident.
// The slot number means nothing beyond its bit position.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::drivers::{BlockDevice, SECTOR_SIZE};
use crate::error::{VmError, VmResult};

use super::PAGE_SIZE;

pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

// ============================================================================
// SlotBitmap
// ============================================================================

/// Fixed-size bit vector, 64 slots per word.
#[derive(Debug)]
pub struct SlotBitmap {
    words: Vec<u64>,
    len: usize,
    used: usize,
}

impl SlotBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_used(&self) -> usize {
        self.used
    }

    pub fn test(&self, idx: usize) -> bool {
        idx < self.len && self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.len || self.test(idx) == value {
            return;
        }
        let word = &mut self.words[idx / 64];
        if value {
            *word |= 1 << (idx % 64);
            self.used += 1;
        } else {
            *word &= !(1 << (idx % 64));
            self.used -= 1;
        }
    }

    /// Index of the first clear bit.
    pub fn scan_free(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * 64 + (!*word).trailing_zeros() as usize)
            .filter(|&idx| idx < self.len)
    }
}

// ============================================================================
// SwapTable
// ============================================================================

pub struct SwapTable {
    device: Box<dyn BlockDevice>,
    slots: SlotBitmap,
}

impl SwapTable {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slots = (device.size_in_sectors() / SECTORS_PER_PAGE as u64) as usize;
        log::info!(
            "swap: {} ({} sectors, {} slots)",
            device.name(),
            device.size_in_sectors(),
            slots
        );
        Self {
            device,
            slots: SlotBitmap::new(slots),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.count_used()
    }

    pub fn is_in_use(&self, slot: usize) -> bool {
        self.slots.test(slot)
    }

    /// Write one page to the first free slot and mark it used.
    pub fn swap_out(&mut self, page: &[u8]) -> VmResult<usize> {
        let slot = self.slots.scan_free().ok_or(VmError::SwapFull)?;
        let first = (slot * SECTORS_PER_PAGE) as u64;

        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            let sector: &[u8; SECTOR_SIZE] = chunk
                .try_into()
                .map_err(|_| VmError::InvalidLength)?;
            self.device.write_sector(first + i as u64, sector)?;
        }

        self.slots.set(slot, true);
        log::trace!("swap: page -> slot {}", slot);
        Ok(slot)
    }

    /// Read a slot back into `page` and release the slot.
    pub fn swap_in(&mut self, slot: usize, page: &mut [u8]) -> VmResult<()> {
        self.read_slot(slot, page)?;
        self.slots.set(slot, false);
        log::trace!("swap: slot {} -> page", slot);
        Ok(())
    }

    /// Read a slot without releasing it (the copy made for a forked child).
    pub fn read_slot(&mut self, slot: usize, page: &mut [u8]) -> VmResult<()> {
        if !self.slots.test(slot) {
            log::error!("swap: read of free slot {}", slot);
            return Err(VmError::SlotNotInUse(slot));
        }
        let first = (slot * SECTORS_PER_PAGE) as u64;

        for (i, chunk) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let sector: &mut [u8; SECTOR_SIZE] = chunk
                .try_into()
                .map_err(|_| VmError::InvalidLength)?;
            self.device.read_sector(first + i as u64, sector)?;
        }
        Ok(())
    }

    /// Drop the content of a slot owned by a page being destroyed.
    pub fn free(&mut self, slot: usize) -> VmResult<()> {
        if !self.slots.test(slot) {
            log::error!("swap: double free of slot {}", slot);
            return Err(VmError::SlotNotInUse(slot));
        }
        self.slots.set(slot, false);
        Ok(())
    }
}
