// kernel/src/memory/frame_table.rs
//
// Global table of resident user frames.
//
// Every frame handed to a page is recorded here together with the page
// and the page table it is mapped in, so the allocator can pick a victim
// when the pool runs dry.  Entries hold weak references: the address
// space owns its pages, the frame table only points at them.
//
// Victim selection is the clock (second-chance) algorithm:
//
//   hand ──► entry ── page locked elsewhere? ──► skip (pinned)
//                 └── ACCESSED set?           ──► clear it, skip
//                 └── no swap slot for it?    ──► skip
//                 └── otherwise               ──► victim: swap_out + unmap
//
// Two full turns of the hand without a victim means everything is pinned
// (OutOfFrames) or every candidate needed a swap slot (SwapFull).

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::{structures::paging::PhysFrame, VirtAddr};

use crate::error::{VmError, VmResult};

use super::frame_allocator::UserFramePool;
use super::page::{Page, PageRef};
use super::paging::{PageMapper, SharedMapper};
use super::swap::SwapTable;
use super::{UserPage, PAGE_SIZE};

// ============================================================================
// Frame
// ============================================================================

/// A physical frame owned by exactly one page, reachable from the kernel
/// through the physical-memory window.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    phys: PhysFrame,
    kva: VirtAddr,
}

impl Frame {
    pub fn phys(&self) -> PhysFrame {
        self.phys
    }

    /// Kernel virtual address of the first byte.
    pub fn kva(&self) -> VirtAddr {
        self.kva
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `Vm::new` guarantees every pool frame is mapped at
        // `kva`, and a `Frame` is only ever owned by one page.
        unsafe { core::slice::from_raw_parts(self.kva.as_ptr::<u8>(), PAGE_SIZE) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `bytes`; `&mut self` makes the access exclusive.
        unsafe { core::slice::from_raw_parts_mut(self.kva.as_mut_ptr::<u8>(), PAGE_SIZE) }
    }
}

// ============================================================================
// FrameTable
// ============================================================================

struct FrameEntry {
    phys: PhysFrame,
    upage: UserPage,
    page: Weak<Mutex<Page>>,
    owner: Weak<Mutex<dyn PageMapper>>,
}

pub struct FrameTable {
    pool: Box<dyn UserFramePool>,
    phys_offset: VirtAddr,
    entries: Vec<FrameEntry>,
    hand: usize,
}

impl FrameTable {
    pub fn new(pool: Box<dyn UserFramePool>, phys_offset: VirtAddr) -> Self {
        Self {
            pool,
            phys_offset,
            entries: Vec::new(),
            hand: 0,
        }
    }

    /// Number of frames currently bound to a page.
    pub fn resident(&self) -> usize {
        self.entries.len()
    }

    pub fn is_tracked(&self, phys: PhysFrame) -> bool {
        self.entries.iter().any(|e| e.phys == phys)
    }

    fn frame_at(&self, phys: PhysFrame) -> Frame {
        Frame {
            phys,
            kva: self.phys_offset + phys.start_address().as_u64(),
        }
    }

    /// Get a frame for a page about to be claimed: straight from the pool
    /// if it has one, by evicting a resident page otherwise.
    pub fn allocate(&mut self, swap: &mut SwapTable) -> VmResult<Frame> {
        if let Some(phys) = self.pool.allocate_frame() {
            return Ok(self.frame_at(phys));
        }
        self.evict(swap)
    }

    /// Record that `frame` now holds `page`, mapped in `owner`.
    pub fn bind(&mut self, frame: &Frame, page: &PageRef, owner: &SharedMapper, upage: UserPage) {
        self.entries.push(FrameEntry {
            phys: frame.phys,
            upage,
            page: Arc::downgrade(page),
            owner: Arc::downgrade(owner),
        });
    }

    /// Give a frame back to the pool, dropping its binding if it has one.
    pub fn release(&mut self, frame: Frame) {
        if let Some(idx) = self.entries.iter().position(|e| e.phys == frame.phys) {
            self.remove_entry(idx);
        }
        // SAFETY: the frame came from this pool and its only owner is
        // handing it back.
        unsafe { self.pool.deallocate_frame(frame.phys) };
    }

    fn remove_entry(&mut self, idx: usize) -> FrameEntry {
        let entry = self.entries.remove(idx);
        if idx < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
        entry
    }

    fn evict(&mut self, swap: &mut SwapTable) -> VmResult<Frame> {
        let mut budget = self.entries.len() * 2;
        // Set when some victim could not go out because swap is full.
        let mut swap_full = false;

        while budget > 0 && !self.entries.is_empty() {
            budget -= 1;
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            let idx = self.hand;
            let entry = &self.entries[idx];
            let upage = entry.upage;

            let (page, owner) = match (entry.page.upgrade(), entry.owner.upgrade()) {
                (Some(page), Some(owner)) => (page, owner),
                (Some(_), None) => {
                    // The page table is gone but the page still owns the
                    // frame; destroying the page releases it.
                    self.hand += 1;
                    continue;
                }
                (None, owner) => {
                    // The page went away without releasing its frame.
                    if let Some(owner) = owner {
                        let Some(mut mapper) = owner.try_lock() else {
                            self.hand += 1;
                            continue;
                        };
                        let _ = mapper.unmap(upage);
                    }
                    let stale = self.remove_entry(idx);
                    log::warn!(
                        "frame table: reclaiming stale frame {:#x} ({:#x})",
                        stale.phys.start_address().as_u64(),
                        upage.start_address().as_u64()
                    );
                    return Ok(self.frame_at(stale.phys));
                }
            };

            let frame = {
                let Some(mut victim) = page.try_lock() else {
                    self.hand += 1;
                    continue;
                };
                let Some(mut mapper) = owner.try_lock() else {
                    self.hand += 1;
                    continue;
                };

                if mapper.is_accessed(upage) {
                    mapper.set_accessed(upage, false);
                    self.hand += 1;
                    continue;
                }

                match victim.swap_out(&mut *mapper, swap) {
                    Ok(frame) => frame,
                    Err(VmError::SwapFull) => {
                        swap_full = true;
                        self.hand += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            };

            self.remove_entry(idx);
            log::debug!(
                "evict: {:#x} gave up frame {:#x}",
                upage.start_address().as_u64(),
                frame.phys.start_address().as_u64()
            );
            return Ok(frame);
        }

        if swap_full {
            log::warn!("evict: swap full, no victim without a slot");
            return Err(VmError::SwapFull);
        }
        log::warn!("evict: no victim among {} resident frames", self.entries.len());
        Err(VmError::OutOfFrames)
    }
}
