// kernel/src/memory/spt.rs
//
// Supplemental page table: per address space, user page → page descriptor.
//
// Owned by one process and only touched from that process's own fault
// and syscall paths, so the map itself needs no lock.  The descriptors
// are shared with the global frame table, hence `PageRef`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::error::{VmError, VmResult};

use super::page::{Page, PageRef};
use super::paging::{user_flags, SharedMapper};
use super::vm::{Vm, VmState};
use super::{page_of, UserPage};

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: HashMap<UserPage, PageRef>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Page covering `addr` (rounded down to its page).
    pub fn find(&self, addr: VirtAddr) -> Option<PageRef> {
        self.get(page_of(addr))
    }

    pub fn get(&self, upage: UserPage) -> Option<PageRef> {
        self.pages.get(&upage).cloned()
    }

    pub fn contains(&self, upage: UserPage) -> bool {
        self.pages.contains_key(&upage)
    }

    /// Add `page`.  If its address is taken the page is handed back
    /// untouched so the caller can dispose of it.
    pub fn insert(&mut self, page: Page) -> Result<PageRef, Page> {
        let upage = page.upage();
        if self.pages.contains_key(&upage) {
            return Err(page);
        }
        let page = Arc::new(Mutex::new(page));
        self.pages.insert(upage, page.clone());
        Ok(page)
    }

    /// Drop the descriptor from the table.  Its resources are the
    /// caller's to release (see `Vm::destroy`).
    pub fn remove(&mut self, upage: UserPage) -> Option<PageRef> {
        self.pages.remove(&upage)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserPage, &PageRef)> {
        self.pages.iter()
    }

    /// Destroy every page.  The table is empty afterwards, so a second
    /// call finds nothing to do.  Keeps going past failures and reports
    /// the first one.
    pub fn destroy_all(&mut self, vm: &Vm, mapper: &SharedMapper) -> VmResult<()> {
        let mut result = Ok(());
        for (upage, page) in self.pages.drain() {
            if let Err(err) = vm.destroy(&page, mapper) {
                log::error!(
                    "spt: destroying {:#x} failed: {}",
                    upage.start_address().as_u64(),
                    err
                );
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    // ====================================================================
    // FORK
    // ====================================================================

    /// Deep-copy every page of `src` into `self`.  Resident pages get a
    /// fresh frame with the same bytes; pages in swap are read back into
    /// one; pages that can be rebuilt from their file or initializer are
    /// recreated lazily.  On failure every page this call added is
    /// destroyed again and `self` is left as it was.
    pub fn copy_from(
        &mut self,
        vm: &Vm,
        mapper: &SharedMapper,
        src: &SupplementalPageTable,
        src_mapper: &SharedMapper,
    ) -> VmResult<()> {
        let mut order: Vec<UserPage> = src.pages.keys().copied().collect();
        order.sort();

        let mut added = Vec::with_capacity(order.len());
        for upage in order {
            let Some(parent) = src.pages.get(&upage) else {
                continue;
            };
            match self.copy_page(vm, mapper, parent, src_mapper) {
                Ok(()) => added.push(upage),
                Err(err) => {
                    log::warn!(
                        "fork: copying {:#x} failed ({}), undoing {} pages",
                        upage.start_address().as_u64(),
                        err,
                        added.len()
                    );
                    for upage in added {
                        if let Some(page) = self.pages.remove(&upage) {
                            let _ = vm.destroy(&page, mapper);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn copy_page(
        &mut self,
        vm: &Vm,
        mapper: &SharedMapper,
        parent: &PageRef,
        src_mapper: &SharedMapper,
    ) -> VmResult<()> {
        let mut state = vm.lock();
        let parent = parent.lock();
        let upage = parent.upage();

        if self.pages.contains_key(&upage) {
            return Err(VmError::AlreadyMapped);
        }

        let (child, dirty) = if let Some(lazy) = parent.clone_lazy() {
            (lazy, false)
        } else if let Some(frame) = parent.frame() {
            let dirty = src_mapper.lock().is_dirty(upage);
            let copy = Vm::fresh_frame(&mut *state, |buf, _| {
                buf.copy_from_slice(frame.bytes());
                Ok(())
            })?;
            (parent.clone_resident(copy), dirty)
        } else if let Some(slot) = parent.swap_slot() {
            // The parent keeps its slot; the child starts out resident.
            let copy = Vm::fresh_frame(&mut *state, |buf, swap| swap.read_slot(slot, buf))?;
            (parent.clone_resident(copy), false)
        } else {
            log::error!(
                "fork: {:#x} is neither resident nor in swap",
                upage.start_address().as_u64()
            );
            return Err(VmError::NotResident);
        };
        drop(parent);

        let writable = child.writable();
        let resident = child.is_resident();
        let page = Arc::new(Mutex::new(child));

        if resident {
            let VmState { frames, .. } = &mut *state;
            let mut guard = page.lock();
            let mut table = mapper.lock();
            let phys = guard.frame().map(|f| f.phys()).ok_or(VmError::NotResident)?;

            if let Err(err) = table.map(upage, phys, user_flags(writable)) {
                if let Some(frame) = guard.detach() {
                    frames.release(frame);
                }
                return Err(err.into());
            }
            if dirty {
                table.set_dirty(upage, true);
            }
            if let Some(frame) = guard.frame() {
                frames.bind(frame, &page, mapper, upage);
            }
        }

        self.pages.insert(upage, page);
        Ok(())
    }
}
