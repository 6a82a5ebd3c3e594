// kernel/src/memory/address_space.rs
//
// AddressSpace: groups a process's page table, supplemental page table
// and mmap regions into a single unit that does NOT depend on PID.
//
// Everything the syscall and trap layers do to user memory goes through
// here: lazy allocation, claim, mmap/munmap, fork copy and teardown.

use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::error::{VmError, VmResult};
use crate::process::file::BackingFile;

use super::mmap::{read_bytes_for, MmapRegion, MmapTable};
use super::page::{FileSegment, Page, PageInit, PageMarkers, PageRef, PageTarget};
use super::paging::SharedMapper;
use super::spt::SupplementalPageTable;
use super::vm::Vm;
use super::{page_of, pages_for, UserPage, PAGE_SIZE};

pub struct AddressSpace {
    mapper: SharedMapper,
    spt: SupplementalPageTable,
    mmaps: MmapTable,
}

impl AddressSpace {
    // ====================================================================
    // CONSTRUCTORS
    // ====================================================================

    /// Empty user address space over `mapper` (its page table).
    pub fn new(mapper: SharedMapper) -> Self {
        Self {
            mapper,
            spt: SupplementalPageTable::new(),
            mmaps: MmapTable::new(),
        }
    }

    pub fn mapper(&self) -> &SharedMapper {
        &self.mapper
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn mmaps(&self) -> &MmapTable {
        &self.mmaps
    }

    // ====================================================================
    // PAGES
    // ====================================================================

    /// Page covering `addr`, if any.
    pub fn find(&self, addr: VirtAddr) -> Option<PageRef> {
        self.spt.find(addr)
    }

    /// Register the page containing `va`; it gets its content on first touch.
    /// `init`, if any, fills the frame instead of the default (zeros for
    /// anonymous pages, the file segment for file pages).
    pub fn alloc_lazy(
        &mut self,
        vm: &Vm,
        target: PageTarget,
        va: VirtAddr,
        writable: bool,
        init: Option<Arc<dyn PageInit>>,
    ) -> VmResult<PageRef> {
        let upage = page_of(va);
        check_user_range(vm, upage.start_address(), PAGE_SIZE)?;
        let page = Page::new_uninit(upage, writable, target, init);
        self.spt.insert(page).map_err(|_| VmError::AlreadyMapped)
    }

    /// Fault in the page at `va` now.
    pub fn claim(&mut self, vm: &Vm, va: VirtAddr) -> VmResult<()> {
        let page = self.spt.find(va).ok_or(VmError::NotMapped)?;
        vm.claim(&page, &self.mapper)
    }

    /// New anonymous stack page at `upage`, claimed right away.  If the
    /// claim fails the page is dropped again.
    pub(crate) fn grow_stack(&mut self, vm: &Vm, upage: UserPage) -> VmResult<()> {
        let page = self.alloc_lazy(vm, PageTarget::Anon, upage.start_address(), true, None)?;
        page.lock().mark(PageMarkers::STACK);

        if let Err(err) = vm.claim(&page, &self.mapper) {
            self.spt.remove(upage);
            return Err(err);
        }
        log::debug!("stack grew to {:#x}", upage.start_address().as_u64());
        Ok(())
    }

    /// Number of pages created by stack growth.
    pub fn stack_pages(&self) -> usize {
        self.spt
            .iter()
            .filter(|(_, page)| page.lock().markers().contains(PageMarkers::STACK))
            .count()
    }

    // ====================================================================
    // MMAP
    // ====================================================================

    /// Map `length` bytes of `file` from `offset` at `addr`.  Pages are
    /// created lazily; nothing is read until they are touched.
    pub fn mmap(
        &mut self,
        vm: &Vm,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: &Arc<dyn BackingFile>,
        offset: u64,
    ) -> VmResult<VirtAddr> {
        check_user_range(vm, addr, length)?;
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::Misaligned);
        }
        offset
            .checked_add(length as u64)
            .ok_or(VmError::InvalidLength)?;
        let file_len = file.length();
        if file_len == 0 {
            return Err(VmError::InvalidLength);
        }

        let handle = file.reopen()?;
        let first = page_of(addr);
        let page_count = pages_for(length);
        let mut created: Vec<UserPage> = Vec::with_capacity(page_count);

        for i in 0..page_count {
            let upage = first + i as u64;
            let segment = FileSegment::new(
                handle.clone(),
                offset + (i * PAGE_SIZE) as u64,
                read_bytes_for(i, length, file_len, offset),
            );
            let page = Page::new_uninit(upage, writable, PageTarget::File(segment), None);

            if self.spt.insert(page).is_err() {
                log::debug!(
                    "mmap: {:#x} already present, dropping {} new pages",
                    upage.start_address().as_u64(),
                    created.len()
                );
                // Nothing was claimed yet, removing is enough.
                for upage in created {
                    self.spt.remove(upage);
                }
                return Err(VmError::AlreadyMapped);
            }
            created.push(upage);
        }

        let region = MmapRegion {
            start: addr,
            page_count,
            file: handle,
            offset,
            writable,
        };
        log::debug!("mmap: {:?}", region);
        self.mmaps.insert(region);
        Ok(addr)
    }

    /// Tear down the mapping that starts at `addr`: dirty pages go back
    /// to the file, every page of the recorded extent is destroyed.
    pub fn munmap(&mut self, vm: &Vm, addr: VirtAddr) -> VmResult<()> {
        let region = self.mmaps.remove(addr).ok_or(VmError::NotMapped)?;
        let mut result = Ok(());

        for upage in region.pages() {
            let Some(page) = self.spt.remove(upage) else {
                continue;
            };
            if let Err(err) = vm.destroy(&page, &self.mapper) {
                log::error!(
                    "munmap: {:#x} failed: {}",
                    upage.start_address().as_u64(),
                    err
                );
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        log::debug!("munmap: {:?}", region);
        result
    }

    // ====================================================================
    // FORK / EXIT
    // ====================================================================

    /// Make `self` (an empty child) an independent copy of `src`.
    pub fn copy_from(&mut self, vm: &Vm, src: &AddressSpace) -> VmResult<()> {
        // The child's mappings hold their own handles, opened before any
        // page is copied so a failure leaves nothing to undo.
        let mut mmaps = MmapTable::new();
        for region in src.mmaps.iter() {
            let mut copy = region.clone();
            copy.file = region.file.reopen()?;
            mmaps.insert(copy);
        }

        self.spt.copy_from(vm, &self.mapper, &src.spt, &src.mapper)?;

        for region in mmaps.iter() {
            for upage in region.pages() {
                if let Some(page) = self.spt.get(upage) {
                    page.lock().rebind_file(&region.file);
                }
            }
        }
        self.mmaps = mmaps;
        log::debug!(
            "fork: copied {} pages, {} mappings",
            self.spt.len(),
            self.mmaps.len()
        );
        Ok(())
    }

    /// Release everything: every mapping through munmap, then whatever
    /// pages are left.  Safe to call more than once.
    pub fn teardown(&mut self, vm: &Vm) -> VmResult<()> {
        let mut result = Ok(());
        let starts: Vec<VirtAddr> = self.mmaps.starts().collect();
        for start in starts {
            if let Err(err) = self.munmap(vm, start) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        if let Err(err) = self.spt.destroy_all(vm, &self.mapper) {
            if result.is_ok() {
                result = Err(err);
            }
        }
        result
    }
}

/// `[va, va + length)` must start on a non-null page boundary and lie in
/// user space.
fn check_user_range(vm: &Vm, va: VirtAddr, length: usize) -> VmResult<()> {
    if va.as_u64() == 0 {
        return Err(VmError::NullAddress);
    }
    if va.as_u64() % PAGE_SIZE as u64 != 0 {
        return Err(VmError::Misaligned);
    }
    if length == 0 {
        return Err(VmError::InvalidLength);
    }
    let end = va
        .as_u64()
        .checked_add(length as u64)
        .ok_or(VmError::InvalidLength)?;
    if !vm.config().is_user_vaddr(end - 1) {
        return Err(VmError::KernelAddress);
    }
    Ok(())
}
