// kernel/src/memory/paging.rs
//
// The hardware page table of one address space, as the VM core sees it.
//
// The VM core never walks page tables itself; it installs and removes
// leaf mappings and reads/clears the ACCESSED and DIRTY bits through
// `PageMapper`.  The kernel implements it over its OffsetPageTable;
// `SoftPageTable` is a software model of the same contract.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;
use x86_64::structures::paging::{PageTableFlags, PhysFrame};

use super::UserPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame for an intermediate table.
    FrameAllocationFailed,
    PageAlreadyMapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    PageNotMapped,
}

/// Leaf-level operations on one address space's page table.
pub trait PageMapper: Send {
    /// Install `page -> frame`.  The caller passes the full flag set,
    /// PRESENT included.
    fn map(
        &mut self,
        page: UserPage,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapError>;

    /// Remove the mapping and return the frame it pointed to.
    fn unmap(&mut self, page: UserPage) -> Result<PhysFrame, UnmapError>;

    /// Frame and flags of a present mapping.
    fn entry(&self, page: UserPage) -> Option<(PhysFrame, PageTableFlags)>;

    /// Replace the flags of a present mapping.
    fn update_flags(&mut self, page: UserPage, flags: PageTableFlags) -> Result<(), UnmapError>;

    fn translate(&self, page: UserPage) -> Option<PhysFrame> {
        self.entry(page).map(|(frame, _)| frame)
    }

    fn is_dirty(&self, page: UserPage) -> bool {
        self.entry(page)
            .is_some_and(|(_, flags)| flags.contains(PageTableFlags::DIRTY))
    }

    fn set_dirty(&mut self, page: UserPage, dirty: bool) {
        self.set_flag(page, PageTableFlags::DIRTY, dirty);
    }

    fn is_accessed(&self, page: UserPage) -> bool {
        self.entry(page)
            .is_some_and(|(_, flags)| flags.contains(PageTableFlags::ACCESSED))
    }

    fn set_accessed(&mut self, page: UserPage, accessed: bool) {
        self.set_flag(page, PageTableFlags::ACCESSED, accessed);
    }

    /// Set or clear one bit; no-op if `page` is not mapped.
    fn set_flag(&mut self, page: UserPage, flag: PageTableFlags, value: bool) {
        if let Some((_, mut flags)) = self.entry(page) {
            flags.set(flag, value);
            let _ = self.update_flags(page, flags);
        }
    }
}

/// Page table handle shared between an address space and the frame table.
pub type SharedMapper = Arc<Mutex<dyn PageMapper>>;

/// Flags for a user mapping.
pub fn user_flags(writable: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    flags
}

// ============================================================================
// SoftPageTable
// ============================================================================

/// Page table kept as a map of leaf entries.
///
/// `touch` is what the MMU does on every access: it sets ACCESSED, and
/// DIRTY for writes.
#[derive(Debug, Default)]
pub struct SoftPageTable {
    entries: BTreeMap<UserPage, (PhysFrame, PageTableFlags)>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap into the shared handle an `AddressSpace` expects.
    pub fn shared() -> Arc<Mutex<SoftPageTable>> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Record an access.  Returns `false` where the CPU would fault
    /// instead (not present, or write to a read-only mapping).
    pub fn touch(&mut self, page: UserPage, write: bool) -> bool {
        match self.entries.get_mut(&page) {
            Some((_, flags)) => {
                if write && !flags.contains(PageTableFlags::WRITABLE) {
                    return false;
                }
                flags.insert(PageTableFlags::ACCESSED);
                if write {
                    flags.insert(PageTableFlags::DIRTY);
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PageMapper for SoftPageTable {
    fn map(
        &mut self,
        page: UserPage,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        if self.entries.contains_key(&page) {
            return Err(MapError::PageAlreadyMapped);
        }
        self.entries.insert(page, (frame, flags | PageTableFlags::PRESENT));
        Ok(())
    }

    fn unmap(&mut self, page: UserPage) -> Result<PhysFrame, UnmapError> {
        self.entries
            .remove(&page)
            .map(|(frame, _)| frame)
            .ok_or(UnmapError::PageNotMapped)
    }

    fn entry(&self, page: UserPage) -> Option<(PhysFrame, PageTableFlags)> {
        self.entries.get(&page).copied()
    }

    fn update_flags(&mut self, page: UserPage, flags: PageTableFlags) -> Result<(), UnmapError> {
        let entry = self.entries.get_mut(&page).ok_or(UnmapError::PageNotMapped)?;
        entry.1 = flags;
        Ok(())
    }
}
