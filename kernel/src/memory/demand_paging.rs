// kernel/src/memory/demand_paging.rs
//
// Page fault handler for demand paging.
//
// Flow:
//   1. CPU faults → trap layer reads CR2 and the error code, builds a
//      `PageFault` with the user stack pointer
//   2. Null page or kernel address → fatal
//   3. Look the page up in the faulting address space's SPT
//   4. Write to a read-only page → fatal
//   5. Not present + page known → claim it (frame, map, swap_in)
//   6. Not present + no page + looks like a push below rsp → grow stack
//   7. Anything else → fatal; the trap layer kills the process

use bitflags::bitflags;
use x86_64::VirtAddr;

use crate::error::{VmError, VmResult};

use super::address_space::AddressSpace;
use super::vm::Vm;
use super::{page_of, PAGE_SIZE};

bitflags! {
    /// x86 page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCause: u64 {
        /// 0 = not present, 1 = protection violation
        const PRESENT = 1 << 0;
        /// 0 = read, 1 = write
        const WRITE = 1 << 1;
        /// 0 = kernel mode, 1 = user mode
        const USER = 1 << 2;
        /// Reserved bit set in a page table entry
        const RESERVED = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address (CR2).  Not necessarily canonical.
    pub addr: u64,
    pub cause: FaultCause,
    /// User stack pointer at the time of the fault.
    pub user_rsp: u64,
}

impl PageFault {
    pub fn from_error_code(addr: u64, error_code: u64, user_rsp: u64) -> Self {
        Self {
            addr,
            cause: FaultCause::from_bits_truncate(error_code),
            user_rsp,
        }
    }

    /// Not-present fault raised from user mode.
    pub fn not_present(addr: u64, write: bool, user_rsp: u64) -> Self {
        let mut cause = FaultCause::USER;
        cause.set(FaultCause::WRITE, write);
        Self {
            addr,
            cause,
            user_rsp,
        }
    }

    pub fn is_present(&self) -> bool {
        self.cause.contains(FaultCause::PRESENT)
    }

    pub fn is_write(&self) -> bool {
        self.cause.contains(FaultCause::WRITE)
    }

    pub fn is_user(&self) -> bool {
        self.cause.contains(FaultCause::USER)
    }
}

/// Resolve a page fault in `aspace`.  `Ok` means the faulting access can
/// be retried; any error means the process must die.
pub fn handle_page_fault(vm: &Vm, aspace: &mut AddressSpace, fault: &PageFault) -> VmResult<()> {
    let config = vm.config();

    // ── 1. Filter: null page, kernel space, broken PTEs ───────────────

    if fault.addr < PAGE_SIZE as u64 {
        return Err(VmError::NullAddress);
    }
    if !config.is_user_vaddr(fault.addr) {
        return Err(VmError::KernelAddress);
    }
    let addr = VirtAddr::try_new(fault.addr).map_err(|_| VmError::KernelAddress)?;
    if fault.cause.contains(FaultCause::RESERVED) {
        return Err(VmError::ReservedBit);
    }

    // ── 2. Look up the page ───────────────────────────────────────────

    let page = aspace.find(addr);

    if let Some(page) = &page {
        if fault.is_write() && !page.lock().writable() {
            return Err(VmError::WriteProtected);
        }
    }

    if fault.is_present() {
        // Present and not a forbidden write.
        return Err(VmError::ProtectionViolation);
    }

    // ── 3. Not present: claim, grow the stack, or give up ─────────────

    match page {
        Some(page) => {
            log::trace!("fault at {:#x}: claiming", fault.addr);
            vm.claim(&page, aspace.mapper())
        }
        None if config.is_stack_access(fault.addr, fault.user_rsp) => {
            aspace.grow_stack(vm, page_of(addr))
        }
        None => {
            log::debug!(
                "fault at {:#x} (rsp {:#x}): no page",
                fault.addr,
                fault.user_rsp
            );
            Err(VmError::SegmentationFault)
        }
    }
}

/// `handle_page_fault` for callers that only need to know whether to
/// resume or kill.
pub fn try_handle_fault(vm: &Vm, aspace: &mut AddressSpace, fault: &PageFault) -> bool {
    match handle_page_fault(vm, aspace, fault) {
        Ok(()) => true,
        Err(err) => {
            log::info!(
                "page fault at {:#x} ({:?}) not handled: {}",
                fault.addr,
                fault.cause,
                err
            );
            false
        }
    }
}
