// kernel/tests/common/mod.rs
//
// Host machine for the integration tests: physical memory is a leaked
// arena starting at "physical" address 0, swap is a RAM disk, and every
// address space gets a software page table.  `access` plays the CPU: it
// touches the page table and raises a page fault when the MMU would.

#![allow(dead_code)]

use std::sync::Arc;

use spin::Mutex;
use vm_core::drivers::RamDisk;
use vm_core::memory::frame_allocator::RegionFramePool;
use vm_core::memory::paging::{PageMapper, SharedMapper, SoftPageTable};
use vm_core::memory::swap::SECTORS_PER_PAGE;
use vm_core::process::{Pid, Process};
use vm_core::{
    handle_page_fault, AddressSpace, FaultCause, PageFault, UserPage, Vm, VmConfig, VmError,
    VmResult, PAGE_SIZE,
};
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

/// Somewhere in the middle of user space, away from the stack.
pub const DATA: u64 = 0x0000_1000_0000;

/// rsp of a process whose stack has not grown yet.
pub const STACK_RSP: u64 = vm_core::config::USER_STACK_TOP;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Machine {
    pub vm: Vm,
    phys_offset: VirtAddr,
}

/// One address space plus the page table the "CPU" walks.
pub struct User {
    pub aspace: AddressSpace,
    pub table: Arc<Mutex<SoftPageTable>>,
    pub rsp: u64,
}

impl Machine {
    pub fn new(frames: usize, swap_slots: u64) -> Self {
        Self::with_config(VmConfig::DEFAULT, frames, swap_slots)
    }

    pub fn with_config(config: VmConfig, frames: usize, swap_slots: u64) -> Self {
        init_logger();
        let arena: &'static mut [u8] =
            Box::leak(vec![0u8; frames.max(1) * PAGE_SIZE].into_boxed_slice());
        let phys_offset = VirtAddr::from_ptr(arena.as_mut_ptr());
        let disk = RamDisk::new(swap_slots * SECTORS_PER_PAGE as u64);
        let vm = unsafe {
            Vm::new(
                config,
                RegionFramePool::with_frames(frames),
                phys_offset,
                disk,
            )
        }
        .expect("valid config");
        Self { vm, phys_offset }
    }

    pub fn user(&self) -> User {
        let table = SoftPageTable::shared();
        let mapper: SharedMapper = table.clone();
        User {
            aspace: AddressSpace::new(mapper),
            table,
            rsp: STACK_RSP,
        }
    }

    pub fn process(&self, pid: usize) -> (Process, Arc<Mutex<SoftPageTable>>) {
        let table = SoftPageTable::shared();
        let mapper: SharedMapper = table.clone();
        (Process::new(Pid(pid), mapper), table)
    }

    /// Perform one access at `addr`, faulting until the page table lets
    /// it through.  Returns the frame backing `addr`.
    pub fn access(
        &self,
        aspace: &mut AddressSpace,
        table: &Mutex<SoftPageTable>,
        rsp: u64,
        addr: u64,
        write: bool,
    ) -> VmResult<PhysFrame> {
        let page = UserPage::containing_address(VirtAddr::new(addr));
        for _ in 0..2 {
            let (hit, present) = {
                let mut table = table.lock();
                (table.touch(page, write), table.entry(page).is_some())
            };
            if hit {
                return table.lock().translate(page).ok_or(VmError::NotResident);
            }

            let mut cause = FaultCause::USER;
            cause.set(FaultCause::WRITE, write);
            cause.set(FaultCause::PRESENT, present);
            let fault = PageFault::from_error_code(addr, cause.bits(), rsp);
            handle_page_fault(&self.vm, aspace, &fault)?;
        }
        Err(VmError::PageTable)
    }

    fn byte_ptr(&self, frame: PhysFrame, addr: u64) -> *mut u8 {
        let kva = self.phys_offset + frame.start_address().as_u64() + (addr & 0xfff);
        kva.as_mut_ptr::<u8>()
    }

    pub fn read_in(
        &self,
        aspace: &mut AddressSpace,
        table: &Mutex<SoftPageTable>,
        rsp: u64,
        addr: u64,
        len: usize,
    ) -> VmResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut cur = addr;
        let end = addr + len as u64;
        while cur < end {
            let chunk = ((cur | 0xfff) + 1).min(end) - cur;
            let frame = self.access(aspace, table, rsp, cur, false)?;
            let src = self.byte_ptr(frame, cur);
            out.extend_from_slice(unsafe { std::slice::from_raw_parts(src, chunk as usize) });
            cur += chunk;
        }
        Ok(out)
    }

    pub fn write_in(
        &self,
        aspace: &mut AddressSpace,
        table: &Mutex<SoftPageTable>,
        rsp: u64,
        addr: u64,
        data: &[u8],
    ) -> VmResult<()> {
        let mut cur = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let chunk = (((cur | 0xfff) + 1 - cur) as usize).min(rest.len());
            let frame = self.access(aspace, table, rsp, cur, true)?;
            let dst = self.byte_ptr(frame, cur);
            unsafe { std::ptr::copy_nonoverlapping(rest.as_ptr(), dst, chunk) };
            cur += chunk as u64;
            rest = &rest[chunk..];
        }
        Ok(())
    }

    pub fn read(&self, user: &mut User, addr: u64, len: usize) -> VmResult<Vec<u8>> {
        self.read_in(&mut user.aspace, &user.table, user.rsp, addr, len)
    }

    pub fn write(&self, user: &mut User, addr: u64, data: &[u8]) -> VmResult<()> {
        self.write_in(&mut user.aspace, &user.table, user.rsp, addr, data)
    }

    pub fn touch(&self, user: &mut User, addr: u64, write: bool) -> VmResult<PhysFrame> {
        self.access(&mut user.aspace, &user.table, user.rsp, addr, write)
    }
}

/// Page number `i` of the test data area.
pub fn data_page(i: u64) -> u64 {
    DATA + i * PAGE_SIZE as u64
}

pub fn is_resident(user: &User, addr: u64) -> bool {
    user.aspace
        .find(VirtAddr::new(addr))
        .is_some_and(|page| page.lock().is_resident())
}
