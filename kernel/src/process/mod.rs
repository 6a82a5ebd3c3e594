// kernel/src/process/mod.rs
// Proceso visto desde la VM: address space, archivos abiertos y el último
// rsp de usuario conocido.
//
// Scheduling, context switch and trap frames live in the kernel proper;
// it hands the VM core a `Process` explicitly on every fault and syscall.

pub mod file;
pub mod syscall;

use crate::error::VmResult;
use crate::memory::address_space::AddressSpace;
use crate::memory::demand_paging::{try_handle_fault, FaultCause, PageFault};
use crate::memory::paging::SharedMapper;
use crate::memory::vm::Vm;

use file::FileTable;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub usize);

/// Process Control Block, VM part.
pub struct Process {
    pub pid: Pid,
    pub aspace: AddressSpace,
    pub files: FileTable,
    /// rsp saved on the last kernel entry from user mode.  A fault taken
    /// in kernel mode (copying syscall arguments, say) still needs the
    /// user's stack pointer to recognize stack growth.
    user_rsp: u64,
}

impl Process {
    pub fn new(pid: Pid, mapper: SharedMapper) -> Self {
        Self {
            pid,
            aspace: AddressSpace::new(mapper),
            files: FileTable::new(),
            user_rsp: 0,
        }
    }

    /// Called on syscall entry with the user rsp.
    pub fn record_user_rsp(&mut self, rsp: u64) {
        self.user_rsp = rsp;
    }

    pub fn user_rsp(&self) -> u64 {
        self.user_rsp
    }

    /// Page fault entry from the trap layer.  `frame_rsp` is the rsp in
    /// the trap frame; it is the user's only if the fault came from user
    /// mode.  Returns `false` if the process has to be killed.
    pub fn page_fault(&mut self, vm: &Vm, addr: u64, error_code: u64, frame_rsp: u64) -> bool {
        let cause = FaultCause::from_bits_truncate(error_code);
        let rsp = if cause.contains(FaultCause::USER) {
            self.user_rsp = frame_rsp;
            frame_rsp
        } else {
            self.user_rsp
        };
        let fault = PageFault::from_error_code(addr, error_code, rsp);

        let handled = try_handle_fault(vm, &mut self.aspace, &fault);
        if !handled {
            log::warn!("PID {}: killed by page fault at {:#x}", self.pid.0, addr);
        }
        handled
    }

    /// Child with a copy of this process's memory and open files.  On
    /// failure the half-built child is torn down and dropped.
    pub fn fork(&self, vm: &Vm, child_pid: Pid, child_mapper: SharedMapper) -> VmResult<Process> {
        let mut child = Process::new(child_pid, child_mapper);
        child.files = self.files.clone();
        child.user_rsp = self.user_rsp;

        if let Err(err) = child.aspace.copy_from(vm, &self.aspace) {
            let _ = child.exit(vm);
            return Err(err);
        }
        log::info!("PID {}: forked PID {}", self.pid.0, child_pid.0);
        Ok(child)
    }

    /// Release the address space and close every file.  Safe to call
    /// more than once.
    pub fn exit(&mut self, vm: &Vm) -> VmResult<()> {
        let result = self.aspace.teardown(vm);
        self.files.clear();
        log::debug!("PID {}: exited", self.pid.0);
        result
    }
}
