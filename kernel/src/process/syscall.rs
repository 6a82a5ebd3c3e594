// kernel/src/process/syscall.rs
//
// Memory syscalls.  The kernel's syscall entry saves the registers, looks
// up the current process and calls `syscall_handler` with rax and the six
// argument registers (rdi, rsi, rdx, r10, r8, r9).

use x86_64::VirtAddr;

use super::Process;
use crate::memory::vm::Vm;

/// Números de syscall compatibles con Linux x86_64
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Mmap = 9,
    Munmap = 11,
}

impl SyscallNumber {
    pub fn from_u64(n: u64) -> Option<Self> {
        match n {
            9 => Some(Self::Mmap),
            11 => Some(Self::Munmap),
            _ => None,
        }
    }
}

/// Resultado de una syscall
pub type SyscallResult = i64;

/// Códigos de error compatibles con Linux (negados)
pub mod errno {
    pub const EIO: i64 = -5;
    pub const EBADF: i64 = -9;
    pub const ENOMEM: i64 = -12;
    pub const EFAULT: i64 = -14;
    pub const EEXIST: i64 = -17;
    pub const EINVAL: i64 = -22;
    pub const ENOSYS: i64 = -38;
}

/// `prot` bit that makes a mapping writable.
pub const PROT_WRITE: u64 = 0x2;

/// Handler principal de syscalls
pub fn syscall_handler(process: &mut Process, vm: &Vm, syscall_num: u64, args: [u64; 6]) -> SyscallResult {
    log::trace!(
        "SYSCALL: pid={}, num={}, args=({:#x}, {:#x}, {:#x})",
        process.pid.0,
        syscall_num,
        args[0],
        args[1],
        args[2]
    );

    let syscall = match SyscallNumber::from_u64(syscall_num) {
        Some(s) => s,
        None => {
            log::debug!("  Unknown syscall: {}", syscall_num);
            return errno::ENOSYS;
        }
    };

    match syscall {
        // mmap(addr, length, prot, flags, fd, offset)
        SyscallNumber::Mmap => sys_mmap(
            process,
            vm,
            args[0],
            args[1] as usize,
            args[2] & PROT_WRITE != 0,
            args[4] as usize,
            args[5],
        ),
        SyscallNumber::Munmap => sys_munmap(process, vm, args[0]),
    }
}

/// sys_mmap(addr, length, writable, fd, offset)
pub fn sys_mmap(
    process: &mut Process,
    vm: &Vm,
    addr: u64,
    length: usize,
    writable: bool,
    fd: usize,
    offset: u64,
) -> SyscallResult {
    let file = match process.files.get(fd) {
        Ok(file) => file.clone(),
        Err(_) => return errno::EBADF,
    };
    let Ok(addr) = VirtAddr::try_new(addr) else {
        return errno::EINVAL;
    };

    match process.aspace.mmap(vm, addr, length, writable, &file, offset) {
        Ok(addr) => addr.as_u64() as SyscallResult,
        Err(err) => {
            log::debug!("  sys_mmap(fd={}) -> {}", fd, err);
            err.errno()
        }
    }
}

/// sys_munmap(addr)
pub fn sys_munmap(process: &mut Process, vm: &Vm, addr: u64) -> SyscallResult {
    let Ok(addr) = VirtAddr::try_new(addr) else {
        return errno::EINVAL;
    };
    match process.aspace.munmap(vm, addr) {
        Ok(()) => 0,
        Err(err) => {
            log::debug!("  sys_munmap({:#x}) -> {}", addr.as_u64(), err);
            err.errno()
        }
    }
}
