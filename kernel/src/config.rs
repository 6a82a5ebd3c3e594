// kernel/src/config.rs
//
// User address-space layout used by the fault resolver and mmap checks.
//
//   0x0000_0000_0000_0000  null page (never mapped)
//   ...                    program image, heap, mmap regions
//   user_stack_top - max_stack_size .. user_stack_top   stack growth zone
//   kernel_base ..         kernel space, never demand-paged

use crate::error::{VmError, VmResult};
use crate::memory::PAGE_SIZE;

/// User stack top.  Same slot the loader has always used (PML4 entry 226).
pub const USER_STACK_TOP: u64 = 0x0000_7100_0000_0000;

/// Largest stack a process may grow to.
pub const MAX_STACK_SIZE: u64 = 1 << 20;

/// `push` faults 8 bytes below rsp before rsp moves.
pub const STACK_SLACK: u64 = 8;

/// First address that belongs to the kernel (end of the lower canonical half).
pub const KERNEL_BASE: u64 = 0x0000_8000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Exclusive top of the user stack.
    pub user_stack_top: u64,
    /// Size of the region below `user_stack_top` where stack growth is allowed.
    pub max_stack_size: u64,
    /// How far below the stack pointer a fault still counts as a stack access.
    pub stack_slack: u64,
    /// Addresses at or above this are kernel addresses.
    pub kernel_base: u64,
}

impl VmConfig {
    pub const DEFAULT: Self = Self {
        user_stack_top: USER_STACK_TOP,
        max_stack_size: MAX_STACK_SIZE,
        stack_slack: STACK_SLACK,
        kernel_base: KERNEL_BASE,
    };

    /// Check that the layout is page aligned and that the stack zone sits
    /// inside user space.
    pub fn validate(&self) -> VmResult<()> {
        let page = PAGE_SIZE as u64;
        if self.user_stack_top % page != 0
            || self.max_stack_size % page != 0
            || self.kernel_base % page != 0
        {
            return Err(VmError::InvalidConfig);
        }
        if self.max_stack_size == 0
            || self.max_stack_size > self.user_stack_top
            || self.user_stack_top > self.kernel_base
        {
            return Err(VmError::InvalidConfig);
        }
        Ok(())
    }

    /// Lowest address the stack may grow down to.
    #[inline]
    pub fn stack_floor(&self) -> u64 {
        self.user_stack_top - self.max_stack_size
    }

    #[inline]
    pub fn is_user_vaddr(&self, addr: u64) -> bool {
        addr < self.kernel_base
    }

    /// Does a fault at `addr`, with the user stack pointer at `rsp`, look
    /// like the stack growing?  An `rsp` of 0 means it was never
    /// recorded; nothing counts as stack then.
    pub fn is_stack_access(&self, addr: u64, rsp: u64) -> bool {
        rsp != 0
            && addr >= rsp.saturating_sub(self.stack_slack)
            && addr >= self.stack_floor()
            && addr < self.user_stack_top
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
