// kernel/src/memory/vm.rs
//
// The VM service: the frame table and the swap table behind one lock.
//
// Both tables are global (shared by every address space), so every
// sequence that touches them, allocate → evict → swap_out → swap_in,
// runs with `state` held.  Lock order is always
//
//     Vm::state  →  Page  →  PageMapper
//
// and eviction only `try_lock`s pages and page tables, so a page being
// claimed or copied by the current path is never chosen as a victim.

use alloc::boxed::Box;
use spin::{Mutex, MutexGuard};
use x86_64::VirtAddr;

use crate::config::VmConfig;
use crate::drivers::BlockDevice;
use crate::error::{VmError, VmResult};

use super::frame_allocator::UserFramePool;
use super::frame_table::{Frame, FrameTable};
use super::page::PageRef;
use super::paging::{user_flags, SharedMapper};
use super::swap::SwapTable;

pub struct VmState {
    pub frames: FrameTable,
    pub swap: SwapTable,
}

pub struct Vm {
    config: VmConfig,
    state: Mutex<VmState>,
}

impl Vm {
    /// Build the VM service over a pool of user frames and a swap device.
    ///
    /// # Safety
    /// Every frame `pool` can hand out must be mapped read/write at
    /// `phys_offset + frame.start_address()` for the lifetime of the
    /// `Vm`, and must not be used by anything else.
    pub unsafe fn new(
        config: VmConfig,
        pool: impl UserFramePool + 'static,
        phys_offset: VirtAddr,
        swap_device: impl BlockDevice + 'static,
    ) -> VmResult<Self> {
        config.validate()?;
        log::info!(
            "vm: stack top {:#x}, max stack {} KiB",
            config.user_stack_top,
            config.max_stack_size / 1024
        );
        Ok(Self {
            config,
            state: Mutex::new(VmState {
                frames: FrameTable::new(Box::new(pool), phys_offset),
                swap: SwapTable::new(Box::new(swap_device)),
            }),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, VmState> {
        self.state.lock()
    }

    pub fn resident_frames(&self) -> usize {
        self.state.lock().frames.resident()
    }

    pub fn swap_slots_in_use(&self) -> usize {
        self.state.lock().swap.in_use()
    }

    pub fn swap_capacity(&self) -> usize {
        self.state.lock().swap.capacity()
    }

    /// Make `page` resident in the address space behind `mapper`: get a
    /// frame (evicting if needed), map it, fill it.  On failure nothing
    /// stays mapped and the frame goes back to the pool.
    pub fn claim(&self, page: &PageRef, mapper: &SharedMapper) -> VmResult<()> {
        let mut state = self.state.lock();
        let VmState { frames, swap } = &mut *state;
        let mut guard = page.lock();

        if guard.is_resident() {
            return Err(VmError::AlreadyResident);
        }
        let upage = guard.upage();
        let frame = frames.allocate(swap)?;
        let phys = frame.phys();

        if let Err(err) = mapper.lock().map(upage, phys, user_flags(guard.writable())) {
            frames.release(frame);
            return Err(err.into());
        }

        guard.attach(frame)?;
        if let Err(err) = guard.swap_in(swap) {
            log::debug!(
                "claim: swap_in of {:#x} failed: {}",
                upage.start_address().as_u64(),
                err
            );
            let _ = mapper.lock().unmap(upage);
            if let Some(frame) = guard.detach() {
                frames.release(frame);
            }
            return Err(err);
        }

        if let Some(frame) = guard.frame() {
            frames.bind(frame, page, mapper, upage);
        }
        log::trace!(
            "claim: {:#x} -> frame {:#x}",
            upage.start_address().as_u64(),
            phys.start_address().as_u64()
        );
        Ok(())
    }

    /// Release everything `page` holds.
    pub fn destroy(&self, page: &PageRef, mapper: &SharedMapper) -> VmResult<()> {
        let mut state = self.state.lock();
        let VmState { frames, swap } = &mut *state;
        let mut guard = page.lock();
        let mut mapper = mapper.lock();
        guard.destroy(&mut *mapper, frames, swap)
    }

    /// Frame for a forked child's page, filled by `fill` before anyone
    /// else can see it.
    pub(crate) fn fresh_frame(
        state: &mut VmState,
        fill: impl FnOnce(&mut [u8], &mut SwapTable) -> VmResult<()>,
    ) -> VmResult<Frame> {
        let VmState { frames, swap } = state;
        let mut frame = frames.allocate(swap)?;
        if let Err(err) = fill(frame.bytes_mut(), swap) {
            frames.release(frame);
            return Err(err);
        }
        Ok(frame)
    }
}
