// kernel/src/memory/frame_allocator.rs
//
// The user pool: physical frames that may back user pages.
//
// Frames are handed out region by region, lowest first; frames given
// back are recycled before the untouched tail of the regions.

use alloc::vec::Vec;
use core::ops::Range;
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Anything the frame table can take user frames from.
pub trait UserFramePool: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB> + Send {}

impl<T> UserFramePool for T where T: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB> + Send {}

pub struct RegionFramePool {
    regions: Vec<Range<u64>>,
    next: usize, // Índice de la región actual
    current_region_start: PhysFrame,
    current_region_end: PhysFrame,
    recycled: Vec<PhysFrame>,
    capacity: usize,
    in_use: usize,
}

impl RegionFramePool {
    /// Pool over the given physical ranges.  Partial frames at the edges of
    /// a range are not used.
    pub fn new(regions: &[Range<u64>]) -> Self {
        let regions: Vec<Range<u64>> = regions
            .iter()
            .map(|r| align_up(r.start)..r.end & !0xFFF)
            .filter(|r| r.start < r.end)
            .collect();
        let capacity: usize = regions
            .iter()
            .map(|r| ((r.end - r.start) / 4096) as usize)
            .sum();

        let mut pool = Self {
            regions,
            next: 0,
            current_region_start: PhysFrame::containing_address(PhysAddr::new(0)),
            current_region_end: PhysFrame::containing_address(PhysAddr::new(0)),
            recycled: Vec::new(),
            capacity,
            in_use: 0,
        };
        pool.load_region();
        pool
    }

    /// Pool of `frames` frames starting at physical address 0.
    pub fn with_frames(frames: usize) -> Self {
        Self::new(&[0..(frames as u64) * 4096])
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_frames(&self) -> usize {
        self.capacity - self.in_use
    }

    fn load_region(&mut self) {
        // current_region_end is exclusive here; start == end means exhausted
        match self.regions.get(self.next) {
            Some(region) => {
                self.current_region_start =
                    PhysFrame::containing_address(PhysAddr::new(region.start));
                self.current_region_end =
                    PhysFrame::containing_address(PhysAddr::new(region.end));
            }
            None => {
                self.current_region_start = PhysFrame::containing_address(PhysAddr::new(0));
                self.current_region_end = PhysFrame::containing_address(PhysAddr::new(0));
            }
        }
    }

    fn next_fresh(&mut self) -> Option<PhysFrame> {
        while self.current_region_start >= self.current_region_end {
            if self.next >= self.regions.len() {
                return None;
            }
            self.next += 1;
            self.load_region();
        }
        let frame = self.current_region_start;
        self.current_region_start += 1;
        Some(frame)
    }
}

fn align_up(addr: u64) -> u64 {
    (addr + 0xFFF) & !0xFFF
}

unsafe impl FrameAllocator<Size4KiB> for RegionFramePool {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.recycled.pop().or_else(|| self.next_fresh())?;
        self.in_use += 1;
        Some(frame)
    }
}

impl FrameDeallocator<Size4KiB> for RegionFramePool {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        if self.recycled.contains(&frame) {
            log::error!(
                "frame pool: double free of {:#x}",
                frame.start_address().as_u64()
            );
            return;
        }
        self.recycled.push(frame);
        self.in_use = self.in_use.saturating_sub(1);
    }
}
