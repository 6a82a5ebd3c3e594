// kernel/src/memory/mod.rs

use x86_64::{
    structures::paging::{Page, PageSize, Size4KiB},
    VirtAddr,
};

pub mod address_space;
pub mod demand_paging;
pub mod frame_allocator;
pub mod frame_table;
pub mod mmap;
pub mod page;
pub mod paging;
pub mod spt;
pub mod swap;
pub mod vm;

/// A 4 KiB page of some user address space.
pub type UserPage = Page<Size4KiB>;

pub const PAGE_SIZE: usize = Size4KiB::SIZE as usize;

/// Page containing `addr` (rounds down).
#[inline]
pub fn page_of(addr: VirtAddr) -> UserPage {
    Page::containing_address(addr)
}

/// Number of pages needed to cover `len` bytes.
#[inline]
pub const fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}
