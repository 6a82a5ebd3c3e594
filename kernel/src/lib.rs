// kernel/src/lib.rs
//
// Demand-paged virtual memory core.
//
// The crate is `no_std` + `alloc` so the kernel links it directly; under
// `cfg(test)` it builds against std and the whole fault / eviction / swap
// path runs on the host over a RAM arena, a RAM disk and a software page
// table.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod error;
pub mod memory;
pub mod process;

pub use config::VmConfig;
pub use error::{ErrorClass, VmError, VmResult};
pub use memory::{
    address_space::AddressSpace,
    demand_paging::{handle_page_fault, try_handle_fault, FaultCause, PageFault},
    page::{FileSegment, Page, PageInit, PageKind, PageMarkers, PageRef, PageTarget, VmType},
    vm::Vm,
    UserPage, PAGE_SIZE,
};
