#![cfg_attr(not(any(test, software_paging)), no_std)]

//! # Meridian Virtual Memory Manager (VMM)
//!
//! Low-level memory management for the meridian kernel:
//!
//! - Physical and virtual address types, and the direct map through which
//!   the kernel reaches raw physical memory.
//! - Two-level page tables and the walks over them.
//! - A physical frame allocator fed from the boot memory map.
//! - The `AddressSpace` container used by the process subsystem.
//! - A software-emulated architecture for testing in hosted environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod frame_allocator;
mod page;
mod page_directory;
mod protection;

pub use address::{DirectMap, PhysicalAddress, VirtualAddress};
pub use address_space::{init_kernel_space, kernel_space, AddressSpace, MapError};
pub use frame_allocator::{add_usable_region, allocate_frame, free_frame, FrameAllocator};
pub use page::PageNumber;
pub use page_directory::PageDirectory;
pub use protection::Protection;

pub use arch::PAGE_SIZE;

#[cfg(any(test, software_paging))]
pub use arch::active_root;
