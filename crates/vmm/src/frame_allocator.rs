//! Physical frame allocation.
//!
//! This module provides the allocator that hands out single physical frames
//! for anonymous mappings and page tables. Free frames are threaded into an
//! intrusive list through the frames themselves, reached via the direct map,
//! so the allocator needs no storage of its own.
//!
//! The allocator is fed at boot from the firmware memory map. Under software
//! emulation, frames are carved out of the hosted stand-in RAM instead so
//! each test thread owns an isolated physical memory.

use core::ptr;

use crate::{arch, DirectMap, PhysicalAddress};

/// Node in the intrusive linked list of free frames.
///
/// This structure is written directly into the physical frames that are free,
/// using the direct-mapped virtual addresses.
#[repr(C)]
struct FreeFrame {
    next: *mut FreeFrame,
}

/// Allocator over single physical frames.
pub struct FrameAllocator {
    head: *mut FreeFrame,
    free_count: usize,
}

// SAFETY: The raw pointers thread through physical frames the allocator
// exclusively owns; access is serialized by the lock around the global
// instance.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// Creates an allocator with no frames.
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            free_count: 0,
        }
    }

    /// Adds a physical memory region to the allocator.
    ///
    /// The region is shrunk to whole frames; partial frames at either end are
    /// not used.
    pub fn add_region(&mut self, base: PhysicalAddress, size: usize) {
        let start = base.align_up(arch::PAGE_SIZE).as_usize() as u64;
        // Computed in u64: a region ending at the top of the physical space
        // would overflow a usize on the real 32-bit target.
        let end = (base.as_usize() as u64 + size as u64) & !(arch::PAGE_SIZE as u64 - 1);

        let mut addr = start;
        while addr < end {
            self.free(PhysicalAddress::new(addr as usize));
            addr += arch::PAGE_SIZE as u64;
        }
    }

    /// Allocates one frame, or returns None if no frames are free.
    pub fn allocate(&mut self) -> Option<PhysicalAddress> {
        if self.head.is_null() {
            return None;
        }

        let frame = self.head;
        // SAFETY: head points at a FreeFrame node we wrote when the frame was
        // freed; the frame is unreferenced by anything else until handed out.
        self.head = unsafe { (*frame).next };
        self.free_count -= 1;

        Some(DirectMap::get().phys_of(frame.cast()))
    }

    /// Returns one frame to the allocator.
    ///
    /// # Panics
    /// Panics if the address is not frame-aligned.
    pub fn free(&mut self, frame: PhysicalAddress) {
        assert!(
            frame.is_aligned(arch::PAGE_SIZE),
            "freed frame must be frame-aligned"
        );

        let node: *mut FreeFrame = DirectMap::get().ptr_of(frame).cast();
        // SAFETY: The frame is unused and direct-mapped; writing the list
        // node into it is the allocator's prerogative.
        unsafe {
            (*node).next = self.head;
        }
        self.head = node;
        self.free_count += 1;
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_count
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The global frame allocator backing anonymous mappings.
static FRAME_ALLOCATOR: spin::Mutex<FrameAllocator> = spin::Mutex::new(FrameAllocator::new());

/// Adds a usable physical region to the global allocator.
///
/// Called during boot for each usable range in the firmware memory map.
pub fn add_usable_region(base: PhysicalAddress, size: usize) {
    FRAME_ALLOCATOR.lock().add_region(base, size);
}

/// Allocates one frame from the global allocator.
///
/// Under software emulation, frames come from the per-thread hosted RAM
/// instead, so tests stay isolated from each other.
#[cfg(any(test, software_paging))]
pub fn allocate_frame() -> Option<PhysicalAddress> {
    DirectMap::get().reserve(arch::PAGE_SIZE, arch::PAGE_SIZE)
}

/// Allocates one frame from the global allocator.
#[cfg(not(any(test, software_paging)))]
pub fn allocate_frame() -> Option<PhysicalAddress> {
    FRAME_ALLOCATOR.lock().allocate()
}

/// Returns one frame to the global allocator.
///
/// Under software emulation the bump allocator does not reclaim memory, so
/// this is a no-op.
#[cfg(any(test, software_paging))]
pub fn free_frame(_frame: PhysicalAddress) {}

/// Returns one frame to the global allocator.
#[cfg(not(any(test, software_paging)))]
pub fn free_frame(frame: PhysicalAddress) {
    FRAME_ALLOCATOR.lock().free(frame);
}
