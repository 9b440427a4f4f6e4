//! Address space management.
//!
//! This module provides the architecture-independent container for a virtual
//! address space: the page directory plus a record of every mapping in it.
//! Address spaces belong to the kernel or to user processes; a distinguished
//! kernel instance exists for the lifetime of the system.

use alloc::vec::Vec;

use crate::{
    arch::{self, PageFlags},
    frame_allocator, DirectMap, PageDirectory, PageNumber, PhysicalAddress, Protection,
    VirtualAddress,
};

/// Errors that can occur while manipulating an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No physical frame or virtual range available for the mapping.
    OutOfMemory,
    /// The requested virtual range overlaps an existing mapping.
    AlreadyMapped,
    /// The given virtual address is not mapped.
    NotMapped,
}

/// What backs a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    /// Frames allocated by this address space; freed on unmap.
    Anonymous,
    /// Foreign frames (device memory, boot structures, or a window into
    /// another address space); never freed by this address space.
    Borrowed,
}

/// A contiguous run of mapped pages.
struct Region {
    start: PageNumber,
    pages: usize,
    protection: Protection,
    backing: Backing,
}

impl Region {
    fn contains(&self, page: PageNumber) -> bool {
        page >= self.start && page - self.start < self.pages
    }

    fn overlaps(&self, start: PageNumber, pages: usize) -> bool {
        start.as_usize() < self.start.as_usize() + self.pages
            && self.start.as_usize() < start.as_usize() + pages
    }
}

/// An architecture-independent representation of a virtual address space.
///
/// Each address space owns a page directory mapping virtual addresses to
/// physical frames, and records the regions mapped into it so that anonymous
/// memory can be released and duplicated. Installing the space on the CPU
/// changes what userland addresses mean.
pub struct AddressSpace {
    directory: PageDirectory,
    regions: Vec<Region>,
    /// Next candidate address for container-chosen mappings.
    mmap_cursor: usize,
    /// Kernel spaces hand out kernel-half addresses and supervisor mappings.
    kernel: bool,
}

impl AddressSpace {
    /// Creates a new, empty user address space.
    pub fn new() -> Self {
        Self {
            directory: PageDirectory::new(),
            regions: Vec::new(),
            mmap_cursor: arch::USER_MMAP_BASE,
            kernel: false,
        }
    }

    fn new_kernel() -> Self {
        Self {
            directory: PageDirectory::new(),
            regions: Vec::new(),
            mmap_cursor: arch::KERNEL_MMAP_BASE,
            kernel: true,
        }
    }

    /// Returns true if nothing is mapped in this address space.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Returns the physical address of the root page table.
    pub fn root_address(&self) -> PhysicalAddress {
        self.directory.root_address()
    }

    /// Maps `size` bytes of anonymous memory at a fixed virtual address.
    ///
    /// The size is rounded up to whole pages. Frames are allocated and
    /// zeroed.
    ///
    /// # Panics
    /// Panics if `vaddr` is not page-aligned or `size` is zero.
    pub fn map_memory_at(
        &mut self,
        vaddr: VirtualAddress,
        size: usize,
        protection: Protection,
    ) -> Result<(), MapError> {
        assert!(
            vaddr.is_aligned(arch::PAGE_SIZE),
            "mapping address must be page-aligned"
        );
        assert!(size > 0, "mapping size must be non-zero");

        let start = vaddr.page_number();
        let pages = Self::page_count(size);
        self.check_free(start, pages)?;

        for i in 0..pages {
            let frame = frame_allocator::allocate_frame().ok_or(MapError::OutOfMemory)?;
            zero_frame(frame);
            self.map_one(start + i, frame, protection);
        }

        self.regions.push(Region {
            start,
            pages,
            protection,
            backing: Backing::Anonymous,
        });
        Ok(())
    }

    /// Maps `size` bytes of anonymous memory at an address chosen by the
    /// container. Returns the chosen address.
    pub fn map_memory(
        &mut self,
        size: usize,
        protection: Protection,
    ) -> Result<VirtualAddress, MapError> {
        let vaddr = self.find_free(Self::page_count(size))?;
        self.map_memory_at(vaddr, size, protection)?;
        Ok(vaddr)
    }

    /// Maps one foreign frame at an address chosen by the container.
    ///
    /// The frame is not owned by this address space and will not be freed
    /// when the mapping is torn down.
    pub fn map_physical(
        &mut self,
        paddr: PhysicalAddress,
        protection: Protection,
    ) -> Result<VirtualAddress, MapError> {
        self.map_physical_range(paddr, 1, protection)
    }

    /// Maps `pages` contiguous foreign frames at an address chosen by the
    /// container. Returns the chosen address.
    ///
    /// # Panics
    /// Panics if `paddr` is not page-aligned.
    pub fn map_physical_range(
        &mut self,
        paddr: PhysicalAddress,
        pages: usize,
        protection: Protection,
    ) -> Result<VirtualAddress, MapError> {
        assert!(
            paddr.is_aligned(arch::PAGE_SIZE),
            "physical address must be page-aligned"
        );

        let vaddr = self.find_free(pages)?;
        let start = vaddr.page_number();
        for i in 0..pages {
            self.map_one(start + i, paddr + i * arch::PAGE_SIZE, protection);
        }

        self.regions.push(Region {
            start,
            pages,
            protection,
            backing: Backing::Borrowed,
        });
        Ok(vaddr)
    }

    /// Maps `pages` contiguous foreign frames at a fixed virtual address.
    ///
    /// Used for the boot identity mapping; the frames are not owned by this
    /// address space.
    ///
    /// # Panics
    /// Panics if `vaddr` or `paddr` is not page-aligned.
    pub fn map_physical_at(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        pages: usize,
        protection: Protection,
    ) -> Result<(), MapError> {
        assert!(
            vaddr.is_aligned(arch::PAGE_SIZE),
            "mapping address must be page-aligned"
        );
        assert!(
            paddr.is_aligned(arch::PAGE_SIZE),
            "physical address must be page-aligned"
        );

        let start = vaddr.page_number();
        self.check_free(start, pages)?;
        for i in 0..pages {
            self.map_one(start + i, paddr + i * arch::PAGE_SIZE, protection);
        }

        self.regions.push(Region {
            start,
            pages,
            protection,
            backing: Backing::Borrowed,
        });
        Ok(())
    }

    /// Maps a temporary window through which `other`'s range at `vaddr` is
    /// accessible from this address space. Returns the window address.
    ///
    /// The window borrows `other`'s frames; tear it down with
    /// [`AddressSpace::unmap_physical`].
    pub fn map_from(
        &mut self,
        other: &AddressSpace,
        vaddr: VirtualAddress,
        size: usize,
        protection: Protection,
    ) -> Result<VirtualAddress, MapError> {
        assert!(
            vaddr.is_aligned(arch::PAGE_SIZE),
            "window source must be page-aligned"
        );

        let pages = Self::page_count(size);
        let window = self.find_free(pages)?;
        let start = window.page_number();

        for i in 0..pages {
            let frame = other
                .translate(vaddr + i * arch::PAGE_SIZE)
                .ok_or(MapError::NotMapped)?;
            self.map_one(start + i, frame, protection);
        }

        self.regions.push(Region {
            start,
            pages,
            protection,
            backing: Backing::Borrowed,
        });
        Ok(window)
    }

    /// Unmaps the region starting at `vaddr`.
    ///
    /// Anonymous regions return their frames to the allocator; borrowed
    /// regions leave the frames untouched.
    ///
    /// # Panics
    /// Panics if no region starts at `vaddr`.
    pub fn unmap(&mut self, vaddr: VirtualAddress) {
        self.remove_region(vaddr);
    }

    /// Unmaps the `pages`-page region starting at `vaddr`.
    ///
    /// # Panics
    /// Panics if no region starts at `vaddr` or the region's size differs.
    pub fn unmap_range(&mut self, vaddr: VirtualAddress, pages: usize) {
        let removed = self.remove_region(vaddr);
        debug_assert_eq!(removed, pages, "unmap_range size mismatch");
    }

    /// Tears down a borrowed mapping (a window or physical range) without
    /// freeing the underlying frames.
    ///
    /// # Panics
    /// Panics if no region starts at `vaddr`. Debug-asserts that the region
    /// is in fact borrowed; anonymous regions should go through
    /// [`AddressSpace::unmap`].
    pub fn unmap_physical(&mut self, vaddr: VirtualAddress, size: usize) {
        let index = self
            .region_index(vaddr.page_number())
            .expect("no mapping at address");
        debug_assert_eq!(self.regions[index].backing, Backing::Borrowed);
        debug_assert_eq!(self.regions[index].pages, Self::page_count(size));
        self.remove_region(vaddr);
    }

    /// Translates a virtual address through this space's page tables.
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        self.directory.translate(vaddr)
    }

    /// Copies `data` into this address space at `vaddr`.
    ///
    /// Fails with `NotMapped` if any page in the range is unmapped.
    pub fn write_bytes(&self, vaddr: VirtualAddress, data: &[u8]) -> Result<(), MapError> {
        self.for_each_chunk(vaddr, data.len(), |phys, offset, len| {
            let dest = DirectMap::get().ptr_of(phys);
            // SAFETY: phys names len bytes of mapped frame memory reached via
            // the direct map.
            unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr().add(offset), dest, len);
            }
        })
    }

    /// Fills `len` bytes at `vaddr` in this address space with `value`.
    pub fn fill_bytes(
        &self,
        vaddr: VirtualAddress,
        len: usize,
        value: u8,
    ) -> Result<(), MapError> {
        self.for_each_chunk(vaddr, len, |phys, _offset, len| {
            let dest = DirectMap::get().ptr_of(phys);
            // SAFETY: phys names len bytes of mapped frame memory reached via
            // the direct map.
            unsafe {
                core::ptr::write_bytes(dest, value, len);
            }
        })
    }

    /// Copies bytes out of this address space at `vaddr` into `buf`.
    pub fn read_bytes(&self, vaddr: VirtualAddress, buf: &mut [u8]) -> Result<(), MapError> {
        let len = buf.len();
        let dest = buf.as_mut_ptr();
        self.for_each_chunk(vaddr, len, |phys, offset, len| {
            let src = DirectMap::get().ptr_of(phys);
            // SAFETY: phys names len bytes of mapped frame memory; dest is a
            // live buffer of sufficient length.
            unsafe {
                core::ptr::copy_nonoverlapping(src, dest.add(offset), len);
            }
        })
    }

    /// Creates a deep duplicate of this address space.
    ///
    /// Every anonymous region is re-allocated in the child and its contents
    /// copied eagerly. Borrowed mappings (kernel windows) are transient and
    /// not duplicated.
    pub fn fork(&self) -> Result<AddressSpace, MapError> {
        let mut child = AddressSpace::new();
        child.mmap_cursor = self.mmap_cursor;

        for region in &self.regions {
            if region.backing != Backing::Anonymous {
                continue;
            }

            child.map_memory_at(
                region.start.start(),
                region.pages * arch::PAGE_SIZE,
                region.protection,
            )?;

            for i in 0..region.pages {
                let vaddr = (region.start + i).start();
                let src = self.translate(vaddr).ok_or(MapError::NotMapped)?;
                let dst = child.translate(vaddr).ok_or(MapError::NotMapped)?;

                let map = DirectMap::get();
                // SAFETY: Both frames are whole mapped pages reached via the
                // direct map; they are distinct allocations.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        map.ptr_of(src),
                        map.ptr_of(dst),
                        arch::PAGE_SIZE,
                    );
                }
            }
        }

        Ok(child)
    }

    /// Installs this address space on the CPU.
    ///
    /// # Safety
    /// The space must map everything the CPU will touch in supervisor mode.
    pub unsafe fn activate(&self) {
        // SAFETY: Forwarded to the caller.
        unsafe { self.directory.activate() }
    }

    // Internal helpers

    fn page_count(size: usize) -> usize {
        size.div_ceil(arch::PAGE_SIZE)
    }

    fn page_flags(&self, protection: Protection) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_writable(protection.contains(Protection::WRITE));
        flags.set_user(!self.kernel);
        flags.set_no_execute(!protection.contains(Protection::EXEC));
        flags
    }

    fn map_one(&mut self, page: PageNumber, frame: PhysicalAddress, protection: Protection) {
        let flags = self.page_flags(protection);
        self.directory.map(page.start(), frame, flags);
    }

    fn check_free(&self, start: PageNumber, pages: usize) -> Result<(), MapError> {
        if self.regions.iter().any(|r| r.overlaps(start, pages)) {
            return Err(MapError::AlreadyMapped);
        }
        Ok(())
    }

    fn region_index(&self, page: PageNumber) -> Option<usize> {
        self.regions.iter().position(|r| r.contains(page))
    }

    /// Finds a free page-aligned range of `pages` pages at or above the
    /// mapping cursor and advances the cursor past it.
    fn find_free(&mut self, pages: usize) -> Result<VirtualAddress, MapError> {
        assert!(pages > 0, "mapping size must be non-zero");

        // Computed in u64: the end of the address space does not fit a usize
        // on the real 32-bit target.
        let limit = if self.kernel {
            1u64 << arch::MAX_VIRTUAL_BITS
        } else {
            arch::USER_SPACE_END as u64
        };

        let mut candidate = self.mmap_cursor;
        loop {
            let size = pages * arch::PAGE_SIZE;
            if candidate as u64 + size as u64 > limit {
                return Err(MapError::OutOfMemory);
            }

            let start = PageNumber::new(candidate / arch::PAGE_SIZE);
            match self
                .regions
                .iter()
                .filter(|r| r.overlaps(start, pages))
                .map(|r| (r.start.as_usize() + r.pages) * arch::PAGE_SIZE)
                .max()
            {
                // Skip past the highest-ending overlapping region.
                Some(next) => candidate = next,
                None => {
                    self.mmap_cursor = candidate.saturating_add(size);
                    return Ok(VirtualAddress::new(candidate));
                }
            }
        }
    }

    fn remove_region(&mut self, vaddr: VirtualAddress) -> usize {
        let start = vaddr.page_number();
        let index = self
            .regions
            .iter()
            .position(|r| r.start == start)
            .expect("no mapping at address");
        let region = self.regions.swap_remove(index);

        for i in 0..region.pages {
            if let Some(frame) = self.directory.unmap((region.start + i).start()) {
                if region.backing == Backing::Anonymous {
                    frame_allocator::free_frame(frame);
                }
            }
        }

        region.pages
    }

    /// Runs `f` over each physical chunk of the `len`-byte range at `vaddr`.
    ///
    /// `f` receives the chunk's physical address, the offset of the chunk
    /// within the range, and the chunk length. Chunks never cross page
    /// boundaries.
    fn for_each_chunk(
        &self,
        vaddr: VirtualAddress,
        len: usize,
        mut f: impl FnMut(PhysicalAddress, usize, usize),
    ) -> Result<(), MapError> {
        let mut offset = 0;
        while offset < len {
            let addr = vaddr + offset;
            let in_page = arch::PAGE_SIZE - addr.page_offset();
            let chunk = in_page.min(len - offset);

            let phys = self.translate(addr).ok_or(MapError::NotMapped)?;
            f(phys, offset, chunk);
            offset += chunk;
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Return every anonymous frame to the allocator. The page tables
        // themselves are released by the directory.
        while let Some(region) = self.regions.last() {
            let vaddr = region.start.start();
            self.remove_region(vaddr);
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// The distinguished kernel address space.
///
/// Initialized once during boot. Under software emulation this is
/// thread-local so every test owns an isolated kernel space.
#[cfg(not(any(test, software_paging)))]
static KERNEL_SPACE: spin::Once<spin::Mutex<AddressSpace>> = spin::Once::new();

#[cfg(any(test, software_paging))]
std::thread_local! {
    static KERNEL_SPACE: spin::Once<&'static spin::Mutex<AddressSpace>> = spin::Once::new();
}

/// Creates the kernel address space.
///
/// Must be called exactly once during initialization, after the address
/// translator is set.
///
/// # Panics
/// Panics if the kernel space has already been initialized.
pub fn init_kernel_space() {
    #[cfg(not(any(test, software_paging)))]
    {
        if KERNEL_SPACE.get().is_some() {
            panic!("kernel address space already initialized");
        }
        KERNEL_SPACE.call_once(|| spin::Mutex::new(AddressSpace::new_kernel()));
    }

    #[cfg(any(test, software_paging))]
    {
        KERNEL_SPACE.with(|k| {
            if k.get().is_some() {
                panic!("kernel address space already initialized");
            }
            k.call_once(|| {
                &*alloc::boxed::Box::leak(alloc::boxed::Box::new(spin::Mutex::new(
                    AddressSpace::new_kernel(),
                )))
            });
        });
    }
}

/// Returns the kernel address space.
///
/// # Panics
/// Panics if [`init_kernel_space`] has not been called.
pub fn kernel_space() -> &'static spin::Mutex<AddressSpace> {
    #[cfg(not(any(test, software_paging)))]
    {
        KERNEL_SPACE
            .get()
            .expect("kernel address space not initialized")
    }

    #[cfg(any(test, software_paging))]
    {
        KERNEL_SPACE.with(|k| *k.get().expect("kernel address space not initialized"))
    }
}

/// Zeroes one frame through the direct map.
fn zero_frame(frame: PhysicalAddress) {
    let ptr = DirectMap::get().ptr_of(frame);
    // SAFETY: The frame was just allocated and nothing else references it.
    unsafe {
        core::ptr::write_bytes(ptr, 0, arch::PAGE_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        if !DirectMap::is_installed() {
            DirectMap::hosted(0x10000).install();
        }
    }

    fn rw() -> Protection {
        Protection::READ | Protection::WRITE
    }

    #[test]
    fn map_memory_at_translates() {
        setup();
        let mut space = AddressSpace::new();

        let base = VirtualAddress::new(0x1000);
        space.map_memory_at(base, arch::PAGE_SIZE * 2, rw()).unwrap();

        assert!(space.translate(base).is_some());
        assert!(space.translate(base + arch::PAGE_SIZE).is_some());
        assert!(space.translate(base + arch::PAGE_SIZE * 2).is_none());
    }

    #[test]
    fn map_memory_at_rejects_overlap() {
        setup();
        let mut space = AddressSpace::new();

        let base = VirtualAddress::new(0x1000);
        space.map_memory_at(base, arch::PAGE_SIZE * 2, rw()).unwrap();

        let overlapping = base + arch::PAGE_SIZE;
        assert_eq!(
            space.map_memory_at(overlapping, arch::PAGE_SIZE, rw()),
            Err(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn map_memory_picks_distinct_addresses() {
        setup();
        let mut space = AddressSpace::new();

        let first = space.map_memory(arch::PAGE_SIZE, rw()).unwrap();
        let second = space.map_memory(arch::PAGE_SIZE, rw()).unwrap();

        assert_ne!(first, second);
        assert!(first.as_usize() >= arch::USER_MMAP_BASE);
        assert!(space.translate(first).is_some());
        assert!(space.translate(second).is_some());
    }

    #[test]
    fn anonymous_memory_is_zeroed() {
        setup();
        let mut space = AddressSpace::new();

        let vaddr = space.map_memory(arch::PAGE_SIZE, rw()).unwrap();
        let mut buf = [0xAAu8; arch::PAGE_SIZE];
        space.read_bytes(vaddr, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_and_read_across_page_boundary() {
        setup();
        let mut space = AddressSpace::new();

        let base = VirtualAddress::new(0x1000);
        space.map_memory_at(base, arch::PAGE_SIZE * 2, rw()).unwrap();

        let data: Vec<u8> = (0..(arch::PAGE_SIZE + 4) as u8).collect();
        let addr = base + arch::PAGE_SIZE / 2;
        space.write_bytes(addr, &data).unwrap();

        let mut readback = alloc::vec![0u8; data.len()];
        space.read_bytes(addr, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn write_to_unmapped_fails() {
        setup();
        let space = AddressSpace::new();
        assert_eq!(
            space.write_bytes(VirtualAddress::new(0x1000), &[1, 2, 3]),
            Err(MapError::NotMapped)
        );
    }

    #[test]
    fn unmap_removes_translation() {
        setup();
        let mut space = AddressSpace::new();

        let vaddr = space.map_memory(arch::PAGE_SIZE, rw()).unwrap();
        assert!(space.translate(vaddr).is_some());

        space.unmap(vaddr);
        assert!(space.translate(vaddr).is_none());
        assert!(space.is_empty());
    }

    #[test]
    fn map_physical_at_identity() {
        setup();
        let mut space = AddressSpace::new();

        let base = PhysicalAddress::new(arch::PAGE_SIZE * 4);
        space
            .map_physical_at(VirtualAddress::new(base.as_usize()), base, 2, rw())
            .unwrap();

        assert_eq!(
            space.translate(VirtualAddress::new(base.as_usize() + 3)),
            Some(base + 3)
        );
    }

    #[test]
    fn window_into_other_space() {
        setup();
        let mut target = AddressSpace::new();
        let mut kernel = AddressSpace::new_kernel();

        let base = VirtualAddress::new(0x1000);
        target.map_memory_at(base, arch::PAGE_SIZE * 2, rw()).unwrap();

        let window = kernel
            .map_from(&target, base, arch::PAGE_SIZE * 2, rw())
            .unwrap();
        kernel.write_bytes(window + 3, b"hello").unwrap();
        kernel.unmap_physical(window, arch::PAGE_SIZE * 2);

        // The write through the window landed in the target's frames, and
        // tearing the window down did not disturb them.
        let mut buf = [0u8; 5];
        target.read_bytes(base + 3, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn window_to_unmapped_source_fails() {
        setup();
        let target = AddressSpace::new();
        let mut kernel = AddressSpace::new_kernel();

        assert_eq!(
            kernel
                .map_from(&target, VirtualAddress::new(0x1000), arch::PAGE_SIZE, rw())
                .unwrap_err(),
            MapError::NotMapped
        );
    }

    #[test]
    fn fork_copies_contents() {
        setup();
        let mut parent = AddressSpace::new();

        let base = VirtualAddress::new(0x1000);
        parent.map_memory_at(base, arch::PAGE_SIZE * 2, rw()).unwrap();
        parent.write_bytes(base, b"parent data").unwrap();

        let child = parent.fork().unwrap();
        let mut buf = [0u8; 11];
        child.read_bytes(base, &mut buf).unwrap();
        assert_eq!(&buf, b"parent data");
    }

    #[test]
    fn fork_is_deep() {
        setup();
        let mut parent = AddressSpace::new();

        let base = VirtualAddress::new(0x1000);
        parent.map_memory_at(base, arch::PAGE_SIZE, rw()).unwrap();
        parent.write_bytes(base, b"original").unwrap();

        let child = parent.fork().unwrap();
        child.write_bytes(base, b"mutated!").unwrap();

        let mut buf = [0u8; 8];
        parent.read_bytes(base, &mut buf).unwrap();
        assert_eq!(&buf, b"original");
    }

    #[test]
    fn activate_records_root() {
        setup();
        let space = AddressSpace::new();

        // SAFETY: Software emulation only records the root.
        unsafe { space.activate() };
        assert_eq!(crate::arch::active_root(), Some(space.root_address()));
    }

    #[test]
    fn kernel_space_singleton() {
        setup();
        init_kernel_space();

        let space = kernel_space();
        let vaddr = space.lock().map_memory(arch::PAGE_SIZE, rw()).unwrap();
        assert!(vaddr.as_usize() >= arch::KERNEL_MMAP_BASE);
    }
}
