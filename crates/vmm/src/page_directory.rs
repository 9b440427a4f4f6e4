//! Page tables and the walks over them.
//!
//! A `PageDirectory` owns a tree of page tables rooted at the table the CPU
//! register points at. All table memory lives in physical frames and is
//! touched through the direct map, so the same walk code runs on hardware
//! and under software emulation.

use crate::{
    arch::{self, PageEntry, PageFlags, PageTable},
    DirectMap, PhysicalAddress, VirtualAddress,
};

/// Obtains a fresh, zeroed page table and returns a direct-map pointer to it.
///
/// Hosted builds carve tables out of the stand-in RAM; page alignment keeps
/// the table's address representable in a page table entry.
#[cfg(any(test, software_paging))]
fn new_table() -> *mut PageTable {
    let map = DirectMap::get();
    let frame = map
        .reserve(core::mem::size_of::<PageTable>(), arch::PAGE_SIZE)
        .expect("hosted RAM exhausted");

    let table: *mut PageTable = map.ptr_of(frame).cast();
    // SAFETY: The block was reserved for exactly this table.
    unsafe {
        table.write(PageTable::new());
        table
    }
}

/// Obtains a fresh, zeroed page table and returns a direct-map pointer to it.
///
/// On hardware a table is exactly one frame.
#[cfg(not(any(test, software_paging)))]
fn new_table() -> *mut PageTable {
    let frame = crate::frame_allocator::allocate_frame().expect("out of physical memory");

    let table: *mut PageTable = DirectMap::get().ptr_of(frame).cast();
    // SAFETY: The frame was allocated for exactly this table.
    unsafe {
        table.write(PageTable::new());
        table
    }
}

/// Releases a table created by `new_table`. The hosted stand-in RAM is not
/// reclaimed.
#[cfg(any(test, software_paging))]
fn release_table(_table: *mut PageTable) {}

/// Releases a table created by `new_table`.
#[cfg(not(any(test, software_paging)))]
fn release_table(table: *mut PageTable) {
    let frame = DirectMap::get().phys_of(table.cast());
    crate::frame_allocator::free_frame(frame);
}

/// The page table tree of one address space.
pub struct PageDirectory {
    /// The root table, in physical memory.
    root: *mut PageTable,
}

// SAFETY: Every table reachable from `root` is exclusively owned by this
// directory; nothing else holds pointers into the tree.
unsafe impl Send for PageDirectory {}

impl PageDirectory {
    /// Creates a directory mapping nothing.
    pub fn new() -> Self {
        Self { root: new_table() }
    }

    fn root(&self) -> &PageTable {
        // SAFETY: root stays valid for the directory's lifetime.
        unsafe { &*self.root }
    }

    fn root_mut(&mut self) -> &mut PageTable {
        // SAFETY: root stays valid for the directory's lifetime.
        unsafe { &mut *self.root }
    }

    /// Returns the direct-map pointer for the table starting at `frame`.
    fn table_at(frame: PhysicalAddress) -> *mut PageTable {
        DirectMap::get().ptr_of(frame).cast()
    }

    /// Returns the physical address of the root table (the CR3 value).
    pub fn root_address(&self) -> PhysicalAddress {
        self.root().physical_address()
    }

    /// Installs this directory's root table on the CPU.
    ///
    /// # Safety
    /// The directory must map everything the CPU will touch, including the
    /// kernel and the tables themselves.
    pub unsafe fn activate(&self) {
        // SAFETY: Forwarded to the caller.
        unsafe { self.root().activate() }
    }

    /// Points `virt` at `phys`.
    ///
    /// Intermediate tables are created as needed; whatever the leaf entry
    /// held before is overwritten.
    ///
    /// # Panics
    /// Panics if either address is not aligned to a page boundary.
    pub fn map(&mut self, virt: VirtualAddress, phys: PhysicalAddress, flags: PageFlags) {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "map requires a page-aligned virtual address"
        );
        assert!(
            phys.is_aligned(arch::PAGE_SIZE),
            "map requires a page-aligned physical address"
        );

        let mut flags = flags;
        flags.set_present(true);

        let slot = self
            .leaf_entry(virt, true)
            .expect("allocating descent cannot fail");
        *slot = PageEntry::new(phys, flags);
    }

    /// Removes the mapping for `virt`, returning the frame it pointed at, or
    /// None if nothing was mapped there.
    ///
    /// # Panics
    /// Panics if `virt` is not aligned to a page boundary.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "unmap requires a page-aligned virtual address"
        );

        let slot = self.leaf_entry(virt, false)?;
        let frame = slot.frame()?;
        slot.clear();
        Some(frame)
    }

    /// Resolves `virt` to the physical address it maps to.
    ///
    /// The address does not need to be page-aligned; the page offset carries
    /// over into the result. Returns None if the address is not mapped.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.root();

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let frame = table.entry(virt.page_index(level)).frame()?;
            // SAFETY: Present intermediate entries only ever point at tables
            // this directory created.
            table = unsafe { &*Self::table_at(frame) };
        }

        let page = table.entry(virt.page_index(0)).frame()?;
        Some(page + virt.page_offset())
    }

    /// Descends from the root to the level-0 entry for `virt`.
    ///
    /// With `allocate_missing`, absent intermediate tables are created along
    /// the way and the descent cannot fail; without it, an absent table ends
    /// the descent with None.
    fn leaf_entry(
        &mut self,
        virt: VirtualAddress,
        allocate_missing: bool,
    ) -> Option<&mut PageEntry> {
        let mut table = self.root_mut();

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let slot = table.entry_mut(virt.page_index(level));

            let next = match slot.frame() {
                Some(frame) => frame,
                None if allocate_missing => {
                    let child = new_table();
                    let frame = DirectMap::get().phys_of(child.cast());

                    // Leaf entries decide the effective access; intermediate
                    // ones just need to let the walk through.
                    let mut flags = PageFlags::empty();
                    flags.set_present(true);
                    flags.set_writable(true);
                    flags.set_user(true);
                    *slot = PageEntry::new(frame, flags);
                    frame
                }
                None => return None,
            };

            // SAFETY: The table was either just created or was created by an
            // earlier descent.
            table = unsafe { &mut *Self::table_at(next) };
        }

        Some(table.entry_mut(virt.page_index(0)))
    }

    /// Releases every table reachable from `table` at the given level.
    fn free_subtree(table: *mut PageTable, level: usize) {
        if level > 0 {
            // SAFETY: The table is owned by this directory until freed below.
            let table_ref = unsafe { &*table };
            for index in 0..table_ref.len() {
                if let Some(child) = table_ref.entry(index).frame() {
                    Self::free_subtree(Self::table_at(child), level - 1);
                }
            }
        }
        release_table(table);
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        Self::free_subtree(self.root, arch::PAGE_TABLE_LEVELS - 1);
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}
