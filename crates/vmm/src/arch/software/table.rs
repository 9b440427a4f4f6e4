//! Page table structure for software emulation.

use crate::{DirectMap, PhysicalAddress};

use super::entry::PageEntry;

/// Number of entries in a software-emulated page table.
/// With 6-bit indexes, we have 64 entries per table.
const ENTRY_COUNT: usize = 64;

/// A page table for software emulation.
///
/// A scale model of the x86 two-level tables:
/// - 16-bit addresses
/// - 6-bit index at each level (64 entries per table)
/// - 4-bit page offset (16-byte pages)
///
/// Address layout:
/// - Bits 0-3: Page offset (16 bytes)
/// - Bits 4-9: Level 0 index (PT)
/// - Bits 10-15: Level 1 index (PD)
///
/// Tables live in the emulated physical memory region so that
/// `physical_address` and entry dereferencing go through the same
/// translation the real architecture uses.
#[repr(C)]
pub struct PageTable {
    /// The entries in this page table.
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Creates a new, empty page table.
    ///
    /// All entries are initialized to zero (not present).
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::zero(); ENTRY_COUNT],
        }
    }

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 64.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 64.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns the number of entries in this page table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    /// Returns the physical address of this page table.
    ///
    /// This is the address that would be stored in a parent page table entry
    /// or used as the root table address.
    pub fn physical_address(&self) -> PhysicalAddress {
        DirectMap::get().phys_of(self.entries.as_ptr().cast())
    }

    /// Activates this page table by setting it as the current root table.
    ///
    /// In software emulation this records the root in thread-local state
    /// standing in for the CR3 register.
    ///
    /// # Safety
    /// This function is unsafe for parity with the hardware implementation,
    /// where loading an invalid page table causes undefined behavior.
    pub unsafe fn activate(&self) {
        super::set_active_root(self.physical_address());
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
