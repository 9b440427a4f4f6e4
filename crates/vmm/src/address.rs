//! Physical and virtual addresses, and the kernel's view of raw memory.
//!
//! Addresses are validated newtypes: a value that does not fit the
//! architecture's address width cannot be constructed. Raw physical memory is
//! reached through the [`DirectMap`], installed once at boot.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

#[cfg(any(test, software_paging))]
use crate::arch::HostedRam;

/// Rounds `value` down to a multiple of `align`.
///
/// # Panics
/// Panics if `align` is not a power of two.
pub(crate) const fn round_down(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two(), "align must be a power of two");
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align`.
///
/// # Panics
/// Panics if `align` is not a power of two.
pub(crate) const fn round_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two(), "align must be a power of two");
    (value + align - 1) & !(align - 1)
}

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    /// Creates a physical address.
    ///
    /// # Panics
    /// Panics if the value does not fit the architecture's physical address
    /// width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            crate::arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns whether the address is a multiple of `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 == round_down(self.0, align)
    }

    /// Returns the address rounded down to a multiple of `align`.
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        Self(round_down(self.0, align))
    }

    /// Returns the address rounded up to a multiple of `align`.
    #[inline]
    pub const fn align_up(self, align: usize) -> Self {
        Self(round_up(self.0, align))
    }
}

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    /// Creates a virtual address.
    ///
    /// # Panics
    /// Panics if the value does not fit the architecture's virtual address
    /// width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            crate::arch::validate_virtual(addr),
            "virtual address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the address as a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the address as a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the offset of the address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 % arch::PAGE_SIZE
    }

    /// Returns the page table index this address selects at `level`
    /// (0 = page table, upward toward the root).
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Returns the number of the page containing this address.
    #[inline]
    pub fn page_number(self) -> crate::PageNumber {
        crate::PageNumber::containing(self)
    }

    /// Returns whether the address is a multiple of `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 == round_down(self.0, align)
    }

    /// Returns the address rounded down to a multiple of `align`.
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        Self(round_down(self.0, align))
    }

    /// Returns the address rounded up to a multiple of `align`.
    #[inline]
    pub const fn align_up(self, align: usize) -> Self {
        Self(round_up(self.0, align))
    }
}

// Both address types print as hex, offset by integers, and subtract to a
// byte distance.
macro_rules! address_ops {
    ($name:ident) => {
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, offset: usize) -> Self {
                Self::new(self.0 + offset)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, offset: usize) -> Self {
                Self::new(self.0 - offset)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, other: $name) -> usize {
                self.0 - other.0
            }
        }
    };
}

address_ops!(PhysicalAddress);
address_ops!(VirtualAddress);

/// The kernel's window onto raw physical memory.
///
/// On hardware, boot establishes that all of physical memory is visible at a
/// fixed offset in the kernel half of every address space, so reaching a
/// frame is pointer arithmetic. Hosted builds (the test suite included) have
/// no such window; a block of host memory stands in for RAM and "physical"
/// addresses are offsets into it.
///
/// One `DirectMap` is installed per boot — per test thread in hosted builds,
/// so tests cannot see each other's memory.
pub enum DirectMap {
    /// Physical memory is visible at a constant offset (0 = identity).
    AtOffset(usize),
    /// Physical memory is a host allocation.
    #[cfg(any(test, software_paging))]
    Hosted(HostedRam),
}

#[cfg(not(any(test, software_paging)))]
static DIRECT_MAP: spin::Once<DirectMap> = spin::Once::new();

#[cfg(any(test, software_paging))]
std::thread_local! {
    static DIRECT_MAP: spin::Once<&'static DirectMap> = spin::Once::new();
}

impl DirectMap {
    /// A direct map at a fixed offset in the kernel half.
    pub const fn at_offset(offset: usize) -> Self {
        Self::AtOffset(offset)
    }

    /// A direct map over `size` bytes of host memory standing in for RAM.
    #[cfg(any(test, software_paging))]
    pub fn hosted(size: usize) -> Self {
        Self::Hosted(HostedRam::new(size))
    }

    /// Makes this the kernel's direct map.
    ///
    /// # Panics
    /// Panics if a direct map has already been installed.
    pub fn install(self) {
        #[cfg(not(any(test, software_paging)))]
        {
            if DIRECT_MAP.get().is_some() {
                panic!("direct map already installed");
            }
            DIRECT_MAP.call_once(|| self);
        }

        #[cfg(any(test, software_paging))]
        DIRECT_MAP.with(|map| {
            if map.get().is_some() {
                panic!("direct map already installed");
            }
            // Leaked so `get` can hand out &'static; one leak per test thread.
            map.call_once(|| &*alloc::boxed::Box::leak(alloc::boxed::Box::new(self)));
        });
    }

    /// Returns the installed direct map.
    ///
    /// # Panics
    /// Panics if no direct map has been installed yet.
    pub fn get() -> &'static DirectMap {
        #[cfg(not(any(test, software_paging)))]
        {
            DIRECT_MAP.get().expect("no direct map installed")
        }

        #[cfg(any(test, software_paging))]
        DIRECT_MAP.with(|map| *map.get().expect("no direct map installed"))
    }

    /// Returns whether a direct map has been installed (on this thread, in
    /// hosted builds).
    #[cfg(any(test, software_paging))]
    pub fn is_installed() -> bool {
        DIRECT_MAP.with(|map| map.get().is_some())
    }

    /// Returns a pointer through which the byte at `phys` can be read and
    /// written.
    pub fn ptr_of(&self, phys: PhysicalAddress) -> *mut u8 {
        match self {
            Self::AtOffset(offset) => phys.as_usize().wrapping_add(*offset) as *mut u8,
            #[cfg(any(test, software_paging))]
            Self::Hosted(ram) => ram.ptr_at(phys.as_usize()),
        }
    }

    /// Returns the physical address a direct-mapped pointer refers to.
    pub fn phys_of(&self, ptr: *const u8) -> PhysicalAddress {
        let raw = match self {
            Self::AtOffset(offset) => (ptr as usize).wrapping_sub(*offset),
            #[cfg(any(test, software_paging))]
            Self::Hosted(ram) => ram.offset_of(ptr),
        };
        PhysicalAddress::new(raw)
    }

    /// Carves an aligned block out of the hosted RAM.
    ///
    /// This is the frame source for hosted builds, where no firmware memory
    /// map exists. Returns None when the RAM is exhausted.
    ///
    /// # Panics
    /// Panics on a hardware direct map, which has nothing to carve from.
    #[cfg(any(test, software_paging))]
    pub fn reserve(&self, size: usize, align: usize) -> Option<PhysicalAddress> {
        match self {
            Self::AtOffset(_) => panic!("hardware memory is owned by the frame allocator"),
            Self::Hosted(ram) => ram.reserve(size, align).map(PhysicalAddress::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn holds_its_value() {
            assert_eq!(PhysicalAddress::new(0x0123).as_usize(), 0x0123);
            assert_eq!(PhysicalAddress::new(0).as_usize(), 0);
        }

        #[test]
        fn accepts_the_top_of_the_address_space() {
            let top = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
            assert_eq!(PhysicalAddress::new(top).as_usize(), top);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn rejects_addresses_past_the_top() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn alignment_helpers() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE + 5);
            assert!(!addr.is_aligned(arch::PAGE_SIZE));
            assert_eq!(
                addr.align_down(arch::PAGE_SIZE).as_usize(),
                arch::PAGE_SIZE
            );
            assert_eq!(
                addr.align_up(arch::PAGE_SIZE).as_usize(),
                arch::PAGE_SIZE * 2
            );

            let aligned = PhysicalAddress::new(arch::PAGE_SIZE * 3);
            assert!(aligned.is_aligned(arch::PAGE_SIZE));
            assert_eq!(aligned.align_down(arch::PAGE_SIZE), aligned);
            assert_eq!(aligned.align_up(arch::PAGE_SIZE), aligned);
        }

        #[test]
        fn arithmetic() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!((addr + 0x50).as_usize(), 0x0150);
            assert_eq!((addr - 0x80).as_usize(), 0x0080);
            assert_eq!(PhysicalAddress::new(0x0150) - addr, 0x50);
        }

        #[test]
        fn formats_as_hex() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x100)");
            assert_eq!(format!("{}", addr), "0x100");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn holds_its_value() {
            assert_eq!(VirtualAddress::new(0x1234).as_usize(), 0x1234);
        }

        #[test]
        #[should_panic(expected = "virtual address exceeds maximum width")]
        fn rejects_addresses_past_the_top() {
            VirtualAddress::new(1usize << arch::MAX_VIRTUAL_BITS);
        }

        #[test]
        fn page_offset() {
            assert_eq!(VirtualAddress::new(arch::PAGE_SIZE + 4).page_offset(), 4);
            assert_eq!(VirtualAddress::new(arch::PAGE_SIZE).page_offset(), 0);
        }

        #[test]
        fn page_indices_split_the_address() {
            // Scale model: 6-bit indices above a 4-bit page offset.
            let addr = VirtualAddress::new((1 << 10) | (2 << 4) | 3);
            assert_eq!(addr.page_offset(), 3);
            assert_eq!(addr.page_index(0), 2);
            assert_eq!(addr.page_index(1), 1);
        }

        #[test]
        fn converts_to_pointers() {
            let addr = VirtualAddress::new(0x0100);
            assert_eq!(addr.as_ptr::<u8>() as usize, 0x0100);
            assert_eq!(addr.as_mut_ptr::<u8>() as usize, 0x0100);
        }
    }

    mod direct_map {
        use super::*;

        #[test]
        fn hosted_round_trip() {
            DirectMap::hosted(4096).install();
            let map = DirectMap::get();

            let phys = map.reserve(64, 16).unwrap();
            let ptr = map.ptr_of(phys);
            assert_eq!(map.phys_of(ptr), phys);
        }

        #[test]
        fn reservations_do_not_overlap() {
            DirectMap::hosted(4096).install();
            let map = DirectMap::get();

            let first = map.reserve(32, 16).unwrap();
            let second = map.reserve(32, 16).unwrap();
            assert!(second.as_usize() >= first.as_usize() + 32);
        }

        #[test]
        #[should_panic(expected = "direct map already installed")]
        fn refuses_a_second_install() {
            DirectMap::hosted(64).install();
            DirectMap::hosted(64).install();
        }
    }
}
