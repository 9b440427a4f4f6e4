//! Boot-time process creation.
//!
//! The bootloader supplies a list of physical ranges, each holding a complete
//! ELF image. Boot maps each range into the kernel address space, wraps the
//! image in an in-memory file node, and starts one process from it.

use alloc::{format, sync::Arc, vec};

use vmm::{kernel_space, PhysicalAddress, Protection, PAGE_SIZE};

use crate::errno::Errno;
use crate::fs::file::FileNode;
use crate::fs::{FileHandle, Vnode};
use crate::multiboot::{ModuleEntry, MultibootInfo};
use crate::process::ProcessTable;

/// Starts one process per multiboot module.
///
/// Returns the number of processes created. Each module's physical frames
/// are temporarily mapped into the kernel address space, copied into a
/// [`FileNode`], and executed; the node is also linked into the root
/// directory under a `modN` name so the images stay reachable.
pub fn process_boot_modules(
    table: &mut ProcessTable,
    info_paddr: PhysicalAddress,
) -> Result<usize, Errno> {
    let info: MultibootInfo = read_physical(info_paddr)?;
    if !info.has_modules() {
        return Ok(0);
    }

    let list_paddr = PhysicalAddress::new(info.mods_addr as usize);
    let list_aligned = list_paddr.align_down(PAGE_SIZE);
    let list_offset = list_paddr - list_aligned;

    // FIXME: This assumes that the module list is in a single page.
    let entries_in_page = (PAGE_SIZE - list_offset) / core::mem::size_of::<ModuleEntry>();
    let count = (info.mods_count as usize).min(entries_in_page);

    let mut entries = vec![];
    {
        let mut kernel = kernel_space().lock();
        let page = kernel
            .map_physical(list_aligned, Protection::READ)
            .map_err(Errno::from)?;
        for i in 0..count {
            let mut raw = [0u8; core::mem::size_of::<ModuleEntry>()];
            kernel
                .read_bytes(page + list_offset + i * raw.len(), &mut raw)
                .map_err(Errno::from)?;
            // SAFETY: ModuleEntry is plain old data; any bit pattern is valid.
            entries.push(unsafe {
                core::ptr::read_unaligned(raw.as_ptr() as *const ModuleEntry)
            });
        }
        kernel.unmap_physical(page, PAGE_SIZE);
    }

    let mut started = 0;
    for (index, entry) in entries.iter().enumerate() {
        if entry.is_empty() {
            continue;
        }
        start_module_process(table, index, entry)?;
        started += 1;
    }
    Ok(started)
}

/// Maps one module, wraps its image in a file node and starts a process
/// running it.
fn start_module_process(
    table: &mut ProcessTable,
    index: usize,
    entry: &ModuleEntry,
) -> Result<(), Errno> {
    let start = PhysicalAddress::new(entry.mod_start as usize);
    let aligned = start.align_down(PAGE_SIZE);
    let offset = start - aligned;
    let pages = (offset + entry.len()).div_ceil(PAGE_SIZE);

    let mut image = vec![0u8; entry.len()];
    {
        let mut kernel = kernel_space().lock();
        let window = kernel
            .map_physical_range(aligned, pages, Protection::READ)
            .map_err(Errno::from)?;
        kernel
            .read_bytes(window + offset, &mut image)
            .map_err(Errno::from)?;
        kernel.unmap_physical(window, pages * PAGE_SIZE);
    }

    let node = Arc::new(Vnode::File(FileNode::new(&image, 0o755)));

    // Best effort: module nodes get names in the root directory.
    if let Some(root) = table.record(table.idle_slot()).root_handle() {
        if let Vnode::Directory(dir) = root.node().as_ref() {
            let _ = dir.link(&format!("mod{}", index), node.clone());
        }
    }

    let slot = table.create_process();
    table.execute(slot, &FileHandle::new(node), &[], &[])?;
    table.add_process(slot);
    log::info!(
        "started process {} from boot module {}",
        table.record(slot).pid(),
        index
    );
    Ok(())
}

/// Reads a plain-old-data structure from physical memory through a temporary
/// kernel mapping.
fn read_physical<T: Copy>(paddr: PhysicalAddress) -> Result<T, Errno> {
    let aligned = paddr.align_down(PAGE_SIZE);
    let offset = paddr - aligned;
    let size = core::mem::size_of::<T>();
    let pages = (offset + size).div_ceil(PAGE_SIZE);

    let mut buffer = vec![0u8; size];
    let mut kernel = kernel_space().lock();
    let window = kernel
        .map_physical_range(aligned, pages, Protection::READ)
        .map_err(Errno::from)?;
    kernel
        .read_bytes(window + offset, &mut buffer)
        .map_err(Errno::from)?;
    kernel.unmap_physical(window, pages * PAGE_SIZE);

    // SAFETY: The caller only instantiates this for plain-old-data structures
    // for which any bit pattern is valid.
    Ok(unsafe { core::ptr::read_unaligned(buffer.as_ptr() as *const T) })
}

/// Seeds the frame allocator from the multiboot memory map.
///
/// Runs before the kernel address space exists, so the boot information is
/// read through the direct map rather than through a mapping. Usable RAM
/// below 1 MiB, the kernel image and the module ranges are left out.
#[cfg(all(target_arch = "x86", not(test)))]
pub(crate) fn init_physical_memory(info_paddr: PhysicalAddress) {
    use crate::multiboot::{MemoryMapEntry, MEMORY_AVAILABLE};
    use vmm::DirectMap;

    let map = DirectMap::get();
    // SAFETY: The bootloader placed a MultibootInfo at this address.
    let info: MultibootInfo =
        unsafe { core::ptr::read_unaligned(map.ptr_of(info_paddr).cast()) };

    let mut reserved = vec![kernel_image_range()];
    if info.has_modules() {
        // SAFETY: The module list is bootloader-provided plain old data.
        let list = info.mods_addr as usize;
        for i in 0..info.mods_count as usize {
            let entry_paddr =
                PhysicalAddress::new(list + i * core::mem::size_of::<ModuleEntry>());
            let entry: ModuleEntry =
                unsafe { core::ptr::read_unaligned(map.ptr_of(entry_paddr).cast()) };
            reserved.push((entry.mod_start as usize, entry.mod_end as usize));
        }
    }

    if info.has_memory_map() {
        let mut offset = 0;
        while offset + core::mem::size_of::<MemoryMapEntry>() <= info.mmap_length as usize {
            let entry_paddr = PhysicalAddress::new(info.mmap_addr as usize + offset);
            // SAFETY: The memory map is bootloader-provided plain old data.
            let entry: MemoryMapEntry =
                unsafe { core::ptr::read_unaligned(map.ptr_of(entry_paddr).cast()) };
            if entry.entry_type == MEMORY_AVAILABLE {
                add_usable(entry.addr as usize, entry.len as usize, &reserved);
            }
            offset += entry.size as usize + 4;
        }
    } else if info.has_memory_bounds() {
        add_usable(0x10_0000, info.mem_upper as usize * 1024, &reserved);
    }
}

/// Adds `[base, base + len)` to the frame allocator, skipping everything
/// below 1 MiB, clamping to the identity-mapped window and carving out the
/// reserved ranges.
#[cfg(all(target_arch = "x86", not(test)))]
fn add_usable(base: usize, len: usize, reserved: &[(usize, usize)]) {
    let mut start = base.max(0x10_0000);
    let end = (base + len).min(IDENTITY_LIMIT);

    while start < end {
        // Find the first reserved range intersecting [start, end).
        let next = reserved
            .iter()
            .filter(|&&(r_start, r_end)| r_end > start && r_start < end)
            .min_by_key(|&&(r_start, _)| r_start);

        match next {
            Some(&(r_start, r_end)) if r_start <= start => {
                start = r_end;
            }
            Some(&(r_start, r_end)) => {
                vmm::add_usable_region(PhysicalAddress::new(start), r_start - start);
                start = r_end;
            }
            None => {
                vmm::add_usable_region(PhysicalAddress::new(start), end - start);
                break;
            }
        }
    }
}

/// Returns the physical range of the kernel image, from linker symbols.
#[cfg(all(target_arch = "x86", not(test)))]
fn kernel_image_range() -> (usize, usize) {
    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }
    // SAFETY: Linker symbols are valid for the kernel's lifetime.
    unsafe {
        (
            &__kernel_start as *const u8 as usize,
            &__kernel_end as *const u8 as usize,
        )
    }
}

/// How much of low physical memory the kernel identity-maps for itself.
#[cfg(all(target_arch = "x86", not(test)))]
const IDENTITY_LIMIT: usize = 64 * 1024 * 1024;

/// Builds the kernel's identity mapping and switches paging on.
///
/// The boot stub enters with paging off and the kernel linked at its load
/// address, so the kernel space identity-maps low memory and activates.
#[cfg(all(target_arch = "x86", not(test)))]
pub(crate) fn identity_map_kernel() {
    use vmm::VirtualAddress;

    let mut kernel = kernel_space().lock();
    kernel
        .map_physical_at(
            VirtualAddress::new(0),
            PhysicalAddress::new(0),
            IDENTITY_LIMIT / PAGE_SIZE,
            Protection::READ | Protection::WRITE | Protection::EXEC,
        )
        .expect("failed to build the identity mapping");

    // SAFETY: The identity mapping covers the kernel image, the direct map
    // and the tables themselves.
    unsafe {
        kernel.activate();
        crate::arch::enable_paging();
    }
}
