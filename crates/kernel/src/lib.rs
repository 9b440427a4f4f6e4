// cSpell:ignore kmain

#![cfg_attr(all(target_arch = "x86", not(test)), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod console;
pub mod errno;
pub mod fs;
#[cfg(all(target_arch = "x86", not(test)))]
mod heap;
pub mod interrupts;
pub mod loader;
pub mod multiboot;
pub mod process;
pub mod scheduler;
pub mod serial;

pub use boot::process_boot_modules;
pub use errno::Errno;

#[cfg(all(target_arch = "x86", not(test)))]
use vmm::{DirectMap, PhysicalAddress};

/// Offset at which physical memory is direct-mapped in the kernel half.
///
/// The boot stub enters `kernel_main` with paging off, so physical addresses
/// are kernel-virtual addresses: the direct map is the identity map.
#[cfg(all(target_arch = "x86", not(test)))]
const DIRECT_MAP_OFFSET: usize = 0;

/// The kernel's main function.
///
/// Called by the boot stub with interrupts disabled, on the bootstrap stack.
/// Brings the machine under control, starts one process per boot module, and
/// then idles; all further work happens in interrupt context.
#[cfg(all(target_arch = "x86", not(test)))]
pub fn kernel_main(_magic: u32, multiboot_paddr: u32) -> ! {
    let console = console::Console::init();
    serial::init(console);
    log::info!("meridian starting");

    heap::init();
    DirectMap::at_offset(DIRECT_MAP_OFFSET).install();

    // The frame allocator must know about usable memory before the kernel
    // address space allocates its first page table, so the memory map is read
    // through the direct map first.
    let info_paddr = PhysicalAddress::new(multiboot_paddr as usize);
    boot::init_physical_memory(info_paddr);
    log::info!("physical memory initialized");

    vmm::init_kernel_space();
    boot::identity_map_kernel();
    log::info!("kernel address space initialized");

    let root = fs::directory::root_handle();
    let table = process::ProcessTable::initialize(root);
    scheduler::init(table);

    let started = {
        let mut table = scheduler::table().lock();
        process_boot_modules(&mut table, info_paddr).expect("failed to start boot processes")
    };
    log::info!("{} boot processes started", started);

    arch::init();
    arch::init_pic();
    arch::init_pit();
    arch::enable_interrupts();
    log::info!("interrupts enabled");

    arch::park();
}
