//! Hosted stand-ins for privileged CPU operations.
//!
//! These record state changes in thread-locals so tests can observe what the
//! kernel would have programmed into the hardware.

use core::cell::Cell;

std::thread_local! {
    /// The value the kernel last handed to `set_kernel_stack`; stands in for
    /// the TSS esp0 field.
    static KERNEL_STACK_TOP: Cell<usize> = const { Cell::new(0) };
}

/// Records the kernel stack top the next ring transition would use.
pub fn set_kernel_stack(top: usize) {
    KERNEL_STACK_TOP.with(|t| t.set(top));
}

/// Returns the kernel stack top most recently installed.
pub fn kernel_stack_top() -> usize {
    KERNEL_STACK_TOP.with(|t| t.get())
}

pub fn enable_interrupts() {}

pub fn park() -> ! {
    panic!("park is only meaningful on hardware");
}
