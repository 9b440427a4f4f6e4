//! Round-robin scheduling from the timer interrupt.
//!
//! Every timer tick hands the scheduler the interrupt frame the ISR pushed
//! and gets back the frame of the next runnable process; the ISR epilogue
//! restores that frame, which is what resumes the process. The runnable list
//! is traversed one step per tick, so every runnable process is selected once
//! per full traversal; the idle process runs only while the list is empty.

use spin::{Mutex, Once};

use crate::interrupts::InterruptContext;
use crate::process::ProcessTable;

impl ProcessTable {
    /// Advances the round-robin by one step.
    ///
    /// `context` is the register frame of the just-interrupted process. It is
    /// saved into the outgoing record unless that record just published a
    /// synthetic frame (`context_changed`), which must not be overwritten by
    /// the in-flight interrupt frame.
    ///
    /// Records retired by `exit` are freed here, one full tick after the
    /// scheduler stepped off them: during the tick that switches away, the
    /// CPU is still executing on the dying process's kernel stack.
    pub fn schedule(&mut self, context: *mut InterruptContext) -> *mut InterruptContext {
        if let Some(slot) = self.reap_next.take() {
            debug_assert_ne!(slot, self.current);
            self.release_slot(slot);
        }

        let outgoing = self.current;
        {
            let record = self.record_mut(outgoing);
            if !record.context_changed() {
                record.set_context(context);
            } else {
                record.clear_context_changed();
            }
        }

        let next = self
            .record(outgoing)
            .next_slot()
            .or(self.first)
            .unwrap_or(self.idle);
        self.current = next;

        if let Some(top) = self.record(next).kernel_stack_top() {
            crate::arch::set_kernel_stack(top);
        }

        match self.record(next).address_space() {
            // SAFETY: Process address spaces are built by the loader and fork
            // and map everything the process touches; the kernel space is the
            // boot-established one.
            Some(space) => unsafe { space.activate() },
            None => unsafe { vmm::kernel_space().lock().activate() },
        }

        if outgoing != next && self.record(outgoing).is_dead() {
            self.reap_next = Some(outgoing);
        }

        self.record(next).context_ptr()
    }
}

/// The global process table.
static PROCESS_TABLE: Once<Mutex<ProcessTable>> = Once::new();

/// Installs the process table built during boot.
///
/// # Panics
/// Panics if the table has already been installed.
pub fn init(table: ProcessTable) {
    if PROCESS_TABLE.get().is_some() {
        panic!("process table already initialized");
    }
    PROCESS_TABLE.call_once(|| Mutex::new(table));
}

/// Returns the global process table.
///
/// # Panics
/// Panics if [`init`] has not been called.
pub fn table() -> &'static Mutex<ProcessTable> {
    PROCESS_TABLE.get().expect("process table not initialized")
}

/// Timer interrupt entry point.
///
/// Called by the timer ISR with the frame it saved; the returned frame is the
/// one the ISR epilogue restores.
pub extern "C" fn timer_tick(context: *mut InterruptContext) -> *mut InterruptContext {
    table().lock().schedule(context)
}
