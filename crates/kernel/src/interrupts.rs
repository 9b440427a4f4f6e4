//! Interrupt frames and the user-kernel register ABI.

/// Selector for user-mode code (GDT entry 3, RPL 3).
pub const USER_CODE_SELECTOR: u32 = 0x1B;

/// Selector for user-mode data and stack (GDT entry 4, RPL 3).
pub const USER_DATA_SELECTOR: u32 = 0x23;

/// EFLAGS with only the interrupt-enable bit set.
pub const EFLAGS_INTERRUPT_ENABLE: u32 = 0x200;

/// The saved register image pushed by the ISR prologue.
///
/// The prologue pushes the general-purpose registers and the vector/error
/// pair below the frame the CPU pushed on the ring transition, so a pointer
/// to this struct is a pointer into the interrupted context's kernel stack.
/// The ISR epilogue restores the image wholesale; returning from the
/// interrupt therefore resumes whatever this struct describes. Field order is
/// the stack layout and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct InterruptContext {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,

    /// The interrupt vector.
    pub interrupt: u32,
    /// The error code pushed by the CPU, or 0 for vectors without one.
    pub error: u32,

    // Pushed by the CPU on the ring transition.
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// The register image user space supplies to fork.
///
/// The caller chooses exactly what the child resumes with instead of
/// implicitly inheriting the parent's trap frame, so the scheduler never
/// needs to distinguish parent from child on return. Field order is part of
/// the stable user-kernel ABI.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RegisterFrame {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eip: u32,
    pub esp: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_layout_matches_isr_stack() {
        // The ISR prologue and epilogue hard-code this layout.
        assert_eq!(core::mem::size_of::<InterruptContext>(), 14 * 4);
        assert_eq!(core::mem::offset_of!(InterruptContext, eax), 0);
        assert_eq!(core::mem::offset_of!(InterruptContext, interrupt), 28);
        assert_eq!(core::mem::offset_of!(InterruptContext, eip), 36);
        assert_eq!(core::mem::offset_of!(InterruptContext, ss), 52);
    }

    #[test]
    fn default_context_is_zeroed() {
        let context = InterruptContext::default();
        assert_eq!(context, unsafe { core::mem::zeroed() });
    }
}
