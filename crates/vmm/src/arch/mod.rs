//! Architecture-specific implementations for memory management.
//!
//! This module conditionally imports either hardware-specific implementations
//! or software emulation based on the target architecture and features.

// Use the x86 hardware implementation when we're on 32-bit x86 and not
// testing or emulating.
#[cfg(not(any(test, software_paging)))]
mod x86;
#[cfg(not(any(test, software_paging)))]
pub use x86::*;

// Use software emulation everywhere else: tests, hosted builds, or when the
// software-emulation feature is explicitly enabled.
#[cfg(any(test, software_paging))]
mod software;
#[cfg(any(test, software_paging))]
pub use software::*;
