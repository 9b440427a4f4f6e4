//! Architecture-specific CPU plumbing.
//!
//! The real implementation exists for 32-bit x86. Hosted builds (including
//! the test suite) get stand-ins that record what the kernel asked for
//! instead of touching privileged state.

#[cfg(all(target_arch = "x86", not(test)))]
mod x86;
#[cfg(all(target_arch = "x86", not(test)))]
pub use x86::*;

#[cfg(any(test, not(target_arch = "x86")))]
mod hosted;
#[cfg(any(test, not(target_arch = "x86")))]
pub use hosted::*;
