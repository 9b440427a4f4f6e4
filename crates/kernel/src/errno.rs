//! POSIX-style error numbers surfaced to user space.

use core::fmt;

/// The error kinds the kernel reports to callers.
///
/// These follow the classical POSIX taxonomy rather than introducing a new
/// scheme; user space sees them as the corresponding errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// EINVAL: invalid argument.
    Inval,
    /// ENOMEM: not enough memory.
    NoMem,
    /// ENOSPC: no space left on device.
    NoSpc,
    /// EMFILE: too many open files.
    MFile,
    /// ENOENT: no such file or directory.
    NoEnt,
    /// EEXIST: file exists.
    Exist,
    /// ENOEXEC: exec format error.
    NoExec,
}

impl Errno {
    /// Returns the conventional errno name.
    pub const fn name(self) -> &'static str {
        match self {
            Errno::Inval => "EINVAL",
            Errno::NoMem => "ENOMEM",
            Errno::NoSpc => "ENOSPC",
            Errno::MFile => "EMFILE",
            Errno::NoEnt => "ENOENT",
            Errno::Exist => "EEXIST",
            Errno::NoExec => "ENOEXEC",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<vmm::MapError> for Errno {
    fn from(err: vmm::MapError) -> Self {
        match err {
            vmm::MapError::OutOfMemory => Errno::NoMem,
            vmm::MapError::AlreadyMapped | vmm::MapError::NotMapped => Errno::Inval,
        }
    }
}
