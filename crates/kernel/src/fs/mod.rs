//! In-memory filesystem nodes.
//!
//! The kernel has no on-disk filesystem; files exist only as in-memory blobs
//! supplied at boot, plus the terminal stream and the directories that name
//! them. Nodes are shared through `Arc` and referenced by the cursorless
//! [`FileHandle`] descriptors held in process descriptor tables.

pub mod directory;
pub mod file;
pub mod terminal;

mod handle;

pub use handle::FileHandle;

use crate::errno::Errno;
use directory::DirectoryNode;
use file::FileNode;
use terminal::Terminal;

/// Regular file type bits.
pub const S_IFREG: u32 = 0o100000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040000;
/// Character device type bits.
pub const S_IFCHR: u32 = 0o020000;

/// A filesystem node.
///
/// The node kinds are a closed set, so capability dispatch is a tagged enum
/// rather than a trait object.
#[derive(Debug)]
pub enum Vnode {
    File(FileNode),
    Directory(DirectoryNode),
    Terminal(Terminal),
}

impl Vnode {
    /// Reads up to `buffer.len()` bytes at `offset`. Returns the number of
    /// bytes read; reads past the end of the node return 0.
    pub fn read(&self, buffer: &mut [u8], offset: i64) -> usize {
        match self {
            Vnode::File(file) => file.read(buffer, offset),
            Vnode::Directory(_) => 0,
            Vnode::Terminal(terminal) => terminal.read(buffer, offset),
        }
    }

    /// Writes `buffer` at `offset`. Returns the number of bytes written.
    pub fn write(&self, buffer: &[u8], offset: i64) -> Result<usize, Errno> {
        match self {
            Vnode::File(file) => file.write(buffer, offset),
            Vnode::Directory(_) => Err(Errno::Inval),
            Vnode::Terminal(terminal) => terminal.write(buffer, offset),
        }
    }

    /// Returns whether positional I/O on this node is meaningful.
    pub fn is_seekable(&self) -> bool {
        match self {
            Vnode::File(file) => file.is_seekable(),
            Vnode::Directory(_) => true,
            Vnode::Terminal(terminal) => terminal.is_seekable(),
        }
    }

    /// Returns the node's mode bits, including the file type.
    pub fn mode(&self) -> u32 {
        match self {
            Vnode::File(file) => file.mode(),
            Vnode::Directory(dir) => dir.mode(),
            Vnode::Terminal(terminal) => terminal.mode(),
        }
    }
}
