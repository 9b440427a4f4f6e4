//! The terminal stream node.

use alloc::sync::Arc;

use crate::console::Console;
use crate::errno::Errno;

use super::{FileHandle, Vnode, S_IFCHR};

/// The boot terminal.
///
/// Writes go straight to the kernel console; there is no input path, so reads
/// return 0. Every process gets this node as descriptors 0, 1 and 2.
#[derive(Debug)]
pub struct Terminal;

impl Terminal {
    pub fn read(&self, _buffer: &mut [u8], _offset: i64) -> usize {
        0
    }

    pub fn write(&self, buffer: &[u8], _offset: i64) -> Result<usize, Errno> {
        Console::default().write_bytes(buffer);
        Ok(buffer.len())
    }

    pub fn is_seekable(&self) -> bool {
        false
    }

    pub fn mode(&self) -> u32 {
        S_IFCHR | 0o666
    }
}

/// Returns a handle to the terminal, creating the node on first use.
pub fn handle() -> FileHandle {
    static TERMINAL: spin::Once<Arc<Vnode>> = spin::Once::new();
    let node = TERMINAL.call_once(|| Arc::new(Vnode::Terminal(Terminal)));
    FileHandle::new(node.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_swallows_writes_and_has_no_input() {
        let terminal = Terminal;
        assert_eq!(terminal.write(b"boot message", 0), Ok(12));

        let mut buf = [0u8; 4];
        assert_eq!(terminal.read(&mut buf, 0), 0);
        assert!(!terminal.is_seekable());
    }

    #[test]
    fn handles_share_the_node() {
        let first = handle();
        let second = handle();
        assert!(first.shares_node(&second));
    }
}
