//! The in-memory directory node.

use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use spin::Mutex;

use crate::errno::Errno;

use super::{FileHandle, Vnode, S_IFDIR};

/// An in-memory directory: a name-to-node list under a mutex.
///
/// Directories only exist to give the boot modules names and to back the root
/// and working-directory handles every process carries.
#[derive(Debug)]
pub struct DirectoryNode {
    mode: u32,
    entries: Mutex<Vec<(String, Arc<Vnode>)>>,
}

impl DirectoryNode {
    /// Creates an empty directory.
    pub fn new(mode: u32) -> Self {
        Self {
            mode: S_IFDIR | mode,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Returns the node's mode bits.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Adds `node` to the directory under `name`.
    ///
    /// Fails with `EEXIST` if the name is already taken.
    pub fn link(&self, name: &str, node: Arc<Vnode>) -> Result<(), Errno> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|(existing, _)| existing == name) {
            return Err(Errno::Exist);
        }
        entries.push((name.to_string(), node));
        Ok(())
    }

    /// Looks up the child with the given name.
    ///
    /// Fails with `ENOENT` if no such child exists.
    pub fn lookup(&self, name: &str) -> Result<Arc<Vnode>, Errno> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, node)| node.clone())
            .ok_or(Errno::NoEnt)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns whether the directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Returns a handle to the root directory, creating it on first use.
pub fn root_handle() -> FileHandle {
    static ROOT: spin::Once<Arc<Vnode>> = spin::Once::new();
    let node = ROOT.call_once(|| Arc::new(Vnode::Directory(DirectoryNode::new(0o755))));
    FileHandle::new(node.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::FileNode;

    #[test]
    fn link_and_lookup() {
        let dir = DirectoryNode::new(0o755);
        let node = Arc::new(Vnode::File(FileNode::new(b"data", 0o644)));

        dir.link("init", node.clone()).unwrap();
        let found = dir.lookup("init").unwrap();
        assert!(Arc::ptr_eq(&found, &node));
    }

    #[test]
    fn lookup_missing_is_enoent() {
        let dir = DirectoryNode::new(0o755);
        assert_eq!(dir.lookup("nope").unwrap_err(), Errno::NoEnt);
    }

    #[test]
    fn duplicate_link_is_eexist() {
        let dir = DirectoryNode::new(0o755);
        let node = Arc::new(Vnode::File(FileNode::empty(0o644)));

        dir.link("a", node.clone()).unwrap();
        assert_eq!(dir.link("a", node).unwrap_err(), Errno::Exist);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn directory_rejects_positional_io() {
        let dir = Vnode::Directory(DirectoryNode::new(0o755));
        assert_eq!(dir.write(b"x", 0), Err(Errno::Inval));
        let mut buf = [0u8; 1];
        assert_eq!(dir.read(&mut buf, 0), 0);
    }
}
