//! Open-file descriptors.

use alloc::sync::Arc;

use super::Vnode;

/// A descriptor referencing an open vnode.
///
/// Handles are cursorless: positional I/O carries its own offset, so the only
/// per-open state is the node reference itself. Cloning yields an independent
/// handle to the same node, which is how descriptor tables are duplicated
/// across fork.
#[derive(Clone)]
pub struct FileHandle {
    node: Arc<Vnode>,
}

impl FileHandle {
    /// Creates a handle referencing `node`.
    pub fn new(node: Arc<Vnode>) -> Self {
        Self { node }
    }

    /// Returns the referenced node.
    pub fn node(&self) -> &Arc<Vnode> {
        &self.node
    }

    /// Returns whether `self` and `other` reference the same node.
    pub fn shares_node(&self, other: &FileHandle) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::FileNode;

    #[test]
    fn clones_reference_the_same_node() {
        let handle = FileHandle::new(Arc::new(Vnode::File(FileNode::empty(0o644))));
        let clone = handle.clone();
        assert!(handle.shares_node(&clone));

        // A write through one handle is visible through the other.
        handle.node().write(b"shared", 0).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(clone.node().read(&mut buf, 0), 6);
        assert_eq!(&buf, b"shared");
    }

    #[test]
    fn distinct_nodes_are_not_shared() {
        let a = FileHandle::new(Arc::new(Vnode::File(FileNode::empty(0o644))));
        let b = FileHandle::new(Arc::new(Vnode::File(FileNode::empty(0o644))));
        assert!(!a.shares_node(&b));
    }
}
