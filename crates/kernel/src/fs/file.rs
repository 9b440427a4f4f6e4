//! The in-memory regular file node.

use alloc::vec::Vec;

use spin::Mutex;

use crate::errno::Errno;

use super::S_IFREG;

/// An in-memory regular file.
///
/// The backing store is a byte vector guarded by a mutex; its length is the
/// file size. Reads are clamped at end-of-file, writes grow the store exactly
/// to the end of the written range and never shrink it. Boot module images
/// and everything user processes create at runtime live in nodes of this
/// kind.
#[derive(Debug)]
pub struct FileNode {
    mode: u32,
    data: Mutex<Vec<u8>>,
}

impl FileNode {
    /// Creates a file node holding a copy of `data`.
    pub fn new(data: &[u8], mode: u32) -> Self {
        Self {
            mode: S_IFREG | mode,
            data: Mutex::new(data.to_vec()),
        }
    }

    /// Creates an empty file node.
    pub fn empty(mode: u32) -> Self {
        Self {
            mode: S_IFREG | mode,
            data: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current file size in bytes.
    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    /// Returns the node's mode bits.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn is_seekable(&self) -> bool {
        true
    }

    /// Reads up to `buffer.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes copied: reads are clamped at the end of
    /// the file, and a read at or past the end returns 0.
    pub fn read(&self, buffer: &mut [u8], offset: i64) -> usize {
        let Ok(offset) = usize::try_from(offset) else {
            return 0;
        };

        let data = self.data.lock();
        let available = data.len().saturating_sub(offset);
        let count = buffer.len().min(available);
        if count > 0 {
            buffer[..count].copy_from_slice(&data[offset..offset + count]);
        }
        count
    }

    /// Writes `buffer` at `offset`, growing the file if the written range
    /// ends past the current size. Bytes in any gap between the old end and
    /// `offset` read back as zero.
    ///
    /// Fails with `EINVAL` for a negative offset and with `ENOSPC` if the end
    /// of the written range does not fit the offset type or the store cannot
    /// be grown.
    pub fn write(&self, buffer: &[u8], offset: i64) -> Result<usize, Errno> {
        if offset < 0 {
            return Err(Errno::Inval);
        }
        let offset = offset as u64;

        let end = offset
            .checked_add(buffer.len() as u64)
            .filter(|&end| end <= i64::MAX as u64)
            .ok_or(Errno::NoSpc)?;
        let end = usize::try_from(end).map_err(|_| Errno::NoSpc)?;

        let mut data = self.data.lock();
        if end > data.len() {
            let grow_by = end - data.len();
            data.try_reserve_exact(grow_by).map_err(|_| Errno::NoSpc)?;
            data.resize(end, 0);
        }

        let offset = offset as usize;
        data[offset..end].copy_from_slice(buffer);
        Ok(buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_returns_initial_contents() {
        let node = FileNode::new(b"hello world", 0o644);
        let mut buf = [0u8; 5];
        assert_eq!(node.read(&mut buf, 6), 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn read_clamps_at_end_of_file() {
        let node = FileNode::new(b"abc", 0o644);
        let mut buf = [0u8; 8];
        assert_eq!(node.read(&mut buf, 1), 2);
        assert_eq!(&buf[..2], b"bc");
    }

    #[test]
    fn read_past_end_returns_zero() {
        let node = FileNode::new(b"abc", 0o644);
        let mut buf = [0u8; 4];
        assert_eq!(node.read(&mut buf, 3), 0);
        assert_eq!(node.read(&mut buf, 100), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let node = FileNode::empty(0o644);
        assert_eq!(node.write(b"payload", 2), Ok(7));

        let mut buf = [0u8; 7];
        assert_eq!(node.read(&mut buf, 2), 7);
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn write_past_end_grows_with_zero_gap() {
        let node = FileNode::empty(0o644);
        assert_eq!(node.write(b"abc", 5), Ok(3));
        assert_eq!(node.size(), 8);

        let mut buf = [0xFFu8; 10];
        assert_eq!(node.read(&mut buf, 0), 8);
        assert_eq!(&buf[..8], b"\0\0\0\0\0abc");
    }

    #[test]
    fn non_overlapping_writes_concatenate() {
        let node = FileNode::empty(0o644);
        node.write(b"cc", 4).unwrap();
        node.write(b"aa", 0).unwrap();

        let mut buf = [0u8; 6];
        assert_eq!(node.read(&mut buf, 0), 6);
        assert_eq!(&buf, b"aa\0\0cc");
    }

    #[test]
    fn write_within_file_does_not_shrink() {
        let node = FileNode::new(b"0123456789", 0o644);
        assert_eq!(node.write(b"xy", 3), Ok(2));
        assert_eq!(node.size(), 10);

        let mut buf = [0u8; 10];
        node.read(&mut buf, 0);
        assert_eq!(&buf, b"012xy56789");
    }

    #[test]
    fn write_negative_offset_is_invalid() {
        let node = FileNode::empty(0o644);
        assert_eq!(node.write(b"abc", -1), Err(Errno::Inval));
        assert_eq!(node.size(), 0);
    }

    #[test]
    fn write_offset_overflow_is_enospc() {
        let node = FileNode::new(b"intact", 0o644);
        assert_eq!(node.write(b"abcd", i64::MAX - 2), Err(Errno::NoSpc));

        // No observable state change.
        assert_eq!(node.size(), 6);
        let mut buf = [0u8; 6];
        node.read(&mut buf, 0);
        assert_eq!(&buf, b"intact");
    }

    #[test]
    fn mode_includes_regular_file_type() {
        let node = FileNode::new(b"", 0o755);
        assert_eq!(node.mode(), S_IFREG | 0o755);
        assert!(node.is_seekable());
    }
}
