//! In-memory filesystem.
//!
//! The root filesystem: file contents live in heap vectors hung off the
//! node payload. Sparse writes zero-fill the gap, truncate both shrinks and
//! grows, and node removal frees the data with the node.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::FsError;
use crate::node::{NodeKind, NodeOps, Vfs, VfsNode};

/// Payload attached to ramfs file nodes.
struct RamFile {
    data: Vec<u8>,
}

/// The ramfs operation table. One instance serves every node.
pub struct RamFsOps;

/// Attaches ramfs semantics to the tree root, making it the root
/// filesystem.
pub fn mount_root(vfs: &Vfs) {
    vfs.root().set_ops(Arc::new(RamFsOps));
}

/// Runs `f` over the node's backing vector, creating it on first use.
fn with_data<R>(node: &VfsNode, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    node.with_payload(|payload| {
        if payload.is_none() {
            *payload = Some(Box::new(RamFile { data: Vec::new() }));
        }
        let file = payload
            .as_mut()
            .and_then(|p| p.downcast_mut::<RamFile>())
            .expect("ramfs node payload is not a RamFile");
        f(&mut file.data)
    })
}

impl NodeOps for RamFsOps {
    fn read(&self, node: &VfsNode, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        with_data(node, |data| {
            if offset >= data.len() {
                return Ok(0);
            }
            let available = &data[offset..];
            let count = buf.len().min(available.len());
            buf[..count].copy_from_slice(&available[..count]);
            Ok(count)
        })
    }

    fn write(&self, node: &VfsNode, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        with_data(node, |data| {
            let end = offset.checked_add(buf.len()).ok_or(FsError::NoSpace)?;
            if end > data.len() {
                data.resize(end, 0);
            }
            data[offset..end].copy_from_slice(buf);
            node.set_size(data.len());
            Ok(buf.len())
        })
    }

    fn create(
        &self,
        parent: &Arc<VfsNode>,
        name: &str,
        kind: NodeKind,
    ) -> Result<Arc<VfsNode>, FsError> {
        let node = VfsNode::new(name, kind, Some(Arc::new(RamFsOps)));
        parent.link_child(&node);
        Ok(node)
    }

    fn unlink(&self, _node: &VfsNode) -> Result<(), FsError> {
        // Data lives in the payload; it drops with the node.
        Ok(())
    }

    fn truncate(&self, node: &VfsNode, size: usize) -> Result<(), FsError> {
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        with_data(node, |data| {
            data.resize(size, 0);
            node.set_size(size);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Vfs {
        let vfs = Vfs::new();
        mount_root(&vfs);
        vfs
    }

    fn ops_of(node: &Arc<VfsNode>) -> Arc<dyn NodeOps> {
        node.ops().expect("ramfs node must have ops")
    }

    #[test]
    fn write_read_roundtrip() {
        let vfs = tree();
        let node = vfs.create("/f", NodeKind::File).unwrap();
        let ops = ops_of(&node);

        assert_eq!(ops.write(&node, b"payload", 0).unwrap(), 7);
        assert_eq!(node.size(), 7);

        let mut buf = [0u8; 16];
        assert_eq!(ops.read(&node, &mut buf, 0).unwrap(), 7);
        assert_eq!(&buf[..7], b"payload");
    }

    #[test]
    fn read_past_end_returns_zero() {
        let vfs = tree();
        let node = vfs.create("/f", NodeKind::File).unwrap();
        let ops = ops_of(&node);
        ops.write(&node, b"ab", 0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(ops.read(&node, &mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let vfs = tree();
        let node = vfs.create("/sparse", NodeKind::File).unwrap();
        let ops = ops_of(&node);
        ops.write(&node, b"tail", 8).unwrap();
        assert_eq!(node.size(), 12);

        let mut buf = [0xFFu8; 12];
        ops.read(&node, &mut buf, 0).unwrap();
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(&buf[8..], b"tail");
    }

    #[test]
    fn overwrite_keeps_size() {
        let vfs = tree();
        let node = vfs.create("/f", NodeKind::File).unwrap();
        let ops = ops_of(&node);
        ops.write(&node, b"123456", 0).unwrap();
        ops.write(&node, b"ab", 2).unwrap();
        assert_eq!(node.size(), 6);

        let mut buf = [0u8; 6];
        ops.read(&node, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"12ab56");
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let vfs = tree();
        let node = vfs.create("/t", NodeKind::File).unwrap();
        let ops = ops_of(&node);
        ops.write(&node, b"0123456789", 0).unwrap();

        ops.truncate(&node, 4).unwrap();
        assert_eq!(node.size(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(ops.read(&node, &mut buf, 0).unwrap(), 4);
        assert_eq!(&buf[..4], b"0123");

        ops.truncate(&node, 8).unwrap();
        assert_eq!(node.size(), 8);
        assert_eq!(ops.read(&node, &mut buf, 0).unwrap(), 8);
        assert_eq!(&buf[..8], b"0123\0\0\0\0");
    }

    #[test]
    fn directory_io_is_refused() {
        let vfs = tree();
        let dir = vfs.create("/d", NodeKind::Directory).unwrap();
        let ops = ops_of(&dir);
        assert!(matches!(
            ops.read(&dir, &mut [0u8; 1], 0),
            Err(FsError::IsADirectory)
        ));
        assert!(matches!(
            ops.write(&dir, b"x", 0),
            Err(FsError::IsADirectory)
        ));
    }

    #[test]
    fn nested_directories_create_files() {
        let vfs = tree();
        vfs.create("/a", NodeKind::Directory).unwrap();
        vfs.create("/a/b", NodeKind::Directory).unwrap();
        let node = vfs.create("/a/b/deep.txt", NodeKind::File).unwrap();
        let ops = ops_of(&node);
        ops.write(&node, b"deep", 0).unwrap();
        assert_eq!(vfs.lookup("/a/b/deep.txt").unwrap().size(), 4);
    }
}
