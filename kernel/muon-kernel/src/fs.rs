//! Kernel-side filesystem bring-up.
//!
//! Builds the global tree (ramfs root, `/dev`, the console node wired to
//! descriptors 0-2), registers block devices, probes partitions, and
//! mounts FAT32 volumes at `/mnt`.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use muon_core::sync::SpinLock;
use muon_core::{kerr, kinfo, kwarn};
use muon_fs::block::{BlockController, BlockNodeOps, NodeDevice, PartitionController};
use muon_fs::{fat, partition, ramfs};
use muon_fs::{FdTable, FsError, NodeKind, NodeOps, OpenFlags, Vfs, VfsNode};

use crate::{console, log};

static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);
static FDS: SpinLock<Option<FdTable>> = SpinLock::new(None);

/// Op table for `/dev/console`: reads block on keyboard lines, writes go
/// to the console sink.
struct ConsoleOps;

impl NodeOps for ConsoleOps {
    fn read(&self, _node: &VfsNode, buf: &mut [u8], _offset: usize) -> Result<usize, FsError> {
        Ok(console::read_blocking(buf))
    }

    fn write(&self, _node: &VfsNode, buf: &[u8], _offset: usize) -> Result<usize, FsError> {
        log::console_write(buf);
        Ok(buf.len())
    }
}

/// Builds the tree: ramfs root, `/dev`, `/dev/console`, descriptors 0-2.
///
/// # Panics
///
/// Panics if called twice.
pub fn init() {
    let vfs = Vfs::new();
    ramfs::mount_root(&vfs);

    vfs.create("/dev", NodeKind::Directory)
        .expect("fs: cannot create /dev");
    vfs.create("/bin", NodeKind::Directory)
        .expect("fs: cannot create /bin");

    let console_node = vfs
        .create("/dev/console", NodeKind::File)
        .expect("fs: cannot create /dev/console");
    console_node.set_ops(Arc::new(ConsoleOps));

    let mut fds = FdTable::new();
    fds.install(0, console_node.clone(), OpenFlags::empty());
    fds.install(1, console_node.clone(), OpenFlags::WRITE_ONLY);
    fds.install(2, console_node, OpenFlags::WRITE_ONLY);

    let mut vfs_slot = VFS.lock();
    assert!(vfs_slot.is_none(), "fs: double init");
    *vfs_slot = Some(vfs);
    *FDS.lock() = Some(fds);
    kinfo!("fs: ramfs root mounted, console wired");
}

/// Runs `f` with the global tree.
///
/// # Panics
///
/// Panics before [`init`].
pub fn with_vfs<R>(f: impl FnOnce(&Vfs) -> R) -> R {
    let vfs = VFS.lock();
    f(vfs.as_ref().expect("VFS not initialized"))
}

/// Runs `f` with the global descriptor table.
///
/// # Panics
///
/// Panics before [`init`].
pub fn with_fds<R>(f: impl FnOnce(&mut FdTable) -> R) -> R {
    let mut fds = FDS.lock();
    f(fds.as_mut().expect("descriptor table not initialized"))
}

/// Runs `f` with both the tree and the descriptor table.
pub fn with_vfs_and_fds<R>(f: impl FnOnce(&Vfs, &mut FdTable) -> R) -> R {
    let vfs = VFS.lock();
    let mut fds = FDS.lock();
    f(
        vfs.as_ref().expect("VFS not initialized"),
        fds.as_mut().expect("descriptor table not initialized"),
    )
}

/// Reads a whole file into a vector.
pub fn read_file(path: &str) -> Result<Vec<u8>, FsError> {
    with_vfs(|vfs| {
        let node = vfs.lookup(path)?;
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let ops = node.ops().ok_or(FsError::NotSupported)?;
        let mut data = vec![0u8; node.size()];
        let mut done = 0;
        while done < data.len() {
            let count = ops.read(&node, &mut data[done..], done)?;
            if count == 0 {
                break;
            }
            done += count;
        }
        data.truncate(done);
        Ok(data)
    })
}

/// Writes a byte buffer to a fresh file.
pub fn write_file(path: &str, data: &[u8]) -> Result<(), FsError> {
    with_vfs(|vfs| {
        let node = match vfs.lookup(path) {
            Ok(node) => node,
            Err(FsError::NotFound) => vfs.create(path, NodeKind::File)?,
            Err(e) => return Err(e),
        };
        let ops = node.ops().ok_or(FsError::NotSupported)?;
        let mut done = 0;
        while done < data.len() {
            let count = ops.write(&node, &data[done..], done)?;
            if count == 0 {
                return Err(FsError::NoSpace);
            }
            done += count;
        }
        Ok(())
    })
}

/// Registers a block controller as `/dev/<name>`, probes its partition
/// table, and tries to mount the first FAT32 volume found at `/mnt`.
/// An unpartitioned disk is tried whole.
pub fn register_disk(name: &str, controller: Arc<dyn BlockController>) {
    let capacity = controller.block_count() * controller.block_size() as u64;

    let node = with_vfs(|vfs| {
        let path = alloc::format!("/dev/{name}");
        vfs.create(&path, NodeKind::File)
    });
    let node = match node {
        Ok(node) => node,
        Err(e) => {
            kerr!("fs: cannot create /dev/{name}: {e}");
            return;
        }
    };
    node.set_ops(Arc::new(BlockNodeOps::new(controller.clone())));
    node.set_size(capacity as usize);
    kinfo!("fs: /dev/{name}: {} KiB", capacity / 1024);

    // Candidate extents: each partition, then the whole disk as fallback.
    let mut candidates: Vec<Arc<dyn BlockController>> = Vec::new();
    match partition::probe(controller.as_ref()) {
        Ok(parts) => {
            for part in &parts {
                candidates.push(Arc::new(PartitionController::new(
                    controller.clone(),
                    part.start_lba,
                    part.block_count,
                )));
            }
        }
        Err(_) => kwarn!("fs: /dev/{name}: no partition table"),
    }
    candidates.push(controller);

    for candidate in candidates {
        let device_node = VfsNode::new("volume", NodeKind::File, None);
        let capacity = candidate.block_count() * candidate.block_size() as u64;
        device_node.set_ops(Arc::new(BlockNodeOps::new(candidate)));
        device_node.set_size(capacity as usize);

        let device = NodeDevice::new(device_node, capacity);
        let mounted = with_vfs(|vfs| fat::mount(vfs, "/mnt", device));
        match mounted {
            Ok(_volume) => {
                kinfo!("fs: FAT32 volume mounted at /mnt");
                return;
            }
            Err(FsError::InvalidArgument) => continue,
            Err(e) => {
                kwarn!("fs: mount attempt failed: {e}");
                continue;
            }
        }
    }
    kwarn!("fs: /dev/{name}: no mountable FAT32 volume");
}
