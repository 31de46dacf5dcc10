//! File descriptors and the descriptor table.
//!
//! A fixed array of 256 slots; descriptors 0-2 are reserved for the console
//! and never handed out by `open`. Read and write delegate to the node's
//! op table at the descriptor's cursor and advance it by the returned
//! count.

use alloc::string::String;
use alloc::sync::Arc;

use bitflags::bitflags;

use crate::error::FsError;
use crate::node::{NodeKind, Vfs, VfsNode};

/// Number of descriptor slots.
pub const MAX_FDS: usize = 256;

/// First slot handed out by `open`; 0-2 are stdin/stdout/stderr.
const FIRST_USER_FD: usize = 3;

bitflags! {
    /// Open flags. The low two bits are the access mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for writing only.
        const WRITE_ONLY = 0x0001;
        /// Open for reading and writing.
        const READ_WRITE = 0x0002;
        /// Create the file if it does not exist.
        const CREATE     = 0x0040;
        /// Truncate to zero length on open.
        const TRUNCATE   = 0x0200;
        /// Position the cursor at the end on open; writes go to the end.
        const APPEND     = 0x0400;
    }
}

impl OpenFlags {
    /// Whether reads are permitted (everything except write-only).
    #[must_use]
    pub fn readable(self) -> bool {
        !self.contains(Self::WRITE_ONLY) || self.contains(Self::READ_WRITE)
    }

    /// Whether writes are permitted.
    #[must_use]
    pub fn writable(self) -> bool {
        self.intersects(Self::WRITE_ONLY | Self::READ_WRITE)
    }
}

/// Cursor positioning origins for `seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SeekWhence {
    /// Absolute offset.
    Set = 0,
    /// Relative to the current cursor.
    Current = 1,
    /// Relative to the file size.
    End = 2,
}

impl SeekWhence {
    /// Decodes the ABI value.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Set),
            1 => Some(Self::Current),
            2 => Some(Self::End),
            _ => None,
        }
    }
}

/// An open file description.
pub struct FileDescriptor {
    /// The node this descriptor refers to.
    pub node: Arc<VfsNode>,
    /// Open flags.
    pub flags: OpenFlags,
    /// Byte cursor (directory entry index for `readdir`).
    pub offset: usize,
}

/// The descriptor table.
pub struct FdTable {
    slots: [Option<FileDescriptor>; MAX_FDS],
}

impl FdTable {
    /// Creates a table with every slot free (0-2 stay reserved).
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_FDS],
        }
    }

    fn slot(&self, fd: i32) -> Result<&FileDescriptor, FsError> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.slots.get(i))
            .and_then(Option::as_ref)
            .ok_or(FsError::BadDescriptor)
    }

    fn slot_mut(&mut self, fd: i32) -> Result<&mut FileDescriptor, FsError> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::as_mut)
            .ok_or(FsError::BadDescriptor)
    }

    /// Installs a descriptor at a fixed slot (console wiring for 0-2).
    pub fn install(&mut self, fd: usize, node: Arc<VfsNode>, flags: OpenFlags) {
        if fd < MAX_FDS {
            self.slots[fd] = Some(FileDescriptor {
                node,
                flags,
                offset: 0,
            });
        }
    }

    /// Opens `target`, resolving (and optionally creating) it, and returns
    /// the descriptor number.
    ///
    /// Directories may not be opened for writing. `TRUNCATE` resizes the
    /// file to zero through the backend; `APPEND` starts the cursor at the
    /// current size.
    pub fn open(&mut self, vfs: &Vfs, target: &str, flags: OpenFlags) -> Result<i32, FsError> {
        let node = match vfs.lookup(target) {
            Ok(node) => node,
            Err(FsError::NotFound) if flags.contains(OpenFlags::CREATE) => {
                vfs.create(target, NodeKind::File)?
            }
            Err(e) => return Err(e),
        };

        if node.is_dir() && flags.writable() {
            return Err(FsError::IsADirectory);
        }

        if flags.contains(OpenFlags::TRUNCATE) && !node.is_dir() {
            if let Some(ops) = node.ops() {
                match ops.truncate(&node, 0) {
                    Ok(()) | Err(FsError::NotSupported) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let free = (FIRST_USER_FD..MAX_FDS)
            .find(|&i| self.slots[i].is_none())
            .ok_or(FsError::NoSpace)?;

        let offset = if flags.contains(OpenFlags::APPEND) {
            node.size()
        } else {
            0
        };
        self.slots[free] = Some(FileDescriptor {
            node,
            flags,
            offset,
        });
        Ok(free as i32)
    }

    /// Closes a descriptor.
    pub fn close(&mut self, fd: i32) -> Result<(), FsError> {
        let index = usize::try_from(fd).map_err(|_| FsError::BadDescriptor)?;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(FsError::BadDescriptor)?;
        if slot.is_none() {
            return Err(FsError::BadDescriptor);
        }
        *slot = None;
        Ok(())
    }

    /// Reads from the descriptor's node at its cursor, advancing it.
    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize, FsError> {
        let desc = self.slot_mut(fd)?;
        if desc.node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if !desc.flags.readable() {
            return Err(FsError::AccessDenied);
        }
        let ops = desc.node.ops().ok_or(FsError::NotSupported)?;
        let count = ops.read(&desc.node, buf, desc.offset)?;
        desc.offset += count;
        Ok(count)
    }

    /// Writes to the descriptor's node at its cursor, advancing it.
    /// `APPEND` descriptors re-seek to the size first.
    pub fn write(&mut self, fd: i32, buf: &[u8]) -> Result<usize, FsError> {
        let desc = self.slot_mut(fd)?;
        if desc.node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if !desc.flags.writable() {
            return Err(FsError::AccessDenied);
        }
        if desc.flags.contains(OpenFlags::APPEND) {
            desc.offset = desc.node.size();
        }
        let ops = desc.node.ops().ok_or(FsError::NotSupported)?;
        let count = ops.write(&desc.node, buf, desc.offset)?;
        desc.offset += count;
        Ok(count)
    }

    /// Repositions the cursor. Negative absolute positions are refused.
    pub fn seek(&mut self, fd: i32, offset: i64, whence: SeekWhence) -> Result<i64, FsError> {
        let desc = self.slot_mut(fd)?;
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Current => desc.offset as i64,
            SeekWhence::End => desc.node.size() as i64,
        };
        let target = base.checked_add(offset).ok_or(FsError::InvalidArgument)?;
        if target < 0 {
            return Err(FsError::InvalidArgument);
        }
        desc.offset = target as usize;
        Ok(target)
    }

    /// Returns the next child name of an open directory, advancing the
    /// cursor; `None` at the end.
    pub fn readdir(&mut self, fd: i32) -> Result<Option<String>, FsError> {
        let desc = self.slot_mut(fd)?;
        if !desc.node.is_dir() {
            return Err(FsError::NotADirectory);
        }
        match desc.node.child_name_at(desc.offset) {
            Some(name) => {
                desc.offset += 1;
                Ok(Some(name))
            }
            None => Ok(None),
        }
    }

    /// Shared access for the syscall layer.
    pub fn get(&self, fd: i32) -> Result<&FileDescriptor, FsError> {
        self.slot(fd)
    }

    /// Mutable access for the syscall layer's two-phase I/O (snapshot the
    /// descriptor, run the backend unlocked, then advance the cursor).
    pub fn get_mut(&mut self, fd: i32) -> Result<&mut FileDescriptor, FsError> {
        self.slot_mut(fd)
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs;

    fn fresh() -> (Vfs, FdTable) {
        let vfs = Vfs::new();
        ramfs::mount_root(&vfs);
        (vfs, FdTable::new())
    }

    #[test]
    fn open_skips_reserved_descriptors() {
        let (vfs, mut fds) = fresh();
        vfs.create("/f", NodeKind::File).unwrap();
        let fd = fds.open(&vfs, "/f", OpenFlags::READ_WRITE).unwrap();
        assert_eq!(fd, 3);
    }

    #[test]
    fn open_missing_without_create_fails() {
        let (vfs, mut fds) = fresh();
        assert!(matches!(
            fds.open(&vfs, "/missing", OpenFlags::empty()),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn open_create_makes_the_file() {
        let (vfs, mut fds) = fresh();
        let fd = fds
            .open(&vfs, "/new.txt", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        assert!(fd >= 3);
        assert!(vfs.lookup("/new.txt").is_ok());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (vfs, mut fds) = fresh();
        let fd = fds
            .open(&vfs, "/data", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        assert_eq!(fds.write(fd, b"hello, world\n").unwrap(), 13);
        fds.seek(fd, 0, SeekWhence::Set).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(fds.read(fd, &mut buf).unwrap(), 13);
        assert_eq!(&buf[..13], b"hello, world\n");
    }

    #[test]
    fn cursor_advances_on_io() {
        let (vfs, mut fds) = fresh();
        let fd = fds
            .open(&vfs, "/c", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        fds.write(fd, b"abcdef").unwrap();
        fds.seek(fd, 0, SeekWhence::Set).unwrap();
        let mut half = [0u8; 3];
        fds.read(fd, &mut half).unwrap();
        assert_eq!(&half, b"abc");
        fds.read(fd, &mut half).unwrap();
        assert_eq!(&half, b"def");
    }

    #[test]
    fn directories_refuse_write_open() {
        let (vfs, mut fds) = fresh();
        vfs.create("/d", NodeKind::Directory).unwrap();
        assert!(matches!(
            fds.open(&vfs, "/d", OpenFlags::WRITE_ONLY),
            Err(FsError::IsADirectory)
        ));
        // Read-only open of a directory is fine (readdir needs it).
        assert!(fds.open(&vfs, "/d", OpenFlags::empty()).is_ok());
    }

    #[test]
    fn write_on_readonly_fd_denied() {
        let (vfs, mut fds) = fresh();
        let fd = fds
            .open(&vfs, "/ro", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        fds.write(fd, b"x").unwrap();
        fds.close(fd).unwrap();

        let fd = fds.open(&vfs, "/ro", OpenFlags::empty()).unwrap();
        assert!(matches!(fds.write(fd, b"y"), Err(FsError::AccessDenied)));
    }

    #[test]
    fn truncate_clears_content() {
        let (vfs, mut fds) = fresh();
        let fd = fds
            .open(&vfs, "/t", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        fds.write(fd, b"old contents").unwrap();
        fds.close(fd).unwrap();

        let fd = fds
            .open(&vfs, "/t", OpenFlags::READ_WRITE | OpenFlags::TRUNCATE)
            .unwrap();
        let node = vfs.lookup("/t").unwrap();
        assert_eq!(node.size(), 0);
        let mut buf = [0u8; 8];
        assert_eq!(fds.read(fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn append_positions_at_end() {
        let (vfs, mut fds) = fresh();
        let fd = fds
            .open(&vfs, "/log", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        fds.write(fd, b"one").unwrap();
        fds.close(fd).unwrap();

        let fd = fds
            .open(&vfs, "/log", OpenFlags::READ_WRITE | OpenFlags::APPEND)
            .unwrap();
        fds.write(fd, b"two").unwrap();

        fds.seek(fd, 0, SeekWhence::Set).unwrap();
        let mut buf = [0u8; 16];
        let n = fds.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"onetwo");
    }

    #[test]
    fn seek_variants() {
        let (vfs, mut fds) = fresh();
        let fd = fds
            .open(&vfs, "/s", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        fds.write(fd, b"0123456789").unwrap();

        assert_eq!(fds.seek(fd, 4, SeekWhence::Set).unwrap(), 4);
        assert_eq!(fds.seek(fd, 2, SeekWhence::Current).unwrap(), 6);
        assert_eq!(fds.seek(fd, -3, SeekWhence::End).unwrap(), 7);
        assert!(matches!(
            fds.seek(fd, -1, SeekWhence::Set),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn readdir_walks_children_once() {
        let (vfs, mut fds) = fresh();
        vfs.create("/d", NodeKind::Directory).unwrap();
        vfs.create("/d/a", NodeKind::File).unwrap();
        vfs.create("/d/b", NodeKind::File).unwrap();

        let fd = fds.open(&vfs, "/d", OpenFlags::empty()).unwrap();
        assert_eq!(fds.readdir(fd).unwrap().as_deref(), Some("a"));
        assert_eq!(fds.readdir(fd).unwrap().as_deref(), Some("b"));
        assert_eq!(fds.readdir(fd).unwrap(), None);
    }

    #[test]
    fn close_releases_the_slot() {
        let (vfs, mut fds) = fresh();
        let fd = fds
            .open(&vfs, "/f", OpenFlags::CREATE | OpenFlags::READ_WRITE)
            .unwrap();
        fds.close(fd).unwrap();
        assert!(matches!(fds.read(fd, &mut [0u8; 1]), Err(FsError::BadDescriptor)));
        // The slot is reused by the next open.
        let again = fds
            .open(&vfs, "/f", OpenFlags::READ_WRITE)
            .unwrap();
        assert_eq!(again, fd);
    }

    #[test]
    fn bad_descriptors_rejected() {
        let (_vfs, mut fds) = fresh();
        assert!(matches!(fds.close(-1), Err(FsError::BadDescriptor)));
        assert!(matches!(fds.close(9999), Err(FsError::BadDescriptor)));
        assert!(matches!(
            fds.read(42, &mut [0u8; 1]),
            Err(FsError::BadDescriptor)
        ));
    }
}
