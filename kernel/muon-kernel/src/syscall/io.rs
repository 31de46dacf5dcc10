//! Read and write syscalls.
//!
//! Descriptors 1 and 2 short-circuit to the console output sink and 0 to
//! the blocking keyboard line reader. Other descriptors go two-phase:
//! snapshot the descriptor under the table lock, run the backend with the
//! lock released (console-backed descriptors block for input), then
//! re-take the lock to advance the cursor. Holding the table lock across a
//! blocking read would wedge every other task's filesystem syscalls.

use alloc::sync::Arc;

use muon_fs::{FsError, VfsNode};

use super::userptr::UserSlice;
use crate::{console, fs, log};

/// Descriptor snapshot for phase two.
struct IoTarget {
    node: Arc<VfsNode>,
    offset: usize,
}

fn snapshot(fd: i32, for_write: bool) -> Result<IoTarget, FsError> {
    fs::with_fds(|fds| {
        let desc = fds.get(fd)?;
        if desc.node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let allowed = if for_write {
            desc.flags.writable()
        } else {
            desc.flags.readable()
        };
        if !allowed {
            return Err(FsError::AccessDenied);
        }
        let offset = if for_write && desc.flags.contains(muon_fs::OpenFlags::APPEND) {
            desc.node.size()
        } else {
            desc.offset
        };
        Ok(IoTarget {
            node: desc.node.clone(),
            offset,
        })
    })
}

fn advance(fd: i32, count: usize) {
    fs::with_fds(|fds| {
        if let Ok(desc) = fds.get_mut(fd) {
            desc.offset += count;
        }
    });
}

/// `write(fd, buf, len)`: returns the byte count or -1.
pub fn sys_write(fd: u64, buf: u64, len: u64) -> i64 {
    let Some(slice) = UserSlice::new(buf, len) else {
        return -1;
    };
    // SAFETY: Validated user range, read under the caller's CR3.
    let bytes = unsafe { slice.as_slice() };

    if fd == 1 || fd == 2 {
        log::console_write(bytes);
        return bytes.len() as i64;
    }

    let Ok(target) = snapshot(fd as i32, true) else {
        return -1;
    };
    let Some(ops) = target.node.ops() else {
        return -1;
    };
    match ops.write(&target.node, bytes, target.offset) {
        Ok(count) => {
            advance(fd as i32, count);
            count as i64
        }
        Err(_) => -1,
    }
}

/// `read(fd, buf, len)`: returns the byte count or -1. Descriptor 0
/// blocks until a full line (or a full buffer) of keyboard input.
pub fn sys_read(fd: u64, buf: u64, len: u64) -> i64 {
    let Some(slice) = UserSlice::new(buf, len) else {
        return -1;
    };
    // SAFETY: Validated user range, written under the caller's CR3.
    let bytes = unsafe { slice.as_mut_slice() };

    if fd == 0 {
        return console::read_blocking(bytes) as i64;
    }

    let Ok(target) = snapshot(fd as i32, false) else {
        return -1;
    };
    let Some(ops) = target.node.ops() else {
        return -1;
    };
    match ops.read(&target.node, bytes, target.offset) {
        Ok(count) => {
            advance(fd as i32, count);
            count as i64
        }
        Err(_) => -1,
    }
}
