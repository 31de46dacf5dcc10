//! Filesystem syscalls.

use muon_fs::{NodeKind, OpenFlags, SeekWhence};

use super::userptr::{read_user_cstr, UserSlice};
use crate::fs;

/// `open(path, flags)`: returns the descriptor or -1.
pub fn sys_open(path_ptr: u64, flags: u64) -> i64 {
    let Some(path) = read_user_cstr(path_ptr) else {
        return -1;
    };
    let flags = OpenFlags::from_bits_truncate(flags as u32);
    match fs::with_vfs_and_fds(|vfs, fds| fds.open(vfs, &path, flags)) {
        Ok(fd) => fd as i64,
        Err(_) => -1,
    }
}

/// `close(fd)`.
pub fn sys_close(fd: u64) -> i64 {
    match fs::with_fds(|fds| fds.close(fd as i32)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// `seek(fd, offset, whence)`: returns the new cursor or -1.
pub fn sys_seek(fd: u64, offset: i64, whence: u64) -> i64 {
    let Some(whence) = SeekWhence::from_raw(whence as u32) else {
        return -1;
    };
    match fs::with_fds(|fds| fds.seek(fd as i32, offset, whence)) {
        Ok(position) => position,
        Err(_) => -1,
    }
}

/// `mkdir(path)`.
pub fn sys_mkdir(path_ptr: u64) -> i64 {
    let Some(path) = read_user_cstr(path_ptr) else {
        return -1;
    };
    match fs::with_vfs(|vfs| vfs.create(&path, NodeKind::Directory)) {
        Ok(_) => 0,
        Err(_) => -1,
    }
}

/// `readdir(fd, buf, size)`: copies the next child name, NUL-terminated.
/// Returns 1 while entries remain, 0 at the end, -1 on error.
pub fn sys_readdir(fd: u64, buf: u64, size: u64) -> i64 {
    if size == 0 {
        return -1;
    }
    let Some(slice) = UserSlice::new(buf, size) else {
        return -1;
    };

    let name = match fs::with_fds(|fds| fds.readdir(fd as i32)) {
        Ok(Some(name)) => name,
        Ok(None) => return 0,
        Err(_) => return -1,
    };

    // SAFETY: Validated user range, written under the caller's CR3.
    let out = unsafe { slice.as_mut_slice() };
    let count = name.len().min(out.len() - 1);
    out[..count].copy_from_slice(&name.as_bytes()[..count]);
    out[count] = 0;
    1
}

/// `unlink(path, recursive)`.
pub fn sys_unlink(path_ptr: u64, recursive: u64) -> i64 {
    let Some(path) = read_user_cstr(path_ptr) else {
        return -1;
    };
    match fs::with_vfs(|vfs| vfs.unlink(&path, recursive != 0)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}
