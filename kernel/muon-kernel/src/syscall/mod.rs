//! Syscall dispatch.
//!
//! The assembly entry stub calls [`syscall_dispatch`] with the number and
//! three raw arguments. Pointer arguments are validated against the user
//! half of the address space before any access; every failure folds to -1.

mod io;
mod process;
pub mod userptr;
mod vfs;

use muon_core::kwarn;

use crate::syscall_abi::*;

/// Central dispatch table, called from the SYSCALL entry stub.
#[unsafe(no_mangle)]
extern "C" fn syscall_dispatch(nr: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    match nr {
        SYS_EXIT => process::sys_exit(a1 as i64),
        SYS_WRITE => io::sys_write(a1, a2, a3),
        SYS_READ => io::sys_read(a1, a2, a3),
        SYS_YIELD => process::sys_yield(),
        SYS_SLEEP => process::sys_sleep(a1),
        SYS_GETPID => process::sys_getpid(),
        SYS_EXEC => process::sys_exec(a1),
        SYS_FORK => process::sys_fork(),
        SYS_WAITPID => process::sys_waitpid(a1),
        SYS_OPEN => vfs::sys_open(a1, a2),
        SYS_CLOSE => vfs::sys_close(a1),
        SYS_SEEK => vfs::sys_seek(a1, a2 as i64, a3),
        SYS_MKDIR => vfs::sys_mkdir(a1),
        SYS_READDIR => vfs::sys_readdir(a1, a2, a3),
        SYS_UNLINK => vfs::sys_unlink(a1, a2),
        _ => {
            kwarn!("syscall: unknown number {nr}");
            -1
        }
    }
}
