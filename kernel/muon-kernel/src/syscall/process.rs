//! Process syscalls.

use super::userptr::read_user_cstr;
use crate::proc;

/// `exit(code)`: never returns to the caller.
pub fn sys_exit(code: i64) -> i64 {
    proc::exit_current(code);
}

/// `yield`: reschedule, stay ready.
pub fn sys_yield() -> i64 {
    proc::yield_now();
    0
}

/// `sleep(ms)`: block until the wake tick.
pub fn sys_sleep(ms: u64) -> i64 {
    proc::sleep_ms(ms);
    0
}

/// `getpid`.
pub fn sys_getpid() -> i64 {
    proc::current().pid as i64
}

/// `exec(path)`: on success control re-enters ring 3 inside the new
/// image and this call never returns.
pub fn sys_exec(path_ptr: u64) -> i64 {
    let Some(path) = read_user_cstr(path_ptr) else {
        return -1;
    };
    proc::exec::exec(&path)
}

/// `fork`: child pid to the parent; the child resumes with 0 in RAX.
pub fn sys_fork() -> i64 {
    proc::fork()
}

/// `waitpid(pid)`: block until the child exits, return its code.
pub fn sys_waitpid(pid: u64) -> i64 {
    proc::waitpid(pid as u32)
}
