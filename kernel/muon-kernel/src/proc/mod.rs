//! Process management: the task table, the current-task slot, task
//! creation (kernel threads, user processes, fork), and lifecycle
//! transitions (exit, wait, block, sleep).

pub mod exec;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use muon_core::addr::VirtAddr;
use muon_core::arch::x86_64::interrupts;
use muon_core::paging::{PageTableFlags, PhysFrame, PAGE_SIZE};
use muon_core::sync::IrqSpinLock;
use muon_core::{kdebug, kerr, kinfo};
use muon_mm::{AddressSpace, FrameSource};
use muon_sched::{KernelStack, Pid, Task, TaskKind, TaskState, UserStack};

use crate::arch::x86_64::context::{
    fork_child_return, jump_to_userspace, seed_initial_stack, SEED_SLOTS,
};
use crate::arch::x86_64::syscall::SYSCALL_FRAME_RSP;
use crate::mm::{pmm, vmm};
use crate::{fs, sched, time};

/// Top of the user stack mapping.
pub const USER_STACK_TOP: u64 = 0x7FFF_FFF0_0000;

/// User stack size: one page.
pub const USER_STACK_SIZE: usize = PAGE_SIZE;

/// Kernel stack size for user tasks.
const USER_TASK_KSTACK: usize = 16 * 1024;

/// Kernel stack size for kernel threads.
const KERNEL_TASK_KSTACK: usize = 16 * 1024;

/// All live tasks, keyed by pid. Tasks leave the table when reaped.
static TASKS: IrqSpinLock<BTreeMap<Pid, Arc<Task>>> = IrqSpinLock::new(BTreeMap::new());

/// The task currently on the CPU.
static CURRENT: IrqSpinLock<Option<Arc<Task>>> = IrqSpinLock::new(None);

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// The running task.
///
/// # Panics
///
/// Panics outside task context (early boot).
pub fn current() -> Arc<Task> {
    try_current().expect("no current task")
}

/// The running task, or `None` during early boot.
pub fn try_current() -> Option<Arc<Task>> {
    CURRENT.lock().clone()
}

/// Installs the running task. Scheduler use only.
pub(crate) fn set_current(task: Arc<Task>) {
    *CURRENT.lock() = Some(task);
}

/// Looks up a task by pid.
pub fn lookup(pid: Pid) -> Option<Arc<Task>> {
    TASKS.lock().get(&pid).cloned()
}

fn register(task: &Arc<Task>) {
    TASKS.lock().insert(task.pid, task.clone());
    sched::enqueue(task.clone());
}

// ── Trampolines ──────────────────────────────────────────────────────

/// First-resume target for kernel threads: run the entry function, then
/// exit.
unsafe extern "C" fn kernel_task_entry() -> ! {
    // The switch ran with interrupts off; a fresh task starts with them on.
    // SAFETY: IDT and PIC are live by the time any task runs.
    unsafe { interrupts::enable() };

    let task = current();
    let entry = task.entry.load(Ordering::Acquire);
    drop(task);
    // SAFETY: `entry` was stored from a `fn()` at spawn.
    let f: fn() = unsafe { core::mem::transmute(entry as usize) };
    f();

    exit_current(0);
}

/// First-resume target for user processes: drop to ring 3 at the stored
/// entry point with the prepared user stack.
unsafe extern "C" fn user_task_entry() -> ! {
    let task = current();
    let entry = task.entry.load(Ordering::Acquire);
    let user_rsp = task
        .user_stack
        .lock()
        .as_ref()
        .expect("user task without a user stack")
        .initial_rsp();
    // This frame is abandoned by the ring-3 jump; release the reference.
    drop(task);
    // TSS.RSP0 and the syscall stack variable were set by the switch.
    // SAFETY: The task's address space maps `entry` and the stack page
    // user-accessible; CR3 was installed by the switch.
    unsafe { jump_to_userspace(entry, user_rsp) }
}

// ── Task creation ────────────────────────────────────────────────────

/// Spawns a kernel thread running `entry`.
pub fn spawn_kernel(entry: fn()) -> Arc<Task> {
    let task = Arc::new(Task::new(
        alloc_pid(),
        0,
        TaskKind::Kernel,
        KernelStack::new(KERNEL_TASK_KSTACK),
    ));
    task.entry.store(entry as usize as u64, Ordering::Release);
    // SAFETY: The stack was just allocated with room for the seed frame.
    let ctx = unsafe { seed_initial_stack(task.kernel_stack.top(), kernel_task_entry) };
    task.context.store(ctx, Ordering::Release);
    register(&task);
    kdebug!("spawned kernel task {}", task.pid);
    task
}

/// Spawns the first user process from an ELF in the VFS.
///
/// Builds a fresh address space, loads the image, allocates and maps the
/// user stack page, and queues the task.
pub fn spawn_user_elf(path: &str) -> Result<Arc<Task>, ()> {
    let image = fs::read_file(path).map_err(|_| {
        kerr!("spawn: cannot read {path}");
    })?;

    let frames = pmm::frames();
    let mapper = vmm::mapper();

    // SAFETY: The kernel master root is live.
    let space = unsafe { AddressSpace::new_user(&mapper, frames, vmm::kernel_root()) }
        .ok_or_else(|| kerr!("spawn: out of frames for the address space"))?;

    let entry = match exec::load_image(&space, &image) {
        Ok(entry) => entry,
        Err(()) => {
            // SAFETY: The space was never installed in CR3.
            unsafe { space.destroy(&mapper, frames) };
            return Err(());
        }
    };

    let Some(stack_frame) = frames.request_page() else {
        kerr!("spawn: out of frames for the user stack");
        // SAFETY: As above.
        unsafe { space.destroy(&mapper, frames) };
        return Err(());
    };
    let stack = UserStack {
        frame: stack_frame,
        virt_base: VirtAddr::new(USER_STACK_TOP - USER_STACK_SIZE as u64),
        size: USER_STACK_SIZE,
    };
    // SAFETY: Fresh frame, HHDM-reachable; the mapping target is unused in
    // a fresh space.
    unsafe {
        ptr::write_bytes(mapper.phys_to_virt(stack_frame.start_address()), 0, PAGE_SIZE);
        if mapper
            .map_4k(
                space.root_phys(),
                stack.virt_base,
                stack_frame.start_address(),
                user_page_flags(),
                frames,
            )
            .is_err()
        {
            frames.unref_frame(stack_frame);
            space.destroy(&mapper, frames);
            kerr!("spawn: out of frames mapping the user stack");
            return Err(());
        }
    }

    let task = Arc::new(Task::new(
        alloc_pid(),
        0,
        TaskKind::User,
        KernelStack::new(USER_TASK_KSTACK),
    ));
    task.entry.store(entry, Ordering::Release);
    *task.space.lock() = Some(space);
    *task.user_stack.lock() = Some(stack);
    // SAFETY: Fresh kernel stack with room for the seed frame.
    let ctx = unsafe { seed_initial_stack(task.kernel_stack.top(), user_task_entry) };
    task.context.store(ctx, Ordering::Release);

    register(&task);
    kinfo!("spawned user task {} from {path} (entry {entry:#x})", task.pid);
    Ok(task)
}

/// User leaf mapping flags.
fn user_page_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER
}

// ── Fork ─────────────────────────────────────────────────────────────

/// Duplicates the calling task.
///
/// Clones the address space copy-on-write, copies the kernel stack and
/// seeds the child to resume out of the current syscall frame with a zero
/// return value, and gives the child a private copy of the user stack page
/// mapped at the same address. Returns the child pid, or -1 on exhaustion.
pub fn fork() -> i64 {
    let parent = current();
    let frames = pmm::frames();
    let mapper = vmm::mapper();

    // Copy-on-write clone. This write-protects the parent's own leaves, so
    // its TLB must be flushed before it touches user memory again.
    let parent_space = parent.space.lock();
    let Some(parent_root) = parent_space.as_ref() else {
        kerr!("fork: task {} has no address space", parent.pid);
        return -1;
    };
    // SAFETY: Single CPU, interrupts masked in syscall context; nothing
    // else mutates the space.
    let Some(child_space) = (unsafe { parent_root.clone_cow(&mapper, frames) }) else {
        kerr!("fork: out of frames cloning the address space");
        return -1;
    };
    drop(parent_space);
    muon_core::arch::x86_64::tlb::flush_all();

    // Child kernel stack: byte-for-byte copy of the parent's, so the copied
    // syscall frame is valid at the same relative offset.
    let child_stack = KernelStack::new(parent.kernel_stack.len());
    // SAFETY: Both stacks are live heap allocations of equal length.
    unsafe {
        ptr::copy_nonoverlapping(
            parent.kernel_stack.as_slice().as_ptr(),
            child_stack.as_mut_ptr(),
            parent.kernel_stack.len(),
        );
    }

    // Locate the syscall frame in the copy and seed the resume thunk
    // directly below it.
    let frame_offset =
        SYSCALL_FRAME_RSP.load(Ordering::Acquire) - parent.kernel_stack.bottom();
    let child_frame_rsp = child_stack.bottom() + frame_offset;
    let child_ctx = child_frame_rsp - (SEED_SLOTS * 8) as u64;
    // SAFETY: The frame offset lies well inside the copied stack.
    unsafe {
        let slots = child_ctx as *mut u64;
        for i in 0..6 {
            slots.add(i).write(0);
        }
        slots.add(6).write(fork_child_return as usize as u64);
    }

    // Private copy of the user stack page, replacing the COW-shared leaf
    // the clone produced.
    let parent_stack = *parent.user_stack.lock();
    let Some(parent_stack) = parent_stack else {
        kerr!("fork: task {} has no user stack", parent.pid);
        // SAFETY: Never installed in CR3.
        unsafe { child_space.destroy(&mapper, frames) };
        return -1;
    };
    let Some(stack_frame) = frames.request_page() else {
        kerr!("fork: out of frames for the child user stack");
        // SAFETY: Never installed in CR3.
        unsafe { child_space.destroy(&mapper, frames) };
        return -1;
    };
    // SAFETY: Both frames are HHDM-reachable; the clone holds a leaf for
    // the stack page which is unreferenced before being replaced.
    unsafe {
        ptr::copy_nonoverlapping(
            mapper.phys_to_virt(parent_stack.frame.start_address()),
            mapper.phys_to_virt(stack_frame.start_address()),
            PAGE_SIZE,
        );
        if let Some(pte) = mapper.pte_of(child_space.root_phys(), parent_stack.virt_base) {
            if pte.is_present() {
                frames.unref_frame(PhysFrame::containing_address(pte.address()));
            }
        }
        if mapper
            .map_4k(
                child_space.root_phys(),
                parent_stack.virt_base,
                stack_frame.start_address(),
                user_page_flags(),
                frames,
            )
            .is_err()
        {
            frames.unref_frame(stack_frame);
            child_space.destroy(&mapper, frames);
            kerr!("fork: out of frames mapping the child user stack");
            return -1;
        }
    }

    let child = Arc::new(Task::new(
        alloc_pid(),
        parent.pid,
        TaskKind::User,
        child_stack,
    ));
    child
        .entry
        .store(parent.entry.load(Ordering::Acquire), Ordering::Release);
    *child.space.lock() = Some(child_space);
    *child.user_stack.lock() = Some(UserStack {
        frame: stack_frame,
        ..parent_stack
    });
    child.context.store(child_ctx, Ordering::Release);

    let pid = child.pid;
    register(&child);
    kdebug!("fork: task {} -> child {}", parent.pid, pid);
    pid as i64
}

// ── Lifecycle ────────────────────────────────────────────────────────

/// Terminates the calling task with `code` and reschedules. Never returns.
///
/// A parent blocked in [`waitpid`] on this task is woken.
pub fn exit_current(code: i64) -> ! {
    interrupts::disable();
    let task = current();
    task.exit_code.store(code, Ordering::Release);
    task.set_state(TaskState::Terminated);
    kdebug!("task {} exited with {}", task.pid, code);

    if let Some(parent) = lookup(task.parent) {
        if parent.wait_target.load(Ordering::Acquire) == task.pid {
            unblock(&parent);
        }
    }

    drop(task);
    sched::schedule();

    // A terminated task is never selected again; reaching this point means
    // the scheduler state is corrupt.
    kerr!("exit: terminated task resumed");
    loop {
        // SAFETY: Nothing left to do but wait for the reset button.
        unsafe { interrupts::enable_and_hlt() };
    }
}

/// Blocks until the child `pid` terminates and returns its exit code.
/// Returns -1 for an unknown pid or a task that is not our child. The
/// child is fully reaped: removed from the table and queue, its address
/// space torn down.
pub fn waitpid(pid: Pid) -> i64 {
    let me = current();
    loop {
        let Some(child) = lookup(pid) else {
            return -1;
        };
        if child.parent != me.pid {
            return -1;
        }
        if child.state() == TaskState::Terminated {
            let code = child.exit_code.load(Ordering::Acquire);
            reap(&child);
            return code;
        }

        // Interrupts are masked here (syscall context), so the child
        // cannot exit between this check and the block: the wake from
        // `exit_current` always finds us already blocked.
        me.wait_target.store(pid, Ordering::Release);
        me.set_state(TaskState::Blocked);
        sched::schedule();
        me.wait_target.store(0, Ordering::Release);
    }
}

/// Removes a terminated task from the table and queue and frees its
/// address space (which drops the last references on its frames).
fn reap(child: &Arc<Task>) {
    if let Some(space) = child.space.lock().take() {
        // SAFETY: The child is terminated; its root is not in CR3.
        unsafe { space.destroy(&vmm::mapper(), pmm::frames()) };
    }
    TASKS.lock().remove(&child.pid);
    sched::remove_task(child.pid);
    kdebug!("reaped task {}", child.pid);
}

/// Yields the CPU, staying ready.
pub fn yield_now() {
    sched::schedule();
}

/// Blocks the calling task until [`unblock`].
pub fn block_current() {
    current().set_state(TaskState::Blocked);
    sched::schedule();
}

/// Makes a blocked task ready again and clears any sleep deadline.
pub fn unblock(task: &Arc<Task>) {
    if task.state() == TaskState::Blocked {
        task.wake_tick.store(0, Ordering::Release);
        task.set_state(TaskState::Ready);
    }
}

/// Sleeps for at least `ms` milliseconds (timer-period resolution).
pub fn sleep_ms(ms: u64) {
    if ms == 0 {
        return;
    }
    let task = current();
    task.wake_tick
        .store(time::ticks() + time::ms_to_ticks(ms), Ordering::Release);
    task.set_state(TaskState::Blocked);
    sched::schedule();
}
