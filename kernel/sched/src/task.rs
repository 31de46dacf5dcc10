//! The task control block.
//!
//! Tasks are shared as `Arc<Task>` between the task table, the run queue,
//! and the current-task slot, so every mutable field uses atomics or a lock.
//! The saved-context slot holds the task's kernel RSP while it is switched
//! out; the context-switch assembly reads and writes it through a raw
//! pointer.

use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use alloc::boxed::Box;
use alloc::vec;

use muon_core::addr::VirtAddr;
use muon_core::paging::PhysFrame;
use muon_core::sync::SpinLock;
use muon_mm::AddressSpace;

/// Process identifier.
pub type Pid = u32;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Eligible for selection.
    Ready = 0,
    /// Currently on the CPU. At most one task at a time.
    Running = 1,
    /// Waiting for a wake: sleep deadline, child exit, or input.
    Blocked = 2,
    /// Finished; absorbing until the parent reaps it.
    Terminated = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Blocked,
            _ => Self::Terminated,
        }
    }
}

/// Whether a task runs entirely in ring 0 or enters ring 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Kernel thread; runs on the master address space.
    Kernel,
    /// User process; owns a private address space and a user stack page.
    User,
}

/// An owned kernel stack.
///
/// Only mutated while the owning task is off-CPU (or by the task itself),
/// so plain heap memory behind the `Arc<Task>` is enough.
pub struct KernelStack {
    buf: Box<[u8]>,
}

impl KernelStack {
    /// Allocates a zeroed kernel stack of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Lowest address of the stack.
    pub fn bottom(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    /// Stack top, aligned down to 16 bytes. This is the RSP loaded on
    /// ring-3 → ring-0 transitions.
    pub fn top(&self) -> u64 {
        (self.bottom() + self.buf.len() as u64) & !0xF
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if the stack has zero length.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Raw view of the stack bytes, for fork's stack copy.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Raw mutable pointer to the stack base.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.buf.as_ptr() as *mut u8
    }
}

/// The physical page backing a task's user stack and where it is mapped.
#[derive(Debug, Clone, Copy)]
pub struct UserStack {
    /// Owned backing frame, HHDM-reachable for fork's copy.
    pub frame: PhysFrame,
    /// Virtual base of the mapping in the task's address space.
    pub virt_base: VirtAddr,
    /// Size in bytes (one page today).
    pub size: usize,
}

impl UserStack {
    /// Initial user RSP: the stack top, 16-byte aligned.
    pub fn initial_rsp(&self) -> u64 {
        (self.virt_base.as_u64() + self.size as u64) & !0xF
    }
}

/// A schedulable task.
pub struct Task {
    /// Process id, unique for the kernel's lifetime.
    pub pid: Pid,
    /// Parent process id (0 for kernel-spawned tasks).
    pub parent: Pid,
    /// Kernel thread or user process.
    pub kind: TaskKind,
    /// Lifecycle state.
    state: AtomicU8,
    /// Saved kernel RSP while switched out. The context-switch assembly
    /// stores the outgoing RSP here and loads the incoming one.
    pub context: AtomicU64,
    /// Owned kernel stack.
    pub kernel_stack: KernelStack,
    /// Private address space (user tasks). Swapped by exec.
    pub space: SpinLock<Option<AddressSpace>>,
    /// User stack record (user tasks).
    pub user_stack: SpinLock<Option<UserStack>>,
    /// Entry point, consumed by the first-run trampoline.
    pub entry: AtomicU64,
    /// Tick at which a sleeping task becomes eligible; 0 = not sleeping.
    pub wake_tick: AtomicU64,
    /// Exit code delivered to the reaping parent.
    pub exit_code: AtomicI64,
    /// Pid of the child this task is blocked waiting on; 0 = none.
    pub wait_target: AtomicU32,
}

impl Task {
    /// Creates a task in the `Ready` state.
    pub fn new(pid: Pid, parent: Pid, kind: TaskKind, kernel_stack: KernelStack) -> Self {
        Self {
            pid,
            parent,
            kind,
            state: AtomicU8::new(TaskState::Ready as u8),
            context: AtomicU64::new(0),
            kernel_stack,
            space: SpinLock::new(None),
            user_stack: SpinLock::new(None),
            entry: AtomicU64::new(0),
            wake_tick: AtomicU64::new(0),
            exit_code: AtomicI64::new(0),
            wait_target: AtomicU32::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sets the lifecycle state.
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Raw pointer to the saved-context slot, for the switch assembly.
    pub fn context_slot(&self) -> *mut u64 {
        &self.context as *const AtomicU64 as *mut u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_ready() {
        let task = Task::new(1, 0, TaskKind::Kernel, KernelStack::new(4096));
        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(task.wake_tick.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn state_transitions() {
        let task = Task::new(2, 1, TaskKind::User, KernelStack::new(4096));
        task.set_state(TaskState::Running);
        assert_eq!(task.state(), TaskState::Running);
        task.set_state(TaskState::Terminated);
        assert_eq!(task.state(), TaskState::Terminated);
    }

    #[test]
    fn kernel_stack_top_is_aligned() {
        let stack = KernelStack::new(16 * 1024);
        assert_eq!(stack.top() % 16, 0);
        assert!(stack.top() > stack.bottom());
        assert_eq!(stack.len(), 16 * 1024);
    }

    #[test]
    fn user_stack_rsp_is_aligned() {
        let stack = UserStack {
            frame: PhysFrame::containing_address(muon_core::addr::PhysAddr::new(0x1000)),
            virt_base: VirtAddr::new(0x7FFF_FFEF_F000),
            size: 4096,
        };
        assert_eq!(stack.initial_rsp() % 16, 0);
        assert_eq!(stack.initial_rsp(), 0x7FFF_FFF0_0000);
    }
}
