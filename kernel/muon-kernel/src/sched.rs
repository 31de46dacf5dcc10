//! The scheduler: run-queue state, the selection loop, and the switch.
//!
//! Policy lives in `muon_sched::RunQueue` (insertion order, round-robin
//! from the slot after the current task, sleeper wakeup before selection).
//! This module owns the global queue, decides when to switch, and performs
//! the switch: TSS and syscall-stack update, CR3 install, and the
//! register-level swap.
//!
//! Locking: the queue lock is taken for selection only and released before
//! the switch; no lock is ever held across `context_switch`. Paths that
//! take both the scheduler lock and the task-table lock take the scheduler
//! lock first.

use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use muon_core::arch::x86_64::control::Cr3;
use muon_core::arch::x86_64::interrupts;
use muon_core::kinfo;
use muon_core::sync::IrqSpinLock;
use muon_sched::{Pid, RunQueue, Task, TaskState};

use crate::arch::x86_64::context::context_switch;
use crate::arch::x86_64::{gdt, syscall};
use crate::mm::vmm;
use crate::{proc, time};

struct Sched {
    queue: RunQueue,
    enabled: bool,
}

static SCHED: IrqSpinLock<Sched> = IrqSpinLock::new(Sched {
    queue: RunQueue::new(),
    enabled: false,
});

/// Adds a task to the rotation.
pub fn enqueue(task: Arc<Task>) {
    SCHED.lock().queue.insert(task);
}

/// Drops a reaped task from the rotation.
pub fn remove_task(pid: Pid) {
    SCHED.lock().queue.remove(pid);
}

/// Arms preemption. Until this, timer ticks only count time.
pub fn enable() {
    SCHED.lock().enabled = true;
    kinfo!("scheduler enabled");
}

/// Timer-tick entry: reschedule if armed.
pub fn tick() {
    schedule();
}

/// The scheduling decision.
///
/// Wakes due sleepers, picks the next ready task, and switches to it.
/// When nothing is runnable and the current task cannot continue, idles
/// with interrupts enabled until a wake arrives (the timer tick re-enters
/// here from its handler and switches directly).
pub fn schedule() {
    let was_enabled = interrupts::are_enabled();
    interrupts::disable();

    loop {
        let current = proc::try_current();
        let next = {
            let mut sched = SCHED.lock();
            if !sched.enabled {
                break;
            }
            sched.queue.wake_sleepers(time::ticks());
            sched.queue.pick_next(current.as_ref())
        };

        match next {
            Some(next) => {
                if current.as_ref().is_some_and(|c| c.pid == next.pid) {
                    // Only runnable task: keep the CPU. Re-promote in case
                    // a wake raced us back from Blocked to Ready.
                    next.set_state(TaskState::Running);
                    break;
                }
                switch_to(current, next);
                break; // We were resumed.
            }
            None => {
                if current.as_ref().is_some_and(|c| c.state() == TaskState::Running) {
                    break; // Nothing else runnable; continue the current task.
                }
                // Nothing runnable at all: wait for an interrupt to make
                // something ready (or to switch away from under us).
                // SAFETY: IDT and PIC are live once the scheduler runs.
                unsafe { interrupts::enable_and_hlt() };
                interrupts::disable();
            }
        }
    }

    if was_enabled {
        // SAFETY: Restoring the interrupt state from function entry.
        unsafe { interrupts::enable() };
    }
}

/// Switches to `next`.
///
/// Demotes a still-running predecessor to ready, promotes `next`, points
/// TSS.RSP0 and the syscall stack variable at its kernel stack, installs
/// its address-space root (the master root for kernel threads), and swaps
/// register state. Returns when the predecessor is eventually resumed.
fn switch_to(prev: Option<Arc<Task>>, next: Arc<Task>) {
    if let Some(prev_task) = &prev {
        if prev_task.state() == TaskState::Running {
            prev_task.set_state(TaskState::Ready);
        }
    }
    next.set_state(TaskState::Running);

    let stack_top = next.kernel_stack.top();
    // SAFETY: Interrupts are disabled (scheduler invariant).
    unsafe { gdt::set_tss_rsp0(stack_top) };
    syscall::set_kernel_stack(stack_top);

    let target_root = next
        .space
        .lock()
        .as_ref()
        .map_or_else(vmm::kernel_root, |space| space.root_phys());
    if Cr3::read() != target_root {
        // Order every prior memory write before the root switch.
        fence(Ordering::SeqCst);
        // SAFETY: Every root shares the kernel upper half.
        unsafe { Cr3::write(target_root) };
    }

    let old_slot = prev
        .as_ref()
        .map_or(ptr::null_mut(), |task| task.context_slot());
    let new_context = next.context.load(Ordering::Acquire);

    proc::set_current(next);

    // SAFETY: Interrupts are off, no locks are held, and `new_context` was
    // produced by a previous switch or by stack seeding.
    unsafe { context_switch(old_slot, new_context) };
    // Back on the old task's stack: it has been rescheduled.
}
