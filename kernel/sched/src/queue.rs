//! Insertion-ordered run queue with round-robin selection.
//!
//! The queue holds every non-terminated task. Selection starts just after
//! the current task and walks the list with wraparound until it finds a
//! `Ready` task; a still-`Running` current task is selected again when
//! nothing else is runnable. Sleepers whose deadline has passed are made
//! ready before each selection.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::task::{Pid, Task, TaskState};

/// The scheduler's run queue.
///
/// Owned container indexed by position; insertion order is preserved, which
/// gives the round-robin its rotation order.
pub struct RunQueue {
    tasks: Vec<Arc<Task>>,
}

impl RunQueue {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Appends a task to the rotation.
    pub fn insert(&mut self, task: Arc<Task>) {
        self.tasks.push(task);
    }

    /// Removes a task (on reap). No-op if absent.
    pub fn remove(&mut self, pid: Pid) {
        self.tasks.retain(|t| t.pid != pid);
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` when no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Looks a task up by pid.
    pub fn get(&self, pid: Pid) -> Option<&Arc<Task>> {
        self.tasks.iter().find(|t| t.pid == pid)
    }

    /// Moves every blocked task whose wake tick has arrived back to `Ready`
    /// and clears its deadline.
    pub fn wake_sleepers(&mut self, now_tick: u64) {
        for task in &self.tasks {
            if task.state() != TaskState::Blocked {
                continue;
            }
            let deadline = task.wake_tick.load(Ordering::Acquire);
            if deadline != 0 && now_tick >= deadline {
                task.wake_tick.store(0, Ordering::Release);
                task.set_state(TaskState::Ready);
            }
        }
    }

    /// Round-robin selection.
    ///
    /// Starts at the slot after `current` (or the head when `current` is
    /// `None` or gone) and returns the first `Ready` task, wrapping once
    /// around the list. The current task itself is a valid candidate while
    /// it is still `Running`, which is how a lone runnable task keeps the
    /// CPU. Returns `None` when nothing is runnable.
    pub fn pick_next(&self, current: Option<&Arc<Task>>) -> Option<Arc<Task>> {
        if self.tasks.is_empty() {
            return None;
        }

        let start = match current {
            Some(task) => self
                .tasks
                .iter()
                .position(|t| t.pid == task.pid)
                .map_or(0, |i| i + 1),
            None => 0,
        };

        for offset in 0..self.tasks.len() {
            let candidate = &self.tasks[(start + offset) % self.tasks.len()];
            match candidate.state() {
                TaskState::Ready => return Some(candidate.clone()),
                TaskState::Running
                    if current.is_some_and(|c| c.pid == candidate.pid) =>
                {
                    return Some(candidate.clone());
                }
                _ => {}
            }
        }

        None
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{KernelStack, TaskKind};
    use std::collections::HashMap;

    fn task(pid: Pid) -> Arc<Task> {
        Arc::new(Task::new(pid, 0, TaskKind::Kernel, KernelStack::new(256)))
    }

    /// Mimics the context-switch state transitions around a selection.
    fn tick(queue: &mut RunQueue, now: u64, current: &mut Option<Arc<Task>>) {
        queue.wake_sleepers(now);
        let next = queue.pick_next(current.as_ref());
        if let Some(next) = next {
            if let Some(old) = current.as_ref() {
                if old.pid != next.pid && old.state() == TaskState::Running {
                    old.set_state(TaskState::Ready);
                }
            }
            next.set_state(TaskState::Running);
            *current = Some(next);
        }
    }

    #[test]
    fn rotation_follows_insertion_order() {
        let mut queue = RunQueue::new();
        for pid in 1..=3 {
            queue.insert(task(pid));
        }
        let mut current = None;
        let mut order = Vec::new();
        for now in 0..6 {
            tick(&mut queue, now, &mut current);
            order.push(current.as_ref().unwrap().pid);
        }
        assert_eq!(order, [1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn lone_running_task_keeps_cpu() {
        let mut queue = RunQueue::new();
        queue.insert(task(7));
        let mut current = None;
        tick(&mut queue, 0, &mut current);
        tick(&mut queue, 1, &mut current);
        assert_eq!(current.as_ref().unwrap().pid, 7);
        assert_eq!(current.as_ref().unwrap().state(), TaskState::Running);
    }

    #[test]
    fn blocked_tasks_are_skipped() {
        let mut queue = RunQueue::new();
        let a = task(1);
        let b = task(2);
        queue.insert(a.clone());
        queue.insert(b.clone());
        a.set_state(TaskState::Blocked);

        let mut current = None;
        for now in 0..4 {
            tick(&mut queue, now, &mut current);
            assert_eq!(current.as_ref().unwrap().pid, 2);
        }
    }

    #[test]
    fn nothing_runnable_selects_none() {
        let mut queue = RunQueue::new();
        let a = task(1);
        queue.insert(a.clone());
        a.set_state(TaskState::Blocked);
        assert!(queue.pick_next(None).is_none());
    }

    #[test]
    fn sleeper_wakes_exactly_on_deadline() {
        let mut queue = RunQueue::new();
        let sleeper = task(1);
        let spinner = task(2);
        queue.insert(sleeper.clone());
        queue.insert(spinner.clone());

        sleeper.wake_tick.store(10, Ordering::Release);
        sleeper.set_state(TaskState::Blocked);

        let mut current = None;
        for now in 0..10 {
            tick(&mut queue, now, &mut current);
            assert_eq!(
                current.as_ref().unwrap().pid,
                2,
                "sleeper selected before its wake tick (now={now})"
            );
        }
        // On the deadline tick the sleeper becomes eligible again.
        tick(&mut queue, 10, &mut current);
        assert_eq!(current.as_ref().unwrap().pid, 1);
        assert_eq!(sleeper.wake_tick.load(Ordering::Acquire), 0);
    }

    #[test]
    fn weak_fairness_over_a_window() {
        // With R ready tasks and no blocking, every task runs at least
        // floor(K/R) - 1 times over K consecutive selections.
        let mut queue = RunQueue::new();
        const R: usize = 4;
        const K: usize = 29;
        for pid in 1..=R as Pid {
            queue.insert(task(pid));
        }

        let mut current = None;
        let mut runs: HashMap<Pid, usize> = HashMap::new();
        for now in 0..K {
            tick(&mut queue, now as u64, &mut current);
            *runs.entry(current.as_ref().unwrap().pid).or_default() += 1;
        }
        for pid in 1..=R as Pid {
            assert!(
                runs.get(&pid).copied().unwrap_or(0) >= K / R - 1,
                "task {pid} starved: {runs:?}"
            );
        }
    }

    #[test]
    fn removal_drops_task_from_rotation() {
        let mut queue = RunQueue::new();
        for pid in 1..=3 {
            queue.insert(task(pid));
        }
        queue.remove(2);
        assert_eq!(queue.len(), 2);
        assert!(queue.get(2).is_none());

        let mut current = None;
        let mut order = Vec::new();
        for now in 0..4 {
            tick(&mut queue, now, &mut current);
            order.push(current.as_ref().unwrap().pid);
        }
        assert_eq!(order, [1, 3, 1, 3]);
    }
}
