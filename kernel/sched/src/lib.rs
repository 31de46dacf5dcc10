//! Task structures and scheduling policy.
//!
//! The [`Task`] struct and the insertion-ordered [`RunQueue`] with its
//! round-robin selection live here as plain logic; the context-switch
//! assembly and the global scheduler state that drive them belong to the
//! kernel crate.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod queue;
pub mod task;

pub use queue::RunQueue;
pub use task::{KernelStack, Pid, Task, TaskKind, TaskState, UserStack};
