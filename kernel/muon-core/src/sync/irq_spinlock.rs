//! Interrupt-safe spin lock.
//!
//! Disables interrupts before acquiring the inner spinlock and restores the
//! previous interrupt state on release. Required for any data shared between
//! interrupt handlers and normal kernel code: the ready queue, the task
//! table, and the console all live behind this lock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Saves RFLAGS and disables interrupts, returning the saved flags.
///
/// On hosted targets (tests) interrupt state does not exist; this is a no-op.
#[inline]
fn save_flags_and_cli() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let flags = crate::arch::x86_64::rflags::read_raw();
        crate::arch::x86_64::interrupts::disable();
        flags
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

/// Restores a previously saved RFLAGS value (interrupt flag included).
#[inline]
fn restore_flags(flags: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // SAFETY: `flags` was read from RFLAGS by `save_flags_and_cli`;
        // restoring it only re-enables interrupts if they were enabled.
        unsafe { crate::arch::x86_64::rflags::write_raw(flags) };
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = flags;
    }
}

/// A spin lock that disables interrupts while held.
///
/// The guard restores the interrupt flag to its pre-acquisition state on
/// drop, so nesting under an already-disabled section keeps interrupts off.
/// Not recursive: re-acquiring on the same CPU deadlocks.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: Atomic operations ensure exclusive access to the data.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts first.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let saved_flags = save_flags_and_cli();

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqSpinLockGuard {
                    lock: self,
                    saved_flags,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock; restores the interrupt flag on failure.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let saved_flags = save_flags_and_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard {
                lock: self,
                saved_flags,
            })
        } else {
            restore_flags(saved_flags);
            None
        }
    }
}

/// RAII guard for [`IrqSpinLock`]; restores the interrupt flag on drop.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    saved_flags: u64,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_flags(self.saved_flags);
    }
}
