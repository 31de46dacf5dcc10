//! User pointer validation.
//!
//! Syscall pointer arguments are user virtual addresses. Validation checks
//! the range lies below the canonical user/kernel boundary and does not
//! overflow; the access itself then happens under the caller's CR3, where
//! the range is either mapped or faults against the calling task only.

use alloc::string::String;

/// Exclusive upper bound of user-half addresses.
const USER_ADDR_MAX: u64 = 0x0000_8000_0000_0000;

/// Longest accepted user string (path) in bytes.
const MAX_USER_STR: usize = 4096;

/// A validated user byte range.
#[derive(Debug, Clone, Copy)]
pub struct UserSlice {
    addr: u64,
    len: usize,
}

impl UserSlice {
    /// Validates `[addr, addr + len)` as a user-half range.
    pub fn new(addr: u64, len: u64) -> Option<Self> {
        let len_usize = usize::try_from(len).ok()?;
        let end = addr.checked_add(len)?;
        if end > USER_ADDR_MAX {
            return None;
        }
        Some(Self {
            addr,
            len: len_usize,
        })
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for an empty range.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrows the range as a byte slice.
    ///
    /// # Safety
    ///
    /// The range must be mapped readable in the current address space and
    /// not concurrently mutated (single CPU, syscall context).
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: Caller contract.
        unsafe { core::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    /// Borrows the range as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The range must be mapped writable in the current address space and
    /// not otherwise aliased.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: Caller contract.
        unsafe { core::slice::from_raw_parts_mut(self.addr as *mut u8, self.len) }
    }
}

/// Copies a NUL-terminated user string into a kernel `String`.
///
/// Returns `None` for kernel-half pointers, unterminated or over-long
/// strings, and invalid UTF-8.
pub fn read_user_cstr(addr: u64) -> Option<String> {
    if addr == 0 || addr >= USER_ADDR_MAX {
        return None;
    }

    let mut bytes = alloc::vec::Vec::new();
    for offset in 0..MAX_USER_STR as u64 {
        let ptr = addr.checked_add(offset)?;
        if ptr >= USER_ADDR_MAX {
            return None;
        }
        // SAFETY: Below the user boundary; an unmapped byte faults the
        // calling task, not the kernel's own state.
        let byte = unsafe { *(ptr as *const u8) };
        if byte == 0 {
            return String::from_utf8(bytes).ok();
        }
        bytes.push(byte);
    }
    None
}
