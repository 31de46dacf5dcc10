//! Boot module file description.

/// A file loaded by the bootloader alongside the kernel.
#[repr(C)]
pub struct File {
    revision: u64,
    address: *mut u8,
    size: u64,
    path: *const u8,
    cmdline: *const u8,
    media_type: u32,
    _unused: u32,
    tftp_ip: u32,
    tftp_port: u32,
    partition_index: u32,
    mbr_disk_id: u32,
    gpt_disk_uuid: [u8; 16],
    gpt_part_uuid: [u8; 16],
    part_uuid: [u8; 16],
}

impl File {
    /// Virtual (HHDM) address of the file contents.
    #[must_use]
    pub fn address(&self) -> *mut u8 {
        self.address
    }

    /// Size of the file in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the file contents as a byte slice.
    ///
    /// # Safety
    ///
    /// The bootloader-provided mapping must still be intact (the module
    /// memory region must not have been reclaimed).
    #[must_use]
    pub unsafe fn data(&self) -> &[u8] {
        // SAFETY: The bootloader loaded `size` contiguous bytes at `address`.
        unsafe { core::slice::from_raw_parts(self.address, self.size as usize) }
    }

    /// Returns the NUL-terminated path string, if valid UTF-8.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        if self.path.is_null() {
            return None;
        }
        let mut len = 0usize;
        // SAFETY: The bootloader provides a NUL-terminated string; bound the
        // scan to keep a corrupt pointer from running away.
        unsafe {
            while len < 4096 && *self.path.add(len) != 0 {
                len += 1;
            }
            core::str::from_utf8(core::slice::from_raw_parts(self.path, len)).ok()
        }
    }
}
