//! Memory map entry types.

/// The kind of a memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EntryType(u64);

impl EntryType {
    /// Normal usable RAM.
    pub const USABLE: Self = Self(0);
    /// Reserved by firmware or hardware.
    pub const RESERVED: Self = Self(1);
    /// ACPI tables, reclaimable after parsing.
    pub const ACPI_RECLAIMABLE: Self = Self(2);
    /// ACPI non-volatile storage; never usable.
    pub const ACPI_NVS: Self = Self(3);
    /// Defective memory.
    pub const BAD_MEMORY: Self = Self(4);
    /// Bootloader-owned memory, reclaimable once responses are consumed.
    pub const BOOTLOADER_RECLAIMABLE: Self = Self(5);
    /// The kernel image and boot modules.
    pub const EXECUTABLE_AND_MODULES: Self = Self(6);
    /// Memory-mapped framebuffer.
    pub const FRAMEBUFFER: Self = Self(7);
}

/// A single entry of the physical memory map.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemMapEntry {
    /// Physical base address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// Kind of the region.
    pub entry_type: EntryType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_three_words() {
        assert_eq!(core::mem::size_of::<MemMapEntry>(), 24);
    }

    #[test]
    fn entry_type_values() {
        assert_eq!(EntryType::USABLE.0, 0);
        assert_eq!(EntryType::EXECUTABLE_AND_MODULES.0, 6);
        assert_eq!(EntryType::FRAMEBUFFER.0, 7);
    }
}
