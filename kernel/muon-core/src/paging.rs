//! Page table structures for 4-level x86_64 paging.
//!
//! The entry layout is fixed by the architecture: bits 12..51 carry the
//! physical frame number, the low bits and bit 63 carry attributes. Bit 9 is
//! ignored by the MMU and is used by the kernel as the copy-on-write marker.

use core::fmt;
use core::ops::{Add, Sub};

use crate::addr::PhysAddr;

/// Size of a page / physical frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Physical address mask inside a page table entry: bits 12..51.
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Page table entry attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present / valid.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from ring 3.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Cache disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED      = 1 << 5;
        /// PS bit: 2 MiB page in a PD entry, 1 GiB page in a PDPT entry.
        const HUGE_PAGE     = 1 << 7;
        /// Copy-on-write marker. Bit 9 is ignored by hardware; the fork path
        /// sets it on write-protected shared leaves.
        const COW           = 1 << 9;
        /// No-execute (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Page fault error code bits pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        /// 1 = protection violation, 0 = not-present page.
        const PRESENT           = 1 << 0;
        /// 1 = write access caused the fault.
        const WRITE             = 1 << 1;
        /// 1 = fault occurred in user mode.
        const USER              = 1 << 2;
        /// 1 = a reserved bit was set in a page table entry.
        const RESERVED_WRITE    = 1 << 3;
        /// 1 = fault was caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// A single 64-bit page table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys` with the given `flags`.
    pub const fn new(phys: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        // SAFETY: The masked value always fits in 52 bits.
        unsafe { PhysAddr::new_unchecked(self.0 & ADDR_MASK) }
    }

    /// Returns the attribute bits of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    /// Returns a copy of this entry with `flags` replacing the current
    /// attribute bits, keeping the address.
    pub const fn with_flags(self, flags: PageTableFlags) -> Self {
        Self::new(self.address(), flags)
    }
}

/// A 4 KiB-aligned page table of 512 entries. One of these backs every level
/// of the paging tree (PML4, PDPT, PD, PT).
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries of this table.
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Clears every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

/// A 4 KiB physical frame, identified by its aligned base address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame {
    start: PhysAddr,
}

impl PhysFrame {
    /// Returns the frame containing `addr` (aligns down).
    #[inline]
    pub fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: addr.align_down(PAGE_SIZE as u64),
        }
    }

    /// Creates a frame from an already-aligned base address.
    ///
    /// Returns `None` if `addr` is not page-aligned.
    #[inline]
    pub fn from_start_address(addr: PhysAddr) -> Option<Self> {
        if !addr.is_aligned(PAGE_SIZE as u64) {
            return None;
        }
        Some(Self { start: addr })
    }

    /// Returns the base address of this frame.
    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.start
    }

    /// Returns the frame number (`base / PAGE_SIZE`).
    #[inline]
    pub const fn number(&self) -> usize {
        (self.start.as_u64() / PAGE_SIZE as u64) as usize
    }
}

impl Add<u64> for PhysFrame {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        PhysFrame::containing_address(self.start + rhs * PAGE_SIZE as u64)
    }
}

impl Sub<u64> for PhysFrame {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        PhysFrame::containing_address(self.start - rhs * PAGE_SIZE as u64)
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.start.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_not_present() {
        let entry = PageTableEntry::empty();
        assert!(!entry.is_present());
        assert_eq!(entry.address().as_u64(), 0);
    }

    #[test]
    fn entry_flags_roundtrip() {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER;
        let entry = PageTableEntry::new(PhysAddr::new(0x2000), flags);
        assert!(entry.is_present());
        assert_eq!(entry.flags(), flags);
        assert_eq!(entry.address().as_u64(), 0x2000);
    }

    #[test]
    fn cow_bit_is_bit_9() {
        assert_eq!(PageTableFlags::COW.bits(), 1 << 9);
        let entry = PageTableEntry::new(
            PhysAddr::new(0x3000),
            PageTableFlags::PRESENT | PageTableFlags::COW,
        );
        assert!(entry.flags().contains(PageTableFlags::COW));
        assert!(!entry.flags().contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn address_does_not_leak_flags() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x000F_FFFF_FFFF_F000),
            PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE,
        );
        assert_eq!(entry.address().as_u64() & !ADDR_MASK, 0);
        assert_eq!(entry.flags().bits() & ADDR_MASK, 0);
    }

    #[test]
    fn with_flags_keeps_address() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x5000),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
        let cow = entry.with_flags(PageTableFlags::PRESENT | PageTableFlags::COW);
        assert_eq!(cow.address().as_u64(), 0x5000);
        assert!(!cow.flags().contains(PageTableFlags::WRITABLE));
        assert!(cow.flags().contains(PageTableFlags::COW));
    }

    #[test]
    fn addr_mask_bit_range() {
        for bit in 0..64 {
            let expected = (12..52).contains(&bit);
            let actual = (ADDR_MASK >> bit) & 1 == 1;
            assert_eq!(actual, expected, "bit {bit} mismatch in ADDR_MASK");
        }
    }

    #[test]
    fn frame_alignment() {
        let frame = PhysFrame::containing_address(PhysAddr::new(0x5678));
        assert_eq!(frame.start_address().as_u64(), 0x5000);
        assert_eq!(frame.number(), 5);
        assert!(PhysFrame::from_start_address(PhysAddr::new(0x5001)).is_none());
    }

    #[test]
    fn frame_arithmetic() {
        let frame = PhysFrame::containing_address(PhysAddr::new(0x1000));
        assert_eq!((frame + 3).start_address().as_u64(), 0x4000);
        assert_eq!((frame + 3 - 1).start_address().as_u64(), 0x3000);
    }

    #[test]
    fn page_fault_error_code_bits() {
        let code = PageFaultErrorCode::from_bits_truncate(0b0111);
        assert!(code.contains(PageFaultErrorCode::PRESENT));
        assert!(code.contains(PageFaultErrorCode::WRITE));
        assert!(code.contains(PageFaultErrorCode::USER));
        assert!(!code.contains(PageFaultErrorCode::INSTRUCTION_FETCH));
    }

    #[test]
    fn page_table_zero() {
        let mut table = PageTable {
            entries: [PageTableEntry::new(
                PhysAddr::new(0x1000),
                PageTableFlags::PRESENT,
            ); 512],
        };
        table.zero();
        assert!(table.entries.iter().all(|e| !e.is_present()));
    }
}
