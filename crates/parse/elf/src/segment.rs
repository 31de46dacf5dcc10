//! ELF64 program header parsing.

use crate::header::{le_u32, le_u64, Elf64Header, ELF64_PHDR_SIZE};

/// Program header type: loadable segment.
pub const PT_LOAD: u32 = 1;

/// Segment permission flags (`p_flags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SegmentFlags(u32);

impl SegmentFlags {
    /// Segment is executable.
    pub const EXECUTE: u32 = 1 << 0;
    /// Segment is writable.
    pub const WRITE: u32 = 1 << 1;
    /// Segment is readable.
    pub const READ: u32 = 1 << 2;

    /// Returns the raw flag bits.
    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if the writable bit is set.
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Returns `true` if the executable bit is set.
    #[must_use]
    pub fn is_executable(self) -> bool {
        self.0 & Self::EXECUTE != 0
    }
}

/// A parsed ELF64 program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    /// Segment type (`PT_LOAD` etc.).
    pub p_type: u32,
    /// Permission flags.
    pub p_flags: SegmentFlags,
    /// File offset of the segment contents.
    pub p_offset: u64,
    /// Virtual load address.
    pub p_vaddr: u64,
    /// Number of bytes stored in the file.
    pub p_filesz: u64,
    /// Number of bytes occupied in memory (`>= p_filesz`; the tail is BSS).
    pub p_memsz: u64,
    /// Required alignment.
    pub p_align: u64,
}

impl ProgramHeader {
    fn parse(data: &[u8]) -> Self {
        debug_assert!(data.len() >= ELF64_PHDR_SIZE);
        Self {
            p_type: le_u32(data, 0),
            p_flags: SegmentFlags(le_u32(data, 4)),
            p_offset: le_u64(data, 8),
            p_vaddr: le_u64(data, 16),
            p_filesz: le_u64(data, 32),
            p_memsz: le_u64(data, 40),
            p_align: le_u64(data, 48),
        }
    }
}

/// Iterator over the `PT_LOAD` program headers of an ELF image.
pub struct LoadSegmentIter<'a> {
    data: &'a [u8],
    offset: usize,
    entry_size: usize,
    remaining: usize,
}

impl<'a> LoadSegmentIter<'a> {
    pub(crate) fn new(data: &'a [u8], header: &Elf64Header) -> Self {
        Self {
            data,
            offset: header.e_phoff as usize,
            entry_size: header.e_phentsize as usize,
            remaining: header.e_phnum as usize,
        }
    }
}

impl Iterator for LoadSegmentIter<'_> {
    type Item = ProgramHeader;

    fn next(&mut self) -> Option<ProgramHeader> {
        while self.remaining > 0 {
            let bytes = self.data.get(self.offset..self.offset + self.entry_size)?;
            self.offset += self.entry_size;
            self.remaining -= 1;

            let phdr = ProgramHeader::parse(bytes);
            if phdr.p_type == PT_LOAD {
                return Some(phdr);
            }
        }
        None
    }
}
