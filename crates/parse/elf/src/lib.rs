//! ELF64 parsing for the program loader.
//!
//! Parses the file header and program headers from raw byte slices using
//! safe little-endian field extraction. Only what the loader needs: magic
//! and machine validation plus the `PT_LOAD` segment list.

#![cfg_attr(not(test), no_std)]

mod header;
mod segment;

pub use header::{Elf64Header, ElfError};
pub use segment::{LoadSegmentIter, ProgramHeader, SegmentFlags, PT_LOAD};

/// A parsed ELF64 image borrowed from a byte slice.
#[derive(Debug, Clone, Copy)]
pub struct ElfImage<'a> {
    header: Elf64Header,
    data: &'a [u8],
}

impl<'a> ElfImage<'a> {
    /// Parses and validates `data` as a 64-bit little-endian x86_64 ELF.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError`] if validation fails or the data is truncated.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = Elf64Header::parse(data)?;
        Ok(Self { header, data })
    }

    /// Returns the file header.
    #[must_use]
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    /// Returns the virtual entry point.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.header.e_entry
    }

    /// Returns an iterator over the `PT_LOAD` program headers.
    #[must_use]
    pub fn load_segments(&self) -> LoadSegmentIter<'a> {
        LoadSegmentIter::new(self.data, &self.header)
    }

    /// Returns the file bytes of a segment (`p_offset .. p_offset+p_filesz`).
    ///
    /// # Errors
    ///
    /// Returns [`ElfError::InvalidOffset`] if the range exceeds the file.
    pub fn segment_bytes(&self, phdr: &ProgramHeader) -> Result<&'a [u8], ElfError> {
        let start = usize::try_from(phdr.p_offset).map_err(|_| ElfError::InvalidOffset)?;
        let len = usize::try_from(phdr.p_filesz).map_err(|_| ElfError::InvalidOffset)?;
        let end = start.checked_add(len).ok_or(ElfError::InvalidOffset)?;
        self.data.get(start..end).ok_or(ElfError::InvalidOffset)
    }
}
