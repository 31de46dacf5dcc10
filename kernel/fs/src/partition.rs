//! MBR and GPT partition table parsing.
//!
//! An MBR whose only meaningful entry is the 0xEE protective type hands the
//! disk over to GPT parsing at LBA 1. Parsed partitions are plain
//! `{start_lba, block_count}` extents, wrapped into
//! [`PartitionController`](crate::block::PartitionController) views by the
//! caller.

use alloc::vec;
use alloc::vec::Vec;

use muon_core::kinfo;

use crate::block::{BlockController, BlockError};
use crate::error::FsError;

/// MBR partition type byte for a protective GPT entry.
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;

/// Offset of the MBR partition entry array.
const MBR_TABLE_OFFSET: usize = 446;

/// Size of one MBR partition entry.
const MBR_ENTRY_SIZE: usize = 16;

/// Boot sector signature, also guarding the MBR.
const MBR_SIGNATURE: u16 = 0xAA55;

/// GPT header signature: "EFI PART".
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// How a partition is described on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    /// Classic MBR entry.
    Mbr {
        /// Partition type byte.
        type_byte: u8,
    },
    /// GPT entry.
    Gpt,
}

/// A parsed partition extent.
#[derive(Debug, Clone, Copy)]
pub struct PartitionInfo {
    /// First block of the partition.
    pub start_lba: u64,
    /// Number of blocks.
    pub block_count: u64,
    /// Source table entry kind.
    pub scheme: PartitionScheme,
}

fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn le_u64(data: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(bytes)
}

fn read_block(device: &dyn BlockController, lba: u64) -> Result<Vec<u8>, FsError> {
    let mut block = vec![0u8; device.block_size()];
    device
        .read_blocks(lba, &mut block)
        .map_err(|_: BlockError| FsError::IoError)?;
    Ok(block)
}

/// Probes the partition table of `device`.
///
/// Reads the MBR at LBA 0; a protective 0xEE entry falls through to the GPT
/// header at LBA 1. Returns the non-empty partitions in table order.
///
/// # Errors
///
/// [`FsError::IoError`] on device failure, [`FsError::InvalidArgument`] on a
/// missing boot signature or corrupt GPT header.
pub fn probe(device: &dyn BlockController) -> Result<Vec<PartitionInfo>, FsError> {
    let mbr = read_block(device, 0)?;
    if mbr.len() < 512 || le_u16(&mbr, 510) != MBR_SIGNATURE {
        return Err(FsError::InvalidArgument);
    }

    let mut partitions = Vec::new();
    let mut protective = false;

    for slot in 0..4 {
        let entry = &mbr[MBR_TABLE_OFFSET + slot * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE];
        let type_byte = entry[4];
        let start_lba = le_u32(entry, 8) as u64;
        let block_count = le_u32(entry, 12) as u64;

        if type_byte == 0 || block_count == 0 {
            continue;
        }
        if type_byte == MBR_TYPE_GPT_PROTECTIVE {
            protective = true;
            continue;
        }
        partitions.push(PartitionInfo {
            start_lba,
            block_count,
            scheme: PartitionScheme::Mbr { type_byte },
        });
    }

    if protective {
        return probe_gpt(device);
    }

    kinfo!("partition: MBR with {} entries", partitions.len());
    Ok(partitions)
}

/// Parses the GPT header and entry array starting at LBA 1.
fn probe_gpt(device: &dyn BlockController) -> Result<Vec<PartitionInfo>, FsError> {
    let header = read_block(device, 1)?;
    if &header[0..8] != GPT_SIGNATURE {
        return Err(FsError::InvalidArgument);
    }

    let entry_lba = le_u64(&header, 72);
    let entry_count = le_u32(&header, 80) as usize;
    let entry_size = le_u32(&header, 84) as usize;
    if entry_size < 128 || entry_count == 0 {
        return Err(FsError::InvalidArgument);
    }

    let block_size = device.block_size();
    let mut partitions = Vec::new();
    let mut block = Vec::new();
    let mut cached_lba = u64::MAX;

    for index in 0..entry_count.min(128) {
        let byte_offset = index * entry_size;
        let lba = entry_lba + (byte_offset / block_size) as u64;
        if lba != cached_lba {
            block = read_block(device, lba)?;
            cached_lba = lba;
        }
        let entry = &block[byte_offset % block_size..][..entry_size.min(block_size)];

        // All-zero type GUID marks an unused slot.
        if entry[0..16].iter().all(|&b| b == 0) {
            continue;
        }

        let first = le_u64(entry, 32);
        let last = le_u64(entry, 40);
        if last < first {
            continue;
        }
        partitions.push(PartitionInfo {
            start_lba: first,
            block_count: last - first + 1,
            scheme: PartitionScheme::Gpt,
        });
    }

    kinfo!("partition: GPT with {} entries", partitions.len());
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_support::MemDisk;

    fn blank_disk(blocks: u64) -> MemDisk {
        MemDisk::new(blocks, 512)
    }

    fn write_mbr_signature(disk: &MemDisk) {
        let mut mbr = vec![0u8; 512];
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        disk.write_blocks(0, &mbr).unwrap();
    }

    fn add_mbr_entry(disk: &MemDisk, slot: usize, type_byte: u8, start: u32, count: u32) {
        let mut mbr = vec![0u8; 512];
        disk.read_blocks(0, &mut mbr).unwrap();
        let base = MBR_TABLE_OFFSET + slot * MBR_ENTRY_SIZE;
        mbr[base + 4] = type_byte;
        mbr[base + 8..base + 12].copy_from_slice(&start.to_le_bytes());
        mbr[base + 12..base + 16].copy_from_slice(&count.to_le_bytes());
        disk.write_blocks(0, &mbr).unwrap();
    }

    #[test]
    fn missing_signature_rejected() {
        let disk = blank_disk(16);
        assert!(matches!(probe(&disk), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn empty_mbr_yields_no_partitions() {
        let disk = blank_disk(16);
        write_mbr_signature(&disk);
        assert!(probe(&disk).unwrap().is_empty());
    }

    #[test]
    fn mbr_entries_parsed_in_order() {
        let disk = blank_disk(128);
        write_mbr_signature(&disk);
        add_mbr_entry(&disk, 0, 0x0C, 64, 32); // FAT32 LBA
        add_mbr_entry(&disk, 2, 0x83, 96, 16);

        let parts = probe(&disk).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].start_lba, 64);
        assert_eq!(parts[0].block_count, 32);
        assert_eq!(parts[0].scheme, PartitionScheme::Mbr { type_byte: 0x0C });
        assert_eq!(parts[1].start_lba, 96);
    }

    #[test]
    fn protective_mbr_falls_through_to_gpt() {
        let disk = blank_disk(128);
        write_mbr_signature(&disk);
        add_mbr_entry(&disk, 0, MBR_TYPE_GPT_PROTECTIVE, 1, 127);

        // GPT header at LBA 1.
        let mut header = vec![0u8; 512];
        header[0..8].copy_from_slice(GPT_SIGNATURE);
        header[72..80].copy_from_slice(&2u64.to_le_bytes()); // entries at LBA 2
        header[80..84].copy_from_slice(&4u32.to_le_bytes()); // 4 entries
        header[84..88].copy_from_slice(&128u32.to_le_bytes());
        disk.write_blocks(1, &header).unwrap();

        // One used entry: LBAs 34..=97.
        let mut entries = vec![0u8; 512];
        entries[0] = 0xAB; // non-zero type GUID byte
        entries[32..40].copy_from_slice(&34u64.to_le_bytes());
        entries[40..48].copy_from_slice(&97u64.to_le_bytes());
        disk.write_blocks(2, &entries).unwrap();

        let parts = probe(&disk).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start_lba, 34);
        assert_eq!(parts[0].block_count, 64);
        assert_eq!(parts[0].scheme, PartitionScheme::Gpt);
    }

    #[test]
    fn protective_mbr_with_bad_gpt_rejected() {
        let disk = blank_disk(16);
        write_mbr_signature(&disk);
        add_mbr_entry(&disk, 0, MBR_TYPE_GPT_PROTECTIVE, 1, 15);
        assert!(matches!(probe(&disk), Err(FsError::InvalidArgument)));
    }
}
