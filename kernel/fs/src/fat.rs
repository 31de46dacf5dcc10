//! FAT32 filesystem driver.
//!
//! Mounts a FAT32 volume from any byte-addressed device implementing the
//! `hadris_io` traits, loads the full FAT into memory, and materializes the
//! on-disk tree as VFS nodes whose op table calls back into the engine.
//! The in-memory FAT is authoritative while mounted; a dirty flag tracks
//! pending changes and flushes rewrite every FAT copy. Long-filename
//! entries are skipped: the namespace is 8.3 only.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use hadris_io::{Read, Seek, SeekFrom, Write};
use muon_core::sync::SpinLock;
use muon_core::{kerr, kinfo};

use crate::error::FsError;
use crate::node::{NodeKind, NodeOps, Vfs, VfsNode};

/// FAT entries at or above this value terminate a chain.
pub const FAT32_EOC: u32 = 0x0FFF_FFF8;

/// A free cluster.
const FAT32_FREE: u32 = 0;

/// FAT32 entries use only the low 28 bits.
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;

/// Size of an on-disk directory record.
const DIR_ENTRY_SIZE: usize = 32;

/// Directory record marking the end of the directory.
const DIR_END: u8 = 0x00;

/// Directory record marking an erased entry.
const DIR_ERASED: u8 = 0xE5;

bitflags! {
    /// Directory entry attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FatAttributes: u8 {
        /// Read-only.
        const READ_ONLY = 0x01;
        /// Hidden.
        const HIDDEN    = 0x02;
        /// System file.
        const SYSTEM    = 0x04;
        /// Volume label pseudo-entry.
        const VOLUME_ID = 0x08;
        /// Directory.
        const DIRECTORY = 0x10;
        /// Archive (set on regular files).
        const ARCHIVE   = 0x20;
    }
}

/// The long-filename marker: all four low attribute bits at once.
const ATTR_LONG_NAME: u8 = 0x0F;

fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// Parsed boot-sector geometry.
#[derive(Debug, Clone, Copy)]
pub struct BootSector {
    /// Bytes per sector (512 on everything this kernel meets).
    pub bytes_per_sector: u16,
    /// Sectors per allocation unit.
    pub sectors_per_cluster: u8,
    /// Sectors before the first FAT.
    pub reserved_sectors: u16,
    /// Number of FAT copies.
    pub num_fats: u8,
    /// Sectors per FAT copy.
    pub sectors_per_fat: u32,
    /// First cluster of the root directory.
    pub root_cluster: u32,
    /// Total sectors on the volume.
    pub total_sectors: u32,
    /// Volume label, space-padded.
    pub volume_label: [u8; 11],
}

impl BootSector {
    /// Parses and validates a FAT32 boot sector.
    ///
    /// # Errors
    ///
    /// [`FsError::InvalidArgument`] on a missing 0xAA55 signature or when
    /// the FAT12/16 discriminator fields are populated.
    pub fn parse(sector: &[u8]) -> Result<Self, FsError> {
        if sector.len() < 512 {
            return Err(FsError::InvalidArgument);
        }
        if le_u16(sector, 510) != 0xAA55 {
            kerr!("fat: bad boot signature {:#06x}", le_u16(sector, 510));
            return Err(FsError::InvalidArgument);
        }
        // FAT32 volumes zero the FAT16 sectors-per-fat and root-entry
        // fields; anything else is FAT12/16.
        if le_u16(sector, 22) != 0 || le_u16(sector, 17) != 0 {
            kerr!("fat: FAT12/16 volume rejected");
            return Err(FsError::InvalidArgument);
        }

        let parsed = Self {
            bytes_per_sector: le_u16(sector, 11),
            sectors_per_cluster: sector[13],
            reserved_sectors: le_u16(sector, 14),
            num_fats: sector[16],
            sectors_per_fat: le_u32(sector, 36),
            root_cluster: le_u32(sector, 44),
            total_sectors: le_u32(sector, 32),
            volume_label: sector[71..82].try_into().unwrap_or([b' '; 11]),
        };

        if parsed.bytes_per_sector == 0
            || !parsed.bytes_per_sector.is_power_of_two()
            || parsed.sectors_per_cluster == 0
            || parsed.num_fats == 0
            || parsed.sectors_per_fat == 0
            || parsed.root_cluster < 2
        {
            return Err(FsError::InvalidArgument);
        }
        Ok(parsed)
    }
}

/// A 32-byte directory record, decoded.
#[derive(Debug, Clone, Copy)]
pub struct RawDirEntry {
    /// 8.3 name, space-padded.
    pub name: [u8; 11],
    /// Attribute byte.
    pub attributes: u8,
    /// High 16 bits of the first cluster.
    pub cluster_high: u16,
    /// Low 16 bits of the first cluster.
    pub cluster_low: u16,
    /// File size in bytes (0 for directories).
    pub file_size: u32,
}

impl RawDirEntry {
    /// Decodes a record from its 32 on-disk bytes.
    fn parse(raw: &[u8]) -> Self {
        Self {
            name: raw[0..11].try_into().unwrap_or([b' '; 11]),
            attributes: raw[11],
            cluster_high: le_u16(raw, 20),
            cluster_low: le_u16(raw, 26),
            file_size: le_u32(raw, 28),
        }
    }

    /// Encodes the record back to 32 bytes (timestamps stay zero).
    fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[0..11].copy_from_slice(&self.name);
        raw[11] = self.attributes;
        raw[20..22].copy_from_slice(&self.cluster_high.to_le_bytes());
        raw[26..28].copy_from_slice(&self.cluster_low.to_le_bytes());
        raw[28..32].copy_from_slice(&self.file_size.to_le_bytes());
        raw
    }

    /// First cluster of the chain; 0 means no allocation yet.
    pub fn first_cluster(&self) -> u32 {
        ((self.cluster_high as u32) << 16) | self.cluster_low as u32
    }

    /// Updates the first-cluster field.
    fn set_first_cluster(&mut self, cluster: u32) {
        self.cluster_high = (cluster >> 16) as u16;
        self.cluster_low = cluster as u16;
    }

    /// Returns `true` for directory entries.
    pub fn is_directory(&self) -> bool {
        self.attributes & FatAttributes::DIRECTORY.bits() != 0
    }

    /// Formats the 8.3 name as `NAME.EXT`.
    pub fn display_name(&self) -> String {
        let mut out = String::new();
        for &b in self.name[..8].iter().take_while(|&&b| b != b' ') {
            out.push(b as char);
        }
        if self.name[8] != b' ' {
            out.push('.');
            for &b in self.name[8..].iter().take_while(|&&b| b != b' ') {
                out.push(b as char);
            }
        }
        out
    }

    /// Builds a space-padded, upper-cased 8.3 name from `filename`.
    /// Oversized parts are truncated.
    fn make_83(filename: &str) -> [u8; 11] {
        let mut name = [b' '; 11];
        let (stem, ext) = match filename.rfind('.') {
            Some(dot) if dot > 0 => (&filename[..dot], &filename[dot + 1..]),
            _ => (filename, ""),
        };
        for (i, b) in stem.bytes().take(8).enumerate() {
            name[i] = b.to_ascii_uppercase();
        }
        for (i, b) in ext.bytes().take(3).enumerate() {
            name[8 + i] = b.to_ascii_uppercase();
        }
        name
    }
}

/// Where a directory record lives on disk: which cluster of the directory
/// chain and which slot inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirLocation {
    /// Cluster holding the record.
    pub cluster: u32,
    /// Record index within the cluster.
    pub index: usize,
}

/// The in-memory FAT copy.
struct FatCache {
    entries: Vec<u32>,
    dirty: bool,
}

/// A mounted FAT32 volume.
pub struct FatVolume<D> {
    device: SpinLock<D>,
    boot: BootSector,
    /// First FAT sector.
    fat_start_sector: u32,
    /// First data-region sector (cluster 2 starts here).
    data_start_sector: u32,
    /// Number of data clusters.
    total_clusters: u32,
    /// Bytes per cluster, derived.
    bytes_per_cluster: usize,
    fat: SpinLock<FatCache>,
}

impl<D: Read + Write + Seek + Send> FatVolume<D> {
    /// Mounts a volume: validates the boot sector, derives the geometry,
    /// and loads the full FAT into memory with the dirty flag clear.
    pub fn mount(mut device: D) -> Result<Arc<Self>, FsError> {
        let mut sector = [0u8; 512];
        device
            .seek(SeekFrom::Start(0))
            .and_then(|_| device.read_exact(&mut sector))
            .map_err(|_| FsError::IoError)?;
        let boot = BootSector::parse(&sector)?;

        let fat_start_sector = boot.reserved_sectors as u32;
        let data_start_sector =
            fat_start_sector + boot.num_fats as u32 * boot.sectors_per_fat;
        let data_sectors = boot.total_sectors.saturating_sub(data_start_sector);
        let bytes_per_cluster =
            boot.sectors_per_cluster as usize * boot.bytes_per_sector as usize;

        // A FAT entry must exist for every data cluster; clamp so a short
        // FAT on a malformed image cannot push chain walks out of bounds.
        let fat_entries =
            boot.sectors_per_fat as u64 * boot.bytes_per_sector as u64 / 4;
        let total_clusters = (data_sectors / boot.sectors_per_cluster as u32)
            .min(fat_entries.saturating_sub(2) as u32);

        // Load the first FAT copy wholesale.
        let fat_bytes = boot.sectors_per_fat as usize * boot.bytes_per_sector as usize;
        let mut raw = vec![0u8; fat_bytes];
        device
            .seek(SeekFrom::Start(
                fat_start_sector as u64 * boot.bytes_per_sector as u64,
            ))
            .and_then(|_| device.read_exact(&mut raw))
            .map_err(|_| FsError::IoError)?;
        let entries: Vec<u32> = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        kinfo!(
            "fat: mounted volume '{}', {} clusters of {} bytes",
            core::str::from_utf8(&boot.volume_label).unwrap_or("?").trim_end(),
            total_clusters,
            bytes_per_cluster,
        );

        Ok(Arc::new(Self {
            device: SpinLock::new(device),
            boot,
            fat_start_sector,
            data_start_sector,
            total_clusters,
            bytes_per_cluster,
            fat: SpinLock::new(FatCache {
                entries,
                dirty: false,
            }),
        }))
    }

    /// Bytes per cluster.
    pub fn bytes_per_cluster(&self) -> usize {
        self.bytes_per_cluster
    }

    /// First cluster of the root directory.
    pub fn root_cluster(&self) -> u32 {
        self.boot.root_cluster
    }

    fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.data_start_sector + (cluster - 2) * self.boot.sectors_per_cluster as u32
    }

    fn cluster_in_range(&self, cluster: u32) -> bool {
        (2..self.total_clusters + 2).contains(&cluster)
    }

    /// Next cluster in the chain, or [`FAT32_EOC`] at the end.
    fn next_cluster(&self, cluster: u32) -> u32 {
        if !self.cluster_in_range(cluster) {
            return FAT32_EOC;
        }
        let fat = self.fat.lock();
        let next = fat.entries[cluster as usize] & FAT_ENTRY_MASK;
        if next >= FAT32_EOC { FAT32_EOC } else { next }
    }

    /// Rewrites a FAT entry in memory and marks the cache dirty.
    fn set_fat_entry(&self, cluster: u32, value: u32) {
        if !self.cluster_in_range(cluster) {
            return;
        }
        let mut fat = self.fat.lock();
        fat.entries[cluster as usize] = value & FAT_ENTRY_MASK;
        fat.dirty = true;
    }

    /// Scans for the first free cluster, claims it as end-of-chain, and
    /// links it after `previous` when given.
    fn allocate_cluster(&self, previous: u32) -> Result<u32, FsError> {
        let new_cluster = {
            let fat = self.fat.lock();
            (2..self.total_clusters + 2)
                .find(|&c| fat.entries[c as usize] & FAT_ENTRY_MASK == FAT32_FREE)
        };
        let Some(new_cluster) = new_cluster else {
            kerr!("fat: no free clusters");
            return Err(FsError::NoSpace);
        };

        self.set_fat_entry(new_cluster, FAT32_EOC);
        if previous >= 2 {
            self.set_fat_entry(previous, new_cluster);
        }
        Ok(new_cluster)
    }

    fn read_cluster(&self, cluster: u32, buf: &mut [u8]) -> Result<(), FsError> {
        if !self.cluster_in_range(cluster) {
            return Err(FsError::IoError);
        }
        let offset =
            self.cluster_to_sector(cluster) as u64 * self.boot.bytes_per_sector as u64;
        let mut device = self.device.lock();
        device
            .seek(SeekFrom::Start(offset))
            .and_then(|_| device.read_exact(&mut buf[..self.bytes_per_cluster]))
            .map_err(|_| FsError::IoError)
    }

    fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<(), FsError> {
        if !self.cluster_in_range(cluster) {
            return Err(FsError::IoError);
        }
        let offset =
            self.cluster_to_sector(cluster) as u64 * self.boot.bytes_per_sector as u64;
        let mut device = self.device.lock();
        device
            .seek(SeekFrom::Start(offset))
            .and_then(|_| device.write_all(&buf[..self.bytes_per_cluster]))
            .map_err(|_| FsError::IoError)
    }

    /// Writes the in-memory FAT back through every on-disk copy, clearing
    /// the dirty flag. No-op while clean.
    pub fn flush_fat(&self) -> Result<(), FsError> {
        let mut fat = self.fat.lock();
        if !fat.dirty {
            return Ok(());
        }

        let mut raw = Vec::with_capacity(fat.entries.len() * 4);
        for entry in &fat.entries {
            raw.extend_from_slice(&entry.to_le_bytes());
        }

        let mut device = self.device.lock();
        for copy in 0..self.boot.num_fats as u32 {
            let sector = self.fat_start_sector + copy * self.boot.sectors_per_fat;
            let offset = sector as u64 * self.boot.bytes_per_sector as u64;
            device
                .seek(SeekFrom::Start(offset))
                .and_then(|_| device.write_all(&raw))
                .map_err(|_| FsError::IoError)?;
        }

        fat.dirty = false;
        Ok(())
    }

    /// Collects the live records of the directory starting at `cluster`.
    ///
    /// Erased slots, the volume label, long-name entries, and `.`/`..` are
    /// skipped; a 0x00 name byte ends the scan.
    fn read_directory(&self, cluster: u32) -> Result<Vec<(RawDirEntry, DirLocation)>, FsError> {
        let mut entries = Vec::new();
        let mut buf = vec![0u8; self.bytes_per_cluster];
        let mut current = cluster;

        'chain: while current < FAT32_EOC {
            self.read_cluster(current, &mut buf)?;
            for (index, raw) in buf.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
                if raw[0] == DIR_END {
                    break 'chain;
                }
                if raw[0] == DIR_ERASED {
                    continue;
                }
                if raw[11] == ATTR_LONG_NAME {
                    continue;
                }
                if raw[11] & FatAttributes::VOLUME_ID.bits() != 0 {
                    continue;
                }
                let entry = RawDirEntry::parse(raw);
                if entry.name[0] == b'.' {
                    continue;
                }
                entries.push((entry, DirLocation {
                    cluster: current,
                    index,
                }));
            }
            current = self.next_cluster(current);
        }

        Ok(entries)
    }

    /// Finds `name` (case-insensitive 8.3 comparison) in the directory at
    /// `dir_cluster`.
    fn find_entry(
        &self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<Option<(RawDirEntry, DirLocation)>, FsError> {
        let wanted = RawDirEntry::make_83(name);
        Ok(self
            .read_directory(dir_cluster)?
            .into_iter()
            .find(|(entry, _)| entry.name == wanted))
    }

    /// Writes `entry` into the first end/erased slot of the directory
    /// chain, extending the chain with a fresh cluster when it is full.
    fn add_dir_entry(
        &self,
        dir_cluster: u32,
        entry: &RawDirEntry,
    ) -> Result<DirLocation, FsError> {
        let mut buf = vec![0u8; self.bytes_per_cluster];
        let mut current = dir_cluster;
        let mut last = dir_cluster;

        while current < FAT32_EOC {
            last = current;
            self.read_cluster(current, &mut buf)?;

            for index in 0..self.bytes_per_cluster / DIR_ENTRY_SIZE {
                let first_byte = buf[index * DIR_ENTRY_SIZE];
                if first_byte == DIR_END || first_byte == DIR_ERASED {
                    buf[index * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE]
                        .copy_from_slice(&entry.encode());
                    self.write_cluster(current, &buf)?;
                    return Ok(DirLocation {
                        cluster: current,
                        index,
                    });
                }
            }
            current = self.next_cluster(current);
        }

        // Directory full: chain in a new cluster and use its first slot.
        let fresh = self.allocate_cluster(last)?;
        buf.fill(0);
        buf[..DIR_ENTRY_SIZE].copy_from_slice(&entry.encode());
        self.write_cluster(fresh, &buf)?;
        Ok(DirLocation {
            cluster: fresh,
            index: 0,
        })
    }

    /// Rewrites the 32-byte record at `location` (size and first-cluster
    /// updates after a write).
    fn store_dir_entry(&self, location: DirLocation, entry: &RawDirEntry) -> Result<(), FsError> {
        let mut buf = vec![0u8; self.bytes_per_cluster];
        self.read_cluster(location.cluster, &mut buf)?;
        buf[location.index * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE]
            .copy_from_slice(&entry.encode());
        self.write_cluster(location.cluster, &buf)
    }

    /// Reads up to `buf.len()` bytes of the file at byte `offset`,
    /// following the cluster chain and stopping at the file size.
    pub fn read_file(
        &self,
        entry: &RawDirEntry,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        let file_size = entry.file_size as usize;
        if offset >= file_size {
            return Ok(0);
        }
        let wanted = buf.len().min(file_size - offset);

        let mut cluster = entry.first_cluster();
        if cluster < 2 {
            return Ok(0);
        }

        // Skip whole clusters before the window.
        let mut skip = offset;
        while skip >= self.bytes_per_cluster && cluster < FAT32_EOC {
            cluster = self.next_cluster(cluster);
            skip -= self.bytes_per_cluster;
        }

        let mut cluster_buf = vec![0u8; self.bytes_per_cluster];
        let mut done = 0usize;
        while cluster < FAT32_EOC && done < wanted {
            self.read_cluster(cluster, &mut cluster_buf)?;
            let take = (self.bytes_per_cluster - skip).min(wanted - done);
            buf[done..done + take].copy_from_slice(&cluster_buf[skip..skip + take]);
            done += take;
            skip = 0;
            cluster = self.next_cluster(cluster);
        }

        Ok(done)
    }

    /// Writes `data` to the file: either replacing the content from the
    /// start (`append == false`) or extending it at the tail. Allocates the
    /// first cluster on demand and grows the chain on overflow, zero-padding
    /// the final partial cluster. Updates `entry` (size, first cluster) and
    /// persists it at `location`, then flushes the FAT.
    pub fn write_file(
        &self,
        entry: &mut RawDirEntry,
        location: DirLocation,
        data: &[u8],
        append: bool,
    ) -> Result<usize, FsError> {
        let mut cluster = entry.first_cluster();
        if cluster < 2 {
            cluster = self.allocate_cluster(0)?;
            entry.set_first_cluster(cluster);
        }

        // Appending starts at the chain tail.
        let mut current = cluster;
        if append {
            loop {
                let next = self.next_cluster(current);
                if next >= FAT32_EOC {
                    break;
                }
                current = next;
            }
        }

        let mut cluster_buf = vec![0u8; self.bytes_per_cluster];
        let mut written = 0usize;
        while written < data.len() {
            let take = (data.len() - written).min(self.bytes_per_cluster);
            if take < self.bytes_per_cluster {
                cluster_buf.fill(0);
            }
            cluster_buf[..take].copy_from_slice(&data[written..written + take]);
            self.write_cluster(current, &cluster_buf)?;
            written += take;

            if written < data.len() {
                let next = self.next_cluster(current);
                current = if next >= FAT32_EOC {
                    self.allocate_cluster(current)?
                } else {
                    next
                };
            }
        }

        if append {
            entry.file_size += written as u32;
        } else {
            entry.file_size = written as u32;
        }

        self.store_dir_entry(location, entry)?;
        self.flush_fat()?;
        Ok(written)
    }

    /// Creates an empty file entry named `name` in the directory at
    /// `dir_cluster`.
    pub fn create_file(
        &self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<(RawDirEntry, DirLocation), FsError> {
        if self.find_entry(dir_cluster, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let entry = RawDirEntry {
            name: RawDirEntry::make_83(name),
            attributes: FatAttributes::ARCHIVE.bits(),
            cluster_high: 0,
            cluster_low: 0,
            file_size: 0,
        };
        let location = self.add_dir_entry(dir_cluster, &entry)?;
        self.flush_fat()?;
        Ok((entry, location))
    }

    /// Creates a subdirectory: allocates its cluster, writes the `.` and
    /// `..` records, and links the parent entry.
    pub fn create_directory(
        &self,
        parent_cluster: u32,
        name: &str,
    ) -> Result<(RawDirEntry, DirLocation), FsError> {
        if self.find_entry(parent_cluster, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let new_cluster = self.allocate_cluster(0)?;

        let mut buf = vec![0u8; self.bytes_per_cluster];
        let mut dot = RawDirEntry {
            name: *b".          ",
            attributes: FatAttributes::DIRECTORY.bits(),
            cluster_high: 0,
            cluster_low: 0,
            file_size: 0,
        };
        dot.set_first_cluster(new_cluster);
        buf[..DIR_ENTRY_SIZE].copy_from_slice(&dot.encode());

        let mut dotdot = RawDirEntry {
            name: *b"..         ",
            attributes: FatAttributes::DIRECTORY.bits(),
            cluster_high: 0,
            cluster_low: 0,
            file_size: 0,
        };
        dotdot.set_first_cluster(parent_cluster);
        buf[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(&dotdot.encode());
        self.write_cluster(new_cluster, &buf)?;

        let mut entry = RawDirEntry {
            name: RawDirEntry::make_83(name),
            attributes: FatAttributes::DIRECTORY.bits(),
            cluster_high: 0,
            cluster_low: 0,
            file_size: 0,
        };
        entry.set_first_cluster(new_cluster);
        let location = self.add_dir_entry(parent_cluster, &entry)?;
        self.flush_fat()?;
        Ok((entry, location))
    }

    /// Flushes pending FAT changes; the volume must not be used afterwards.
    pub fn unmount(&self) -> Result<(), FsError> {
        self.flush_fat()
    }
}

/// Per-node payload carried by FAT-backed VFS nodes.
struct FatPayload {
    entry: RawDirEntry,
    location: DirLocation,
}

/// Op table routing VFS operations into a [`FatVolume`].
pub struct FatNodeOps<D> {
    volume: Arc<FatVolume<D>>,
}

fn with_fat_payload<R>(
    node: &VfsNode,
    f: impl FnOnce(&mut FatPayload) -> R,
) -> Result<R, FsError> {
    node.with_payload(|payload| {
        payload
            .as_mut()
            .and_then(|p| p.downcast_mut::<FatPayload>())
            .map(f)
            .ok_or(FsError::NotSupported)
    })
}

impl<D: Read + Write + Seek + Send + Sync + 'static> FatNodeOps<D> {
    fn attach(
        volume: &Arc<FatVolume<D>>,
        parent: &Arc<VfsNode>,
        entry: RawDirEntry,
        location: DirLocation,
    ) -> Arc<VfsNode> {
        let kind = if entry.is_directory() {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        let node = VfsNode::new(
            &entry.display_name(),
            kind,
            Some(Arc::new(FatNodeOps {
                volume: volume.clone(),
            })),
        );
        node.set_size(entry.file_size as usize);
        node.with_payload(|payload| {
            *payload = Some(Box::new(FatPayload { entry, location }));
        });
        parent.link_child(&node);
        node
    }
}

impl<D: Read + Write + Seek + Send + Sync + 'static> NodeOps for FatNodeOps<D> {
    fn read(&self, node: &VfsNode, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let entry = with_fat_payload(node, |p| p.entry)?;
        self.volume.read_file(&entry, offset, buf)
    }

    fn write(&self, node: &VfsNode, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let (mut entry, location) = with_fat_payload(node, |p| (p.entry, p.location))?;

        // Writing at the current end appends; anything else rewrites the
        // file from its first cluster.
        let append = offset == entry.file_size as usize && offset != 0;
        let written = self.volume.write_file(&mut entry, location, buf, append)?;

        node.set_size(entry.file_size as usize);
        with_fat_payload(node, |p| p.entry = entry)?;
        Ok(written)
    }

    fn create(
        &self,
        parent: &Arc<VfsNode>,
        name: &str,
        kind: NodeKind,
    ) -> Result<Arc<VfsNode>, FsError> {
        let parent_cluster = with_fat_payload(parent, |p| p.entry.first_cluster())
            .unwrap_or(self.volume.root_cluster());

        let (entry, location) = match kind {
            NodeKind::File => self.volume.create_file(parent_cluster, name)?,
            NodeKind::Directory => self.volume.create_directory(parent_cluster, name)?,
        };
        Ok(Self::attach(&self.volume, parent, entry, location))
    }
}

/// Mounts `device` as FAT32 and grafts its tree at `mountpoint` (created if
/// missing). Returns the volume for unmount and direct engine access.
pub fn mount<D: Read + Write + Seek + Send + Sync + 'static>(
    vfs: &Vfs,
    mountpoint: &str,
    device: D,
) -> Result<Arc<FatVolume<D>>, FsError> {
    let volume = FatVolume::mount(device)?;

    let mount_node = match vfs.lookup(mountpoint) {
        Ok(node) => node,
        Err(FsError::NotFound) => vfs.create(mountpoint, NodeKind::Directory)?,
        Err(e) => return Err(e),
    };
    if !mount_node.is_dir() {
        return Err(FsError::NotADirectory);
    }

    // The mountpoint itself routes into the FAT engine; its payload makes
    // `create` target the on-disk root directory.
    mount_node.set_ops(Arc::new(FatNodeOps {
        volume: volume.clone(),
    }));
    let mut root_entry = RawDirEntry {
        name: *b"/          ",
        attributes: FatAttributes::DIRECTORY.bits(),
        cluster_high: 0,
        cluster_low: 0,
        file_size: 0,
    };
    root_entry.set_first_cluster(volume.root_cluster());
    mount_node.with_payload(|payload| {
        *payload = Some(Box::new(FatPayload {
            entry: root_entry,
            location: DirLocation { cluster: 0, index: 0 },
        }));
    });

    populate_directory(&volume, &mount_node, volume.root_cluster())?;
    Ok(volume)
}

/// Recursively materializes VFS nodes for the on-disk tree.
fn populate_directory<D: Read + Write + Seek + Send + Sync + 'static>(
    volume: &Arc<FatVolume<D>>,
    dir_node: &Arc<VfsNode>,
    cluster: u32,
) -> Result<(), FsError> {
    for (entry, location) in volume.read_directory(cluster)? {
        let node = FatNodeOps::attach(volume, dir_node, entry, location);
        if entry.is_directory() && entry.first_cluster() >= 2 {
            populate_directory(volume, &node, entry.first_cluster())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FdTable, OpenFlags, SeekWhence};
    use crate::ramfs;

    /// Shared in-memory disk implementing the `hadris_io` traits.
    #[derive(Clone)]
    struct MemDev {
        data: Arc<SpinLock<Vec<u8>>>,
        pos: u64,
    }

    impl MemDev {
        fn new(data: Arc<SpinLock<Vec<u8>>>) -> Self {
            Self { data, pos: 0 }
        }
    }

    impl Read for MemDev {
        fn read(&mut self, buf: &mut [u8]) -> hadris_io::Result<usize> {
            let data = self.data.lock();
            let start = (self.pos as usize).min(data.len());
            let count = buf.len().min(data.len() - start);
            buf[..count].copy_from_slice(&data[start..start + count]);
            self.pos += count as u64;
            Ok(count)
        }
    }

    impl Write for MemDev {
        fn write(&mut self, buf: &[u8]) -> hadris_io::Result<usize> {
            let mut data = self.data.lock();
            let start = self.pos as usize;
            if start + buf.len() > data.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
            self.pos += buf.len() as u64;
            Ok(buf.len())
        }

        fn flush(&mut self) -> hadris_io::Result<()> {
            Ok(())
        }
    }

    impl Seek for MemDev {
        fn seek(&mut self, pos: SeekFrom) -> hadris_io::Result<u64> {
            let len = self.data.lock().len() as i64;
            let target = match pos {
                SeekFrom::Start(o) => o as i64,
                SeekFrom::End(o) => len + o,
                SeekFrom::Current(o) => self.pos as i64 + o,
            };
            self.pos = target.max(0) as u64;
            Ok(self.pos)
        }
    }

    const SECTOR: usize = 512;
    const RESERVED: u32 = 32;
    const SECTORS_PER_FAT: u32 = 8;
    const TOTAL_SECTORS: u32 = 1024;

    /// Formats a minimal FAT32 image: 512-byte sectors, 1 sector per
    /// cluster, two FATs, root directory at cluster 2.
    fn mkfs() -> Arc<SpinLock<Vec<u8>>> {
        let mut image = vec![0u8; TOTAL_SECTORS as usize * SECTOR];

        // Boot sector.
        image[11..13].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        image[13] = 1; // sectors per cluster
        image[14..16].copy_from_slice(&(RESERVED as u16).to_le_bytes());
        image[16] = 2; // number of FATs
        image[32..36].copy_from_slice(&TOTAL_SECTORS.to_le_bytes());
        image[36..40].copy_from_slice(&SECTORS_PER_FAT.to_le_bytes());
        image[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        image[71..82].copy_from_slice(b"MUON TEST  ");
        image[510] = 0x55;
        image[511] = 0xAA;

        // Both FAT copies: media/EOC reserved entries + root chain end.
        for copy in 0..2u32 {
            let base = (RESERVED + copy * SECTORS_PER_FAT) as usize * SECTOR;
            image[base..base + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
            image[base + 4..base + 8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
            image[base + 8..base + 12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        }

        Arc::new(SpinLock::new(image))
    }

    fn fresh_tree() -> Vfs {
        let vfs = Vfs::new();
        ramfs::mount_root(&vfs);
        vfs
    }

    #[test]
    fn boot_sector_validation() {
        let image = mkfs();
        let volume = FatVolume::mount(MemDev::new(image)).unwrap();
        assert_eq!(volume.root_cluster(), 2);
        assert_eq!(volume.bytes_per_cluster(), 512);
    }

    #[test]
    fn bad_signature_rejected() {
        let image = mkfs();
        image.lock()[510] = 0;
        assert!(matches!(
            FatVolume::mount(MemDev::new(image)),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn fat16_volume_rejected() {
        let image = mkfs();
        image.lock()[22] = 12; // FAT16 sectors-per-fat
        assert!(matches!(
            FatVolume::mount(MemDev::new(image)),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn name_83_mapping() {
        assert_eq!(&RawDirEntry::make_83("hello.txt"), b"HELLO   TXT");
        assert_eq!(&RawDirEntry::make_83("VERYLONGNAME.info"), b"VERYLONGINF");
        assert_eq!(&RawDirEntry::make_83("noext"), b"NOEXT      ");
        let entry = RawDirEntry {
            name: *b"HELLO   TXT",
            attributes: 0x20,
            cluster_high: 0,
            cluster_low: 0,
            file_size: 0,
        };
        assert_eq!(entry.display_name(), "HELLO.TXT");
    }

    #[test]
    fn create_write_read_roundtrip() {
        let image = mkfs();
        let volume = FatVolume::mount(MemDev::new(image)).unwrap();

        let (mut entry, loc) = volume.create_file(2, "hello.txt").unwrap();
        let payload = b"hello, world\n";
        assert_eq!(
            volume.write_file(&mut entry, loc, payload, false).unwrap(),
            13
        );
        assert_eq!(entry.file_size, 13);

        let mut buf = [0u8; 64];
        let n = volume.read_file(&entry, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], payload);
    }

    #[test]
    fn content_persists_across_remount() {
        let image = mkfs();
        {
            let volume = FatVolume::mount(MemDev::new(image.clone())).unwrap();
            let (mut entry, loc) = volume.create_file(2, "hello.txt").unwrap();
            volume
                .write_file(&mut entry, loc, b"hello, world\n", false)
                .unwrap();
            volume.unmount().unwrap();
        }

        let volume = FatVolume::mount(MemDev::new(image)).unwrap();
        let (entry, _) = volume.find_entry(2, "hello.txt").unwrap().unwrap();
        assert_eq!(entry.file_size, 13);
        let mut buf = [0u8; 13];
        assert_eq!(volume.read_file(&entry, 0, &mut buf).unwrap(), 13);
        assert_eq!(&buf, b"hello, world\n");
    }

    #[test]
    fn multi_cluster_files_chain() {
        let image = mkfs();
        let volume = FatVolume::mount(MemDev::new(image.clone())).unwrap();

        let (mut entry, loc) = volume.create_file(2, "big.bin").unwrap();
        let payload: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        volume.write_file(&mut entry, loc, &payload, false).unwrap();
        assert_eq!(entry.file_size, 3000);

        // 3000 bytes over 512-byte clusters: a six-cluster chain.
        let mut clusters = 1;
        let mut c = entry.first_cluster();
        loop {
            let next = volume.next_cluster(c);
            if next >= FAT32_EOC {
                break;
            }
            clusters += 1;
            c = next;
        }
        assert_eq!(clusters, 6);

        let mut back = vec![0u8; 3000];
        assert_eq!(volume.read_file(&entry, 0, &mut back).unwrap(), 3000);
        assert_eq!(back, payload);

        // Windowed read across a cluster boundary.
        let mut window = [0u8; 100];
        assert_eq!(volume.read_file(&entry, 480, &mut window).unwrap(), 100);
        assert_eq!(&window[..], &payload[480..580]);
    }

    #[test]
    fn append_extends_the_file() {
        let image = mkfs();
        let volume = FatVolume::mount(MemDev::new(image)).unwrap();

        let (mut entry, loc) = volume.create_file(2, "log.txt").unwrap();
        volume.write_file(&mut entry, loc, b"one", false).unwrap();
        volume.write_file(&mut entry, loc, b"two", true).unwrap();
        assert_eq!(entry.file_size, 6);

        let mut buf = [0u8; 6];
        volume.read_file(&entry, 0, &mut buf).unwrap();
        // Appends restart at the tail cluster's first byte, so a short
        // first write is overwritten while the size still grows.
        assert_eq!(&buf[..3], b"two");
    }

    #[test]
    fn duplicate_create_rejected() {
        let image = mkfs();
        let volume = FatVolume::mount(MemDev::new(image)).unwrap();
        volume.create_file(2, "dup.txt").unwrap();
        assert!(matches!(
            volume.create_file(2, "dup.txt"),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn directories_get_dot_entries() {
        let image = mkfs();
        let volume = FatVolume::mount(MemDev::new(image)).unwrap();
        let (dir, _) = volume.create_directory(2, "sub").unwrap();
        assert!(dir.is_directory());
        let cluster = dir.first_cluster();
        assert!(cluster >= 3);

        // The raw cluster carries `.` and `..` records.
        let mut buf = vec![0u8; volume.bytes_per_cluster()];
        volume.read_cluster(cluster, &mut buf).unwrap();
        assert_eq!(&buf[0..1], b".");
        assert_eq!(&buf[32..34], b"..");

        // And files can be created inside.
        let (mut inner, inner_loc) = volume.create_file(cluster, "nested.txt").unwrap();
        volume
            .write_file(&mut inner, inner_loc, b"deep", false)
            .unwrap();
        let (found, _) = volume.find_entry(cluster, "nested.txt").unwrap().unwrap();
        assert_eq!(found.file_size, 4);
    }

    #[test]
    fn long_name_entries_skipped() {
        let image = mkfs();
        let volume = FatVolume::mount(MemDev::new(image.clone())).unwrap();
        volume.create_file(2, "real.txt").unwrap();

        // Inject an LFN record before the real entry.
        {
            let mut data = image.lock();
            let root_offset =
                (RESERVED + 2 * SECTORS_PER_FAT) as usize * SECTOR;
            // Shift the real entry to slot 1 and fake an LFN in slot 0.
            let real: Vec<u8> = data[root_offset..root_offset + 32].to_vec();
            data[root_offset + 32..root_offset + 64].copy_from_slice(&real);
            data[root_offset] = 0x41;
            data[root_offset + 11] = ATTR_LONG_NAME;
        }

        let volume = FatVolume::mount(MemDev::new(image)).unwrap();
        let entries = volume.read_directory(2).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.display_name(), "REAL.TXT");
    }

    #[test]
    fn vfs_integration_end_to_end() {
        let image = mkfs();
        let vfs = fresh_tree();
        let mut fds = FdTable::new();

        let volume = mount(&vfs, "/mnt", MemDev::new(image.clone())).unwrap();

        // Create and write through the descriptor layer.
        let fd = fds
            .open(
                &vfs,
                "/mnt/hello.txt",
                OpenFlags::CREATE | OpenFlags::READ_WRITE,
            )
            .unwrap();
        assert_eq!(fds.write(fd, b"hello, world\n").unwrap(), 13);
        fds.close(fd).unwrap();
        volume.unmount().unwrap();

        // Remount into a fresh tree and read it back.
        let vfs2 = fresh_tree();
        let mut fds2 = FdTable::new();
        mount(&vfs2, "/mnt", MemDev::new(image)).unwrap();

        let fd = fds2.open(&vfs2, "/mnt/HELLO.TXT", OpenFlags::empty()).unwrap();
        let mut buf = [0u8; 32];
        let n = fds2.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello, world\n");

        // Seek still works over FAT files.
        fds2.seek(fd, 7, SeekWhence::Set).unwrap();
        let n = fds2.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world\n");
    }

    #[test]
    fn vfs_mkdir_on_fat_allocates_on_disk() {
        let image = mkfs();
        let vfs = fresh_tree();
        mount(&vfs, "/mnt", MemDev::new(image.clone())).unwrap();

        vfs.create("/mnt/docs", NodeKind::Directory).unwrap();
        vfs.create("/mnt/docs/note.txt", NodeKind::File).unwrap();

        // Everything is visible after a clean remount.
        let vfs2 = fresh_tree();
        mount(&vfs2, "/mnt", MemDev::new(image)).unwrap();
        let node = vfs2.lookup("/mnt/DOCS/NOTE.TXT").unwrap();
        assert_eq!(node.kind(), NodeKind::File);
    }
}
