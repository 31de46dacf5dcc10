//! Block device plumbing.
//!
//! [`BlockController`] is the narrow waist to storage hardware: submit a
//! transfer for N blocks at an LBA and wait for completion. Everything above
//! it is generic: [`BlockNodeOps`] exposes a controller as a VFS node whose
//! read/write take byte offsets, splitting requests into scratch-buffer
//! sized chunks with read-modify-write for unaligned edges, and
//! [`NodeDevice`] adapts such a node to the `hadris_io` traits the FAT32
//! engine consumes.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hadris_io::{Error, ErrorKind, Read, Seek, SeekFrom, Write};
use muon_core::sync::SpinLock;

use crate::error::FsError;
use crate::node::{NodeOps, VfsNode};

/// Size of the per-device scratch buffer: one DMA page.
pub const SCRATCH_SIZE: usize = 4096;

/// Errors from a block controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The requested range is beyond the device capacity.
    OutOfRange,
    /// The controller reported a transfer failure or timeout.
    DeviceError,
}

/// Sector-granular storage: the controller-facing black box.
///
/// Implementations serialize their own command submission; callers may
/// assume `read_blocks`/`write_blocks` are atomic per call.
pub trait BlockController: Send + Sync {
    /// Block size in bytes (typically 512).
    fn block_size(&self) -> usize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Reads `buf.len() / block_size()` blocks starting at `lba`.
    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Writes `buf.len() / block_size()` blocks starting at `lba`.
    fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError>;
}

/// A view of a contiguous slice of another controller, produced by the
/// partition prober.
pub struct PartitionController {
    parent: Arc<dyn BlockController>,
    start_lba: u64,
    block_count: u64,
}

impl PartitionController {
    /// Creates a view over `[start_lba, start_lba + block_count)`.
    pub fn new(parent: Arc<dyn BlockController>, start_lba: u64, block_count: u64) -> Self {
        Self {
            parent,
            start_lba,
            block_count,
        }
    }
}

impl BlockController for PartitionController {
    fn block_size(&self) -> usize {
        self.parent.block_size()
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let blocks = (buf.len() / self.block_size()) as u64;
        if lba + blocks > self.block_count {
            return Err(BlockError::OutOfRange);
        }
        self.parent.read_blocks(self.start_lba + lba, buf)
    }

    fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        let blocks = (buf.len() / self.block_size()) as u64;
        if lba + blocks > self.block_count {
            return Err(BlockError::OutOfRange);
        }
        self.parent.write_blocks(self.start_lba + lba, buf)
    }
}

/// Op table exposing a [`BlockController`] as a VFS node with byte-offset
/// I/O.
///
/// Requests are serialized per device by the scratch-buffer lock and split
/// into chunks bounded by the scratch capacity. Partially covered head and
/// tail blocks go through read-modify-write.
pub struct BlockNodeOps {
    controller: Arc<dyn BlockController>,
    /// Bounce buffer standing in for the DMA page; all controller traffic
    /// moves through it.
    scratch: SpinLock<Vec<u8>>,
}

impl BlockNodeOps {
    /// Wraps a controller. The scratch buffer is one page, rounded up to a
    /// whole number of blocks.
    pub fn new(controller: Arc<dyn BlockController>) -> Self {
        let bs = controller.block_size();
        let capacity = SCRATCH_SIZE.max(bs) / bs * bs;
        Self {
            controller,
            scratch: SpinLock::new(vec![0u8; capacity]),
        }
    }

    /// Device capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.controller.block_count() * self.controller.block_size() as u64
    }
}

impl NodeOps for BlockNodeOps {
    fn read(&self, _node: &VfsNode, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        let capacity = self.capacity();
        if offset as u64 >= capacity {
            return Ok(0);
        }
        let total = buf.len().min((capacity - offset as u64) as usize);
        let bs = self.controller.block_size();
        let mut scratch = self.scratch.lock();

        let mut done = 0usize;
        while done < total {
            let pos = offset + done;
            let lba = (pos / bs) as u64;
            let skip = pos % bs;
            // Whole blocks covered by this chunk, bounded by the scratch.
            let span = (total - done + skip).min(scratch.len());
            let blocks = span.div_ceil(bs);
            let byte_span = blocks * bs;

            self.controller
                .read_blocks(lba, &mut scratch[..byte_span])
                .map_err(|_| FsError::IoError)?;

            let take = (byte_span - skip).min(total - done);
            buf[done..done + take].copy_from_slice(&scratch[skip..skip + take]);
            done += take;
        }
        Ok(total)
    }

    fn write(&self, _node: &VfsNode, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        let capacity = self.capacity();
        if offset as u64 >= capacity {
            return Err(FsError::NoSpace);
        }
        let total = buf.len().min((capacity - offset as u64) as usize);
        let bs = self.controller.block_size();
        let mut scratch = self.scratch.lock();

        let mut done = 0usize;
        while done < total {
            let pos = offset + done;
            let lba = (pos / bs) as u64;
            let skip = pos % bs;
            let span = (total - done + skip).min(scratch.len());
            let blocks = span.div_ceil(bs);
            let byte_span = blocks * bs;

            let take = (byte_span - skip).min(total - done);
            let tail_end = skip + take;

            // Unaligned head or tail: fetch the edge blocks first so the
            // untouched bytes survive.
            if skip != 0 || tail_end % bs != 0 {
                self.controller
                    .read_blocks(lba, &mut scratch[..byte_span])
                    .map_err(|_| FsError::IoError)?;
            }

            scratch[skip..tail_end].copy_from_slice(&buf[done..done + take]);
            self.controller
                .write_blocks(lba, &scratch[..byte_span])
                .map_err(|_| FsError::IoError)?;
            done += take;
        }
        Ok(total)
    }
}

/// Adapts a block-device VFS node to `hadris_io`'s `Read + Write + Seek`,
/// maintaining a byte cursor. This is what the FAT32 engine mounts over.
pub struct NodeDevice {
    node: Arc<VfsNode>,
    position: u64,
    size: u64,
}

impl NodeDevice {
    /// Creates a device view over `node` with the given byte capacity.
    pub fn new(node: Arc<VfsNode>, size: u64) -> Self {
        Self {
            node,
            position: 0,
            size,
        }
    }
}

impl Read for NodeDevice {
    fn read(&mut self, buf: &mut [u8]) -> hadris_io::Result<usize> {
        let ops = self
            .node
            .ops()
            .ok_or_else(|| Error::from_kind(ErrorKind::Other))?;
        let count = ops
            .read(&self.node, buf, self.position as usize)
            .map_err(|_| Error::from_kind(ErrorKind::Other))?;
        self.position += count as u64;
        Ok(count)
    }
}

impl Write for NodeDevice {
    fn write(&mut self, buf: &[u8]) -> hadris_io::Result<usize> {
        let ops = self
            .node
            .ops()
            .ok_or_else(|| Error::from_kind(ErrorKind::Other))?;
        let count = ops
            .write(&self.node, buf, self.position as usize)
            .map_err(|_| Error::from_kind(ErrorKind::Other))?;
        self.position += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> hadris_io::Result<()> {
        Ok(())
    }
}

impl Seek for NodeDevice {
    fn seek(&mut self, pos: SeekFrom) -> hadris_io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.size as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if target < 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "seek before start"));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! RAM-backed block controller for exercising the byte/LBA bridge.

    use super::*;
    use core::cell::RefCell;

    pub struct MemDisk {
        pub data: RefCell<Vec<u8>>,
        pub block_size: usize,
    }

    // SAFETY: Tests are single-threaded.
    unsafe impl Send for MemDisk {}
    unsafe impl Sync for MemDisk {}

    impl MemDisk {
        pub fn new(blocks: u64, block_size: usize) -> Self {
            Self {
                data: RefCell::new(vec![0u8; (blocks * block_size as u64) as usize]),
                block_size,
            }
        }
    }

    impl BlockController for MemDisk {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn block_count(&self) -> u64 {
            (self.data.borrow().len() / self.block_size) as u64
        }

        fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
            let start = lba as usize * self.block_size;
            let data = self.data.borrow();
            let end = start + buf.len();
            if end > data.len() {
                return Err(BlockError::OutOfRange);
            }
            buf.copy_from_slice(&data[start..end]);
            Ok(())
        }

        fn write_blocks(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
            let start = lba as usize * self.block_size;
            let mut data = self.data.borrow_mut();
            let end = start + buf.len();
            if end > data.len() {
                return Err(BlockError::OutOfRange);
            }
            data[start..end].copy_from_slice(buf);
            Ok(())
        }
    }
}
