//! Block-granular disk storage
//!
//! The backing file is an array of `BLOCK_SIZE` blocks; block `b` lives at
//! byte offset `b * BLOCK_SIZE`. Buffers and the metadata stream share one
//! `BlockFile` through an `Arc`; the interior mutex serializes file access
//! for them (the allocator itself is single-owner, see the crate docs).

use crate::error::Result;
use crate::BLOCK_SIZE;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// On-disk coordinates: a block id plus a byte offset into that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPointer {
    pub block_id: u64,
    pub offset: u32,
}

impl BlockPointer {
    pub fn new(block_id: u64, offset: u32) -> Self {
        BlockPointer { block_id, offset }
    }
}

struct BlockFileInner {
    file: File,
    next_block_id: u64,
}

/// Disk-backed store of fixed-size blocks
pub struct BlockFile {
    inner: Mutex<BlockFileInner>,
}

impl BlockFile {
    /// Create a new (empty) block file, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(BlockFile {
            inner: Mutex::new(BlockFileInner {
                file,
                next_block_id: 0,
            }),
        })
    }

    /// Open an existing block file. The block count is derived from the
    /// file length (partially written trailing blocks still count).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let next_block_id = len.div_ceil(BLOCK_SIZE as u64);

        Ok(BlockFile {
            inner: Mutex::new(BlockFileInner {
                file,
                next_block_id,
            }),
        })
    }

    /// Reserve a fresh block id. The block's bytes are undefined until
    /// written.
    pub fn allocate_block(&self) -> u64 {
        let mut inner = self.inner.lock();
        let block_id = inner.next_block_id;
        inner.next_block_id += 1;
        block_id
    }

    /// Write `data` (at most `BLOCK_SIZE` bytes) at the start of block
    /// `block_id`.
    pub fn write_block(&self, block_id: u64, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= BLOCK_SIZE);

        let mut inner = self.inner.lock();
        inner
            .file
            .seek(SeekFrom::Start(block_id * BLOCK_SIZE as u64))?;
        inner.file.write_all(data)?;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes starting at `pointer`.
    pub fn read_at(&self, pointer: BlockPointer, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let offset = pointer.block_id * BLOCK_SIZE as u64 + pointer.offset as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    /// Persist a buffer prefix into a fresh block and return its
    /// coordinates. The tail of the block is left unwritten; readers must
    /// only consume the prefix they recorded.
    pub fn write_partial(&self, data: &[u8]) -> Result<BlockPointer> {
        let block_id = self.allocate_block();
        self.write_block(block_id, data)?;
        Ok(BlockPointer::new(block_id, 0))
    }

    /// Number of blocks handed out so far.
    pub fn block_count(&self) -> u64 {
        self.inner.lock().next_block_id
    }

    /// Flush all writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}
