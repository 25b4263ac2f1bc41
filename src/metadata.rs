//! Typed metadata streams over chained blocks
//!
//! Allocator directories are small, so they are packed into full metadata
//! blocks chained through a next-block link in the first eight bytes of
//! each block. Values are host-width little-endian and never straddle a
//! block boundary; the format is positional, not self-describing, and not
//! portable across word sizes.

use crate::block::{BlockFile, BlockPointer};
use crate::error::{Result, TesseraError};
use crate::BLOCK_SIZE;
use std::sync::Arc;

/// Link value marking the end of a metadata chain.
const NO_NEXT: u64 = u64::MAX;

/// Append-only writer of `u64` / `BlockPointer` values.
pub struct MetadataWriter {
    block_file: Arc<BlockFile>,
    /// Contents of the block being filled; starts with the 8-byte link.
    block: Vec<u8>,
    block_id: u64,
}

impl MetadataWriter {
    pub fn new(block_file: Arc<BlockFile>) -> Self {
        let block_id = block_file.allocate_block();
        let mut block = Vec::with_capacity(BLOCK_SIZE);
        block.extend_from_slice(&NO_NEXT.to_le_bytes());

        MetadataWriter {
            block_file,
            block,
            block_id,
        }
    }

    /// Coordinates of the next value to be written. Callers record this
    /// before writing a directory so they can seek back to it.
    pub fn block_pointer(&self) -> BlockPointer {
        BlockPointer::new(self.block_id, self.block.len() as u32)
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        if self.block.len() + 8 > BLOCK_SIZE {
            self.spill()?;
        }
        self.block.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_block_pointer(&mut self, pointer: BlockPointer) -> Result<()> {
        self.write_u64(pointer.block_id)?;
        self.write_u64(pointer.offset as u64)
    }

    /// Close the current block with a link to a fresh one and move there.
    fn spill(&mut self) -> Result<()> {
        let next_id = self.block_file.allocate_block();
        self.block[..8].copy_from_slice(&next_id.to_le_bytes());
        self.block.resize(BLOCK_SIZE, 0);
        self.block_file.write_block(self.block_id, &self.block)?;

        self.block.clear();
        self.block.extend_from_slice(&NO_NEXT.to_le_bytes());
        self.block_id = next_id;
        Ok(())
    }

    /// Persist the block being filled. The writer stays usable; later
    /// values land in the same block and a later flush rewrites it.
    pub fn flush(&mut self) -> Result<()> {
        let mut block = self.block.clone();
        block.resize(BLOCK_SIZE, 0);
        self.block_file.write_block(self.block_id, &block)?;
        self.block_file.sync()
    }
}

/// Sequential reader positioned at a `BlockPointer`.
pub struct MetadataReader {
    block_file: Arc<BlockFile>,
    block: Vec<u8>,
    offset: usize,
}

impl MetadataReader {
    pub fn new(block_file: Arc<BlockFile>, pointer: BlockPointer) -> Result<Self> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block_file.read_at(BlockPointer::new(pointer.block_id, 0), &mut block)?;

        Ok(MetadataReader {
            block_file,
            block,
            offset: pointer.offset as usize,
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        if self.offset + 8 > BLOCK_SIZE {
            let next = u64::from_le_bytes(self.block[..8].try_into().unwrap());
            if next == NO_NEXT {
                return Err(TesseraError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "metadata stream ended mid-read",
                )));
            }
            self.block_file
                .read_at(BlockPointer::new(next, 0), &mut self.block)?;
            self.offset = 8;
        }

        let value = u64::from_le_bytes(self.block[self.offset..self.offset + 8].try_into().unwrap());
        self.offset += 8;
        Ok(value)
    }

    pub fn read_block_pointer(&mut self) -> Result<BlockPointer> {
        let block_id = self.read_u64()?;
        let offset = self.read_u64()?;
        Ok(BlockPointer::new(block_id, offset as u32))
    }
}
