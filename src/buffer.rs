//! One fixed-size buffer: a bitmap region followed by segment slots
//!
//! A buffer is either pinned (its full `BLOCK_SIZE` region held in memory)
//! or evicted to its serialized prefix on disk. Restored buffers stay on
//! disk until something touches them; pinning reads back only the
//! `allocation_size` bytes that were actually serialized.

use crate::block::{BlockFile, BlockPointer};
use crate::error::{Result, TesseraError};
use crate::BLOCK_SIZE;
use std::sync::Arc;

pub struct FixedSizeBuffer {
    block_file: Arc<BlockFile>,
    memory: Option<Box<[u8]>>,
    /// Number of currently allocated slots.
    pub(crate) segment_count: u64,
    /// Set while this buffer is part of an active vacuum pass.
    pub(crate) vacuum: bool,
    /// Where the serialized prefix lives, once one exists.
    on_disk: Option<BlockPointer>,
    /// Length of the serialized prefix: bitmap region plus used slots.
    pub(crate) allocation_size: u64,
}

impl FixedSizeBuffer {
    /// A fresh, pinned, empty buffer. The bitmap region is zeroed; the
    /// allocator initializes it before first use.
    pub fn new(block_file: Arc<BlockFile>) -> Self {
        FixedSizeBuffer {
            block_file,
            memory: Some(vec![0u8; BLOCK_SIZE].into_boxed_slice()),
            segment_count: 0,
            vacuum: false,
            on_disk: None,
            allocation_size: 0,
        }
    }

    /// A buffer known only by its on-disk coordinates. Materialized
    /// lazily on the first pin.
    pub fn restore(
        block_file: Arc<BlockFile>,
        on_disk: BlockPointer,
        segment_count: u64,
        allocation_size: u64,
    ) -> Self {
        FixedSizeBuffer {
            block_file,
            memory: None,
            segment_count,
            vacuum: false,
            on_disk: Some(on_disk),
            allocation_size,
        }
    }

    pub fn in_memory(&self) -> bool {
        self.memory.is_some()
    }

    /// The pinned in-memory region, paging the buffer back in if needed.
    pub fn pin(&mut self) -> Result<&mut [u8]> {
        if self.memory.is_none() {
            let pointer = self.on_disk.ok_or(TesseraError::CorruptBitmap(
                "buffer is neither pinned nor persisted",
            ))?;
            let mut memory = vec![0u8; BLOCK_SIZE].into_boxed_slice();
            self.block_file
                .read_at(pointer, &mut memory[..self.allocation_size as usize])?;
            tracing::trace!(block_id = pointer.block_id, "paged buffer back in");
            self.memory = Some(memory);
        }

        match self.memory.as_deref_mut() {
            Some(memory) => Ok(memory),
            None => Err(TesseraError::CorruptBitmap("buffer failed to pin")),
        }
    }

    /// Persist the first `used_bytes` of this buffer into a fresh block
    /// and record the new coordinates.
    pub fn serialize(&mut self, used_bytes: u64) -> Result<BlockPointer> {
        debug_assert!(used_bytes as usize <= BLOCK_SIZE);

        let block_file = Arc::clone(&self.block_file);
        let memory = self.pin()?;
        let pointer = block_file.write_partial(&memory[..used_bytes as usize])?;
        self.on_disk = Some(pointer);
        self.allocation_size = used_bytes;
        Ok(pointer)
    }

    /// Release the in-memory region. A previously serialized copy stays
    /// on disk.
    pub fn destroy(&mut self) {
        self.memory = None;
    }

    /// Coordinates of the serialized prefix, if the buffer has ever been
    /// serialized.
    pub fn block_pointer(&self) -> Option<BlockPointer> {
        self.on_disk
    }

    /// Drop the pinned region without destroying the buffer; it must have
    /// been serialized first. Used by callers that cap memory usage.
    pub fn unpin(&mut self) -> Result<()> {
        if self.on_disk.is_none() {
            return Err(TesseraError::CorruptBitmap(
                "cannot unpin a buffer that was never serialized",
            ));
        }
        self.memory = None;
        Ok(())
    }
}
