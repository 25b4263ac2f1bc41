//! Fixed-size segment allocator
//!
//! Hands out uniform-width segments packed into `BLOCK_SIZE` buffers, each
//! headed by a validity bitmap (bit = 1 ⇔ slot free). Handles are packed
//! 64-bit [`SegmentPointer`]s; block-level fullness is tracked in a set of
//! buffer ids so finding free space is O(1). Compaction is a three-phase
//! vacuum protocol driven by the owning index, which knows where all live
//! handles are stored.

use crate::bitscan;
use crate::block::{BlockFile, BlockPointer};
use crate::buffer::FixedSizeBuffer;
use crate::error::{Result, TesseraError};
use crate::metadata::{MetadataReader, MetadataWriter};
use crate::pointer::SegmentPointer;
use crate::validity::ValidityMask;
use crate::{BLOCK_SIZE, VACUUM_THRESHOLD};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const BITS_PER_WORD: u64 = 64;
const WORD_BYTES: u64 = 8;

pub struct FixedSizeAllocator {
    block_file: Arc<BlockFile>,

    /// Byte width of one segment.
    segment_size: u64,
    /// Number of u64 words in each buffer's bitmap region.
    bitmask_count: u64,
    /// Byte length of the bitmap region (`bitmask_count * 8`).
    bitmask_offset: u64,
    /// Slots per buffer; bitmap plus this many segments fill one block.
    available_segments_per_buffer: u64,

    /// All buffers by id. Ids are unique but not contiguous: vacuum
    /// leaves gaps.
    buffers: BTreeMap<u64, FixedSizeBuffer>,
    /// Ids of buffers with at least one free slot.
    buffers_with_free_space: BTreeSet<u64>,
    /// Ids flagged by the current vacuum pass; empty between passes.
    vacuum_buffers: BTreeSet<u64>,

    /// Live segments across all buffers.
    total_segment_count: u64,
}

impl FixedSizeAllocator {
    /// Create an allocator for segments of `segment_size` bytes.
    ///
    /// Derives the largest per-buffer slot count such that the bitmap
    /// region plus the slots fit in one block:
    /// `ceil(avail / 64) * 8 + avail * segment_size <= BLOCK_SIZE`.
    pub fn new(segment_size: u64, block_file: Arc<BlockFile>) -> Result<Self> {
        if segment_size == 0 || segment_size > BLOCK_SIZE as u64 - WORD_BYTES {
            return Err(TesseraError::InvalidSegmentSize(segment_size));
        }

        let mut byte_count = 0u64;
        let mut bitmask_count = 0u64;
        let mut available_segments_per_buffer = 0u64;

        while byte_count < BLOCK_SIZE as u64 {
            if bitmask_count == 0
                || (bitmask_count * BITS_PER_WORD) % available_segments_per_buffer == 0
            {
                // the current bitmap cannot address more slots; grow it
                // by one word
                bitmask_count += 1;
                byte_count += WORD_BYTES;
            }

            let remaining_bytes = (BLOCK_SIZE as u64).saturating_sub(byte_count);
            let remaining_segments = (remaining_bytes / segment_size).min(BITS_PER_WORD);
            if remaining_segments == 0 {
                break;
            }

            available_segments_per_buffer += remaining_segments;
            byte_count += remaining_segments * segment_size;
        }

        Ok(FixedSizeAllocator {
            block_file,
            segment_size,
            bitmask_count,
            bitmask_offset: bitmask_count * WORD_BYTES,
            available_segments_per_buffer,
            buffers: BTreeMap::new(),
            buffers_with_free_space: BTreeSet::new(),
            vacuum_buffers: BTreeSet::new(),
            total_segment_count: 0,
        })
    }

    /// Allocate one segment and return its handle.
    pub fn allocate(&mut self) -> Result<SegmentPointer> {
        if self.buffers_with_free_space.is_empty() {
            let buffer_id = self.get_available_buffer_id();
            let mut buffer = FixedSizeBuffer::new(Arc::clone(&self.block_file));
            {
                let memory = buffer.pin()?;
                let mut mask = ValidityMask::new(&mut memory[..self.bitmask_offset as usize]);
                mask.set_all_free(self.available_segments_per_buffer);
            }
            self.buffers.insert(buffer_id, buffer);
            self.buffers_with_free_space.insert(buffer_id);
            tracing::trace!(buffer_id, "created segment buffer");
        }

        let buffer_id = match self.buffers_with_free_space.first() {
            Some(&id) => id,
            None => return Err(TesseraError::CorruptBitmap("no buffer with free space")),
        };

        let bitmask_offset = self.bitmask_offset;
        let bitmask_count = self.bitmask_count;
        let buffer = self
            .buffers
            .get_mut(&buffer_id)
            .ok_or(TesseraError::UnknownBuffer(buffer_id))?;

        let segment_count = buffer.segment_count;
        let offset = {
            let memory = buffer.pin()?;
            let mut mask = ValidityMask::new(&mut memory[..bitmask_offset as usize]);
            Self::find_free_offset(&mut mask, segment_count, bitmask_count)?
        };

        buffer.segment_count += 1;
        self.total_segment_count += 1;
        if buffer.segment_count == self.available_segments_per_buffer {
            self.buffers_with_free_space.remove(&buffer_id);
        }

        Ok(SegmentPointer::new(buffer_id, offset))
    }

    /// Release the segment behind `pointer`. Freeing a slot that is not
    /// live is a hard error.
    pub fn free(&mut self, pointer: SegmentPointer) -> Result<()> {
        let buffer_id = pointer.buffer_id();
        let offset = pointer.offset();
        if offset >= self.available_segments_per_buffer {
            return Err(TesseraError::CorruptBitmap("segment offset out of range"));
        }

        let bitmask_offset = self.bitmask_offset;
        let buffer = self
            .buffers
            .get_mut(&buffer_id)
            .ok_or(TesseraError::UnknownBuffer(buffer_id))?;

        {
            let memory = buffer.pin()?;
            let mut mask = ValidityMask::new(&mut memory[..bitmask_offset as usize]);
            if mask.is_free(offset) {
                return Err(TesseraError::DoubleFree { buffer_id, offset });
            }
            mask.set_free(offset);
        }

        debug_assert!(buffer.segment_count > 0);
        debug_assert!(self.total_segment_count > 0);
        buffer.segment_count -= 1;
        self.total_segment_count -= 1;
        self.buffers_with_free_space.insert(buffer_id);
        Ok(())
    }

    /// The segment behind `pointer`, pinning its buffer if it was paged
    /// out.
    pub fn get(&mut self, pointer: SegmentPointer) -> Result<&mut [u8]> {
        debug_assert!(pointer.offset() < self.available_segments_per_buffer);

        let start = (self.bitmask_offset + pointer.offset() * self.segment_size) as usize;
        let end = start + self.segment_size as usize;
        let buffer = self
            .buffers
            .get_mut(&pointer.buffer_id())
            .ok_or(TesseraError::UnknownBuffer(pointer.buffer_id()))?;

        let memory = buffer.pin()?;
        Ok(&mut memory[start..end])
    }

    /// Drop every buffer and all bookkeeping.
    pub fn reset(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.destroy();
        }
        self.buffers.clear();
        self.buffers_with_free_space.clear();
        self.vacuum_buffers.clear();
        self.total_segment_count = 0;
    }

    /// Absorb all buffers of `other`, rebasing its ids above ours.
    /// `other` ends up empty but remains usable.
    ///
    /// Returns the id shift applied to the absorbed buffers; the caller
    /// rebases every handle it obtained from `other` by this amount.
    pub fn merge(&mut self, other: &mut FixedSizeAllocator) -> Result<u64> {
        if self.segment_size != other.segment_size {
            return Err(TesseraError::SegmentSizeMismatch(
                self.segment_size,
                other.segment_size,
            ));
        }
        debug_assert!(self.vacuum_buffers.is_empty());
        debug_assert!(other.vacuum_buffers.is_empty());

        let upper_bound_id = self.upper_bound_buffer_id();
        for (buffer_id, buffer) in std::mem::take(&mut other.buffers) {
            self.buffers.insert(buffer_id + upper_bound_id, buffer);
        }
        for buffer_id in std::mem::take(&mut other.buffers_with_free_space) {
            self.buffers_with_free_space.insert(buffer_id + upper_bound_id);
        }

        self.total_segment_count += other.total_segment_count;
        other.total_segment_count = 0;
        Ok(upper_bound_id)
    }

    /// Phase 1 of a vacuum pass: decide whether compaction pays off and
    /// flag the emptiest in-memory buffers.
    ///
    /// Returns false when there is nothing to do; true when buffers were
    /// flagged and the caller must now rewrite every live handle whose
    /// buffer [`needs_vacuum`](Self::needs_vacuum).
    pub fn initialize_vacuum(&mut self) -> bool {
        if self.total_segment_count == 0 {
            self.reset();
            return false;
        }
        debug_assert!(self.vacuum_buffers.is_empty());

        // (free slots, buffer id); only pinned buffers are candidates
        let mut candidates: BTreeSet<(u64, u64)> = BTreeSet::new();
        let mut available_segments_in_memory = 0u64;
        for (buffer_id, buffer) in &mut self.buffers {
            buffer.vacuum = false; // clear leftovers from an abandoned pass
            if buffer.in_memory() {
                let free_segments = self.available_segments_per_buffer - buffer.segment_count;
                available_segments_in_memory += free_segments;
                candidates.insert((free_segments, *buffer_id));
            }
        }
        if candidates.is_empty() {
            return false;
        }

        // whole buffers' worth of free space currently held in memory;
        // keep at least one candidate to absorb the rewrites
        let excess_buffer_count = ((available_segments_in_memory
            / self.available_segments_per_buffer) as usize)
            .min(candidates.len() - 1);

        let memory_usage = self.memory_usage();
        let excess_memory_usage = excess_buffer_count as u64 * BLOCK_SIZE as u64;
        let excess_percentage = excess_memory_usage as f64 / memory_usage as f64;
        let threshold = VACUUM_THRESHOLD as f64 / 100.0;
        if excess_percentage < threshold {
            tracing::debug!(excess_percentage, "vacuum skipped below threshold");
            return false;
        }

        // drop the fullest candidates; the survivors hold the most free space
        while candidates.len() > excess_buffer_count {
            candidates.pop_first();
        }

        for (_, buffer_id) in candidates {
            if let Some(buffer) = self.buffers.get_mut(&buffer_id) {
                buffer.vacuum = true;
            }
            self.buffers_with_free_space.remove(&buffer_id);
            self.vacuum_buffers.insert(buffer_id);
        }

        tracing::debug!(
            flagged = self.vacuum_buffers.len(),
            "initialized vacuum pass"
        );
        true
    }

    /// Does `pointer` target a buffer flagged by the current vacuum pass?
    /// Callers use this in phase 2 to find the handles they must rewrite.
    pub fn needs_vacuum(&self, pointer: SegmentPointer) -> bool {
        self.buffers
            .get(&pointer.buffer_id())
            .is_some_and(|buffer| buffer.vacuum)
    }

    /// Phase 2: move one live segment out of a flagged buffer and return
    /// its new handle. The live count is conserved.
    pub fn vacuum_pointer(&mut self, pointer: SegmentPointer) -> Result<SegmentPointer> {
        // the old buffer's bitmap is left as-is; the whole buffer goes
        // away when the pass finalizes
        let new_pointer = self.allocate()?;
        // allocate() counted a fresh live segment, but this one only moved
        self.total_segment_count -= 1;

        let segment = self.get(pointer)?.to_vec();
        self.get(new_pointer)?.copy_from_slice(&segment);
        Ok(new_pointer)
    }

    /// Phase 3: destroy and drop every flagged buffer.
    pub fn finalize_vacuum(&mut self) {
        let flagged = std::mem::take(&mut self.vacuum_buffers);
        let count = flagged.len();
        for buffer_id in flagged {
            if let Some(mut buffer) = self.buffers.remove(&buffer_id) {
                debug_assert!(buffer.in_memory());
                buffer.destroy();
            }
        }
        tracing::debug!(destroyed = count, "finalized vacuum pass");
    }

    /// Write every buffer's used prefix to backing storage, then the
    /// allocator directory to `writer`. Returns the directory pointer.
    pub fn serialize(&mut self, writer: &mut MetadataWriter) -> Result<BlockPointer> {
        let bitmask_offset = self.bitmask_offset;
        let bitmask_count = self.bitmask_count;
        let available = self.available_segments_per_buffer;
        let segment_size = self.segment_size;

        let mut directory = Vec::with_capacity(self.buffers.len());
        for (buffer_id, buffer) in &mut self.buffers {
            let max_offset = {
                let memory = buffer.pin()?;
                let mask = ValidityMask::new(&mut memory[..bitmask_offset as usize]);
                Self::max_offset(&mask, bitmask_count, available)
                    .ok_or(TesseraError::EmptyBuffer(*buffer_id))?
            };
            let allocation_size = max_offset * segment_size + bitmask_offset;
            let pointer = buffer.serialize(allocation_size)?;
            directory.push((*buffer_id, pointer, buffer.segment_count, allocation_size));
        }

        let directory_pointer = writer.block_pointer();
        writer.write_u64(segment_size)?;
        writer.write_u64(self.buffers.len() as u64)?;
        writer.write_u64(self.buffers_with_free_space.len() as u64)?;

        for (buffer_id, pointer, segment_count, allocation_size) in directory {
            writer.write_u64(buffer_id)?;
            writer.write_block_pointer(pointer)?;
            writer.write_u64(segment_count)?;
            writer.write_u64(allocation_size)?;
        }
        for buffer_id in &self.buffers_with_free_space {
            writer.write_u64(*buffer_id)?;
        }

        tracing::debug!(
            segment_size,
            buffers = self.buffers.len(),
            "serialized allocator state"
        );
        Ok(directory_pointer)
    }

    /// Rebuild an allocator from a directory written by
    /// [`serialize`](Self::serialize). Buffers stay on disk until touched.
    pub fn deserialize(block_file: Arc<BlockFile>, pointer: BlockPointer) -> Result<Self> {
        let mut reader = MetadataReader::new(Arc::clone(&block_file), pointer)?;
        let segment_size = reader.read_u64()?;
        let buffer_count = reader.read_u64()?;
        let free_space_count = reader.read_u64()?;

        let mut allocator = FixedSizeAllocator::new(segment_size, block_file)?;
        for _ in 0..buffer_count {
            let buffer_id = reader.read_u64()?;
            let block_pointer = reader.read_block_pointer()?;
            let segment_count = reader.read_u64()?;
            let allocation_size = reader.read_u64()?;
            let buffer = FixedSizeBuffer::restore(
                Arc::clone(&allocator.block_file),
                block_pointer,
                segment_count,
                allocation_size,
            );
            allocator.total_segment_count += segment_count;
            allocator.buffers.insert(buffer_id, buffer);
        }
        for _ in 0..free_space_count {
            let buffer_id = reader.read_u64()?;
            allocator.buffers_with_free_space.insert(buffer_id);
        }
        Ok(allocator)
    }

    /// `BLOCK_SIZE` bytes per pinned buffer.
    pub fn memory_usage(&self) -> u64 {
        self.buffers.values().filter(|b| b.in_memory()).count() as u64 * BLOCK_SIZE as u64
    }

    /// Bitmap plus live-segment bytes across pinned buffers; what the
    /// owning index reports to its cache accounting.
    pub fn in_memory_size(&self) -> u64 {
        self.buffers
            .values()
            .filter(|b| b.in_memory())
            .map(|b| self.bitmask_offset + b.segment_count * self.segment_size)
            .sum()
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Maximum slots per buffer.
    pub fn segments_per_buffer(&self) -> u64 {
        self.available_segments_per_buffer
    }

    pub fn total_segment_count(&self) -> u64 {
        self.total_segment_count
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.buffers.keys().copied()
    }

    pub fn buffer_segment_count(&self, buffer_id: u64) -> Option<u64> {
        self.buffers.get(&buffer_id).map(|b| b.segment_count)
    }

    pub fn buffers_with_free_space(&self) -> impl Iterator<Item = u64> + '_ {
        self.buffers_with_free_space.iter().copied()
    }

    /// Cross-check the allocator's bookkeeping against its bitmaps.
    ///
    /// Verifies the free-space set, the per-buffer bitmap counts of pinned
    /// buffers, and the live-segment total. Cheap enough for release-mode
    /// tests; debug builds additionally assert these along the hot paths.
    pub fn check_integrity(&mut self) -> Result<()> {
        let available = self.available_segments_per_buffer;
        let bitmask_offset = self.bitmask_offset;

        let mut total = 0u64;
        for (buffer_id, buffer) in &mut self.buffers {
            total += buffer.segment_count;

            let has_free = buffer.segment_count < available;
            let in_free_set = self.buffers_with_free_space.contains(buffer_id);
            let in_vacuum_set = self.vacuum_buffers.contains(buffer_id);
            if has_free != in_free_set && !in_vacuum_set {
                return Err(TesseraError::CorruptBitmap(
                    "free-space set disagrees with segment counts",
                ));
            }

            if buffer.in_memory() {
                let segment_count = buffer.segment_count;
                let memory = buffer.pin()?;
                let mask = ValidityMask::new(&mut memory[..bitmask_offset as usize]);
                if mask.count_free(available) != available - segment_count {
                    return Err(TesseraError::CorruptBitmap(
                        "bitmap free count disagrees with segment count",
                    ));
                }
            }
        }
        if total != self.total_segment_count {
            return Err(TesseraError::CorruptBitmap(
                "total segment count disagrees with per-buffer counts",
            ));
        }
        if !self.vacuum_buffers.is_subset(&self.buffers.keys().copied().collect()) {
            return Err(TesseraError::CorruptBitmap(
                "vacuum set references unknown buffers",
            ));
        }
        Ok(())
    }

    /// Smallest id not currently in use. Buffer ids are dense except
    /// right after a vacuum, so the scan almost always stops immediately.
    fn get_available_buffer_id(&self) -> u64 {
        let mut buffer_id = self.buffers.len() as u64;
        while self.buffers.contains_key(&buffer_id) {
            buffer_id -= 1;
        }
        buffer_id
    }

    /// One past the largest id in use; merge rebases the other
    /// allocator's ids by this much.
    fn upper_bound_buffer_id(&self) -> u64 {
        self.buffers.keys().next_back().map_or(0, |id| id + 1)
    }

    /// Find and claim a free slot in a buffer known to have one.
    fn find_free_offset(
        mask: &mut ValidityMask,
        segment_count: u64,
        bitmask_count: u64,
    ) -> Result<u64> {
        // fast path: a buffer fills sequentially until its first hole
        if mask.is_free(segment_count) {
            mask.set_used(segment_count);
            return Ok(segment_count);
        }

        for word_idx in 0..bitmask_count {
            let word = mask.word(word_idx);
            if word == 0 {
                continue;
            }
            let offset = word_idx * BITS_PER_WORD + bitscan::find_rightmost_set(word) as u64;
            debug_assert!(mask.is_free(offset));
            mask.set_used(offset);
            return Ok(offset);
        }

        Err(TesseraError::CorruptBitmap(
            "no free bit in a buffer marked as having free space",
        ))
    }

    /// Exclusive upper bound of the used slots, or None for a buffer with
    /// no allocations. `max_offset * segment_size + bitmask_offset` is the
    /// byte length worth serializing.
    fn max_offset(mask: &ValidityMask, bitmask_count: u64, available: u64) -> Option<u64> {
        let mut max_offset = bitmask_count * BITS_PER_WORD;
        let bits_in_last_word = available % BITS_PER_WORD;

        for word_idx in (0..bitmask_count).rev() {
            let mut word = mask.word(word_idx);
            if word_idx == bitmask_count - 1 {
                // bits past the addressable range count as free
                word |= u64::MAX << bits_in_last_word;
            }

            if word == u64::MAX {
                max_offset -= BITS_PER_WORD;
                continue;
            }

            // highest used slot = leftmost clear bit of the free mask
            let highest_used = bitscan::find_leftmost_set(!word) as u64;
            max_offset -= BITS_PER_WORD - highest_used;
            return Some(max_offset + 1);
        }

        None
    }
}
