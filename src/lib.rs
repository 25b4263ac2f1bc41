//! Tessera: fixed-size segment allocator
//!
//! Backing store for on-disk index structures (adaptive radix tree nodes
//! and friends) inside an embedded analytical database. Nodes of one byte
//! width are packed densely into fixed 256 KiB blocks, addressed through
//! compact 64-bit handles, and periodically compacted so storage stays
//! proportional to live data.
//!
//! ## Features
//!
//! - **O(1) free-space discovery** via a set of non-full buffer ids
//! - **Constant-time bit scans** to find free and highest-used slots
//! - **Packed 64-bit handles** (buffer id + segment offset) that index
//!   structures embed directly in their nodes
//! - **Three-phase vacuum** that rewrites live segments out of the
//!   emptiest buffers and reclaims whole blocks
//! - **Durable state**: buffer prefixes plus a directory written through
//!   a typed metadata stream
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Buffer (256 KiB block)                       │
//! ├──────────────────────────────────────────────┤
//! │ Validity bitmap: bitmask_count × 8 bytes     │
//! │  - bit = 1 ⇔ slot free                       │
//! ├──────────────────────────────────────────────┤
//! │ Slot 0 │ Slot 1 │ ... │ Slot avail-1         │
//! │  - each segment_size bytes                   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera::{BlockFile, FixedSizeAllocator};
//!
//! let file = Arc::new(BlockFile::create("index.tsr").unwrap());
//! let mut allocator = FixedSizeAllocator::new(64, file).unwrap();
//!
//! let ptr = allocator.allocate().unwrap();
//! allocator.get(ptr).unwrap()[..4].copy_from_slice(b"node");
//!
//! assert_eq!(allocator.total_segment_count(), 1);
//! allocator.free(ptr).unwrap();
//! ```
//!
//! ## Ownership model
//!
//! An allocator is owned by one index structure which serializes all
//! mutations; there is no internal synchronization. The vacuum protocol
//! is driven by that owner, because only it knows where every live
//! handle is stored.

pub mod allocator;
pub mod bitscan;
pub mod block;
pub mod buffer;
pub mod error;
pub mod metadata;
pub mod pointer;
pub mod validity;

pub use allocator::FixedSizeAllocator;
pub use block::{BlockFile, BlockPointer};
pub use buffer::FixedSizeBuffer;
pub use error::{Result, TesseraError};
pub use metadata::{MetadataReader, MetadataWriter};
pub use pointer::SegmentPointer;
pub use validity::ValidityMask;

/// Size of one storage block (and therefore of one buffer).
pub const BLOCK_SIZE: usize = 256 * 1024;

/// Vacuum when at least this percentage of allocator memory is whole
/// buffers' worth of free space.
pub const VACUUM_THRESHOLD: u64 = 10;
