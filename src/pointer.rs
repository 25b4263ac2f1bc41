//! Packed 64-bit segment handles
//!
//! Index structures store these inside their nodes, so the representation
//! must stay exactly eight bytes and round-trip through serialization.

/// Opaque handle to one allocated segment: a 32-bit buffer id in the upper
/// half and a 32-bit segment offset in the lower half. The all-zero value
/// is reserved as null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentPointer(u64);

impl SegmentPointer {
    /// The distinguished null handle.
    pub const NULL: SegmentPointer = SegmentPointer(0);

    pub fn new(buffer_id: u64, offset: u64) -> Self {
        debug_assert!(buffer_id <= u32::MAX as u64);
        debug_assert!(offset <= u32::MAX as u64);
        SegmentPointer(buffer_id << 32 | offset)
    }

    pub fn buffer_id(self) -> u64 {
        self.0 >> 32
    }

    /// Offset within the buffer, in segments (not bytes).
    pub fn offset(self) -> u64 {
        self.0 & u32::MAX as u64
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw representation, for callers that embed handles in their nodes.
    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        SegmentPointer(raw)
    }
}
