//! Segment geometry and the on-disk segment header codec.
//!
//! A store file is a dense sequence of `SEGMENT_SIZE` segments. Each segment
//! starts with a small header: the bundle size (real size on the head
//! segment of a chain, `u64::MAX` otherwise) and the next segment ID in the
//! chain (`u32::MAX` on the last). The rest of the reserved space is zero.

/// Total on-disk size of one segment.
pub const SEGMENT_SIZE: usize = 4096;
/// Bytes reserved for the segment header at the start of each segment.
pub const SEGMENT_RESERVED_SPACE: usize = 20;
/// Payload bytes available per segment.
pub const PER_SEGMENT_PAYLOAD: usize = SEGMENT_SIZE - SEGMENT_RESERVED_SPACE;

/// Index of one segment in the global storage address space.
pub type SegmentId = u32;

/// `next_segment_id` sentinel on the last segment of a chain.
pub const NEXT_SEGMENT_NONE: SegmentId = u32::MAX;
/// `bundle_size_bytes` sentinel on non-head segments (and deleted heads).
pub const SIZE_NON_HEAD: u64 = u64::MAX;

/// Number of segments needed to store `bundle_size_bytes`.
#[must_use]
pub fn segments_required(bundle_size_bytes: u64) -> u64 {
    bundle_size_bytes.div_ceil(PER_SEGMENT_PAYLOAD as u64)
}

/// Decoded segment header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct SegmentHeader {
    pub bundle_size_bytes: u64,
    pub next_segment_id: SegmentId,
}

impl SegmentHeader {
    /// Write the header into the first `SEGMENT_RESERVED_SPACE` bytes of a
    /// segment buffer, zero-filling the reserved remainder.
    pub fn write_to(&self, segment: &mut [u8]) {
        segment[0..8].copy_from_slice(&self.bundle_size_bytes.to_le_bytes());
        segment[8..12].copy_from_slice(&self.next_segment_id.to_le_bytes());
        segment[12..SEGMENT_RESERVED_SPACE].fill(0);
    }

    /// Read the header from the start of a segment buffer.
    pub fn read_from(segment: &[u8]) -> Self {
        let bundle_size_bytes = u64::from_le_bytes(segment[0..8].try_into().expect("8 bytes"));
        let next_segment_id = u32::from_le_bytes(segment[8..12].try_into().expect("4 bytes"));
        SegmentHeader {
            bundle_size_bytes,
            next_segment_id,
        }
    }
}
