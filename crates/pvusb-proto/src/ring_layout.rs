//! Shared-page ring geometry.
//!
//! The shared page starts with four free-running u32 indices followed by the
//! slot array. Producer/consumer progress and notification suppression both
//! ride on these indices:
//!
//! | offset | field     | written by | meaning                                   |
//! |--------|-----------|------------|-------------------------------------------|
//! | 0      | req_prod  | frontend   | requests produced so far                   |
//! | 4      | req_event | backend    | notify backend when req_prod reaches this  |
//! | 8      | rsp_prod  | backend    | responses produced so far                  |
//! | 12     | rsp_event | frontend   | notify frontend when rsp_prod reaches this |
//!
//! Indices are free-running; a slot index is `idx & (capacity - 1)`. The
//! fields written by the backend are peer-controlled and must be validated by
//! the consumer before use.

use crate::ProtocolVersion;

/// Size of the shared ring page, in bytes.
pub const RING_PAGE_SIZE: usize = 4096;

/// Bytes occupied by the index header at the start of the shared page.
pub const RING_HEADER_LEN: usize = 16;

/// Byte offset of `req_prod` within the shared page.
pub const OFF_REQ_PROD: usize = 0;
/// Byte offset of `req_event` within the shared page.
pub const OFF_REQ_EVENT: usize = 4;
/// Byte offset of `rsp_prod` within the shared page.
pub const OFF_RSP_PROD: usize = 8;
/// Byte offset of `rsp_event` within the shared page.
pub const OFF_RSP_EVENT: usize = 12;

/// Slot count and addressing for one protocol revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingGeometry {
    version: ProtocolVersion,
    capacity: u32,
}

impl RingGeometry {
    /// Geometry for `version` on a standard [`RING_PAGE_SIZE`] page: the
    /// largest power of two of slots that fits after the header.
    pub fn for_version(version: ProtocolVersion) -> Self {
        let raw = (RING_PAGE_SIZE - RING_HEADER_LEN) / version.slot_stride();
        // Largest power of two <= raw; raw is always >= 1 for the supported
        // strides.
        let capacity = 1u32 << (31 - (raw as u32).leading_zeros());
        RingGeometry { version, capacity }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Number of slots in the ring; also the bound on outstanding requests.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Byte offset of the slot a free-running index maps to.
    pub fn slot_offset(&self, index: u32) -> usize {
        let slot = (index & (self.capacity - 1)) as usize;
        RING_HEADER_LEN + slot * self.version.slot_stride()
    }

    /// Whether a free-running id is a plausible slot id for this ring.
    pub fn id_in_range(&self, id: u64) -> bool {
        id < u64::from(self.capacity)
    }
}
