//! Wire protocol for the pvusb paravirtual USB transport.
//!
//! A pvusb frontend shares a single page of memory with a device-emulating
//! backend. The page holds a fixed-capacity circular ring of fixed-size
//! records plus four free-running indices, and every data page referenced by
//! a request is identified by an opaque grant token rather than an address.
//!
//! This crate is deliberately pure: it defines the record layouts, the ring
//! geometry, the status-code enumeration, and the indirect-page layout, and
//! it encodes/decodes them against byte slices. It holds no engine state and
//! performs no I/O; the transport engine lives in `pvusb-front`.
//!
//! Layout rules:
//! - everything on the wire is little-endian and packed at fixed offsets;
//! - requests and responses share the same slot array (the backend overwrites
//!   a consumed request slot with its response);
//! - ring capacity is the largest power of two of `(page - header) / stride`,
//!   so free-running indices can be masked instead of wrapped.

pub mod indirect;
pub mod iso;
pub mod ring_layout;
pub mod status;
pub mod wire;

pub use ring_layout::{RingGeometry, RING_HEADER_LEN, RING_PAGE_SIZE};
pub use status::UsbStatus;
pub use wire::{
    RequestDescriptor, ResponseDescriptor, TransferType, FLAG_CYCLE_PORT, FLAG_INDIRECT,
    FLAG_ISO_ASAP, FLAG_RESET_TARGET, FLAG_SHORT_OK, RESPONSE_LEN,
};

/// Opaque handle identifying one page granted to the backend.
///
/// A token is owned exactly once between acquisition and release; the numeric
/// value is meaningful only to the grant mechanism that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GrantToken(pub u32);

/// Protocol revisions supported by the frontend.
///
/// The revisions differ only in inline segment capacity (and therefore in
/// slot stride and ring capacity); the record prefix is identical.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// 16 inline segments, 128-byte slot stride.
    V1,
    /// 65 inline segments, 512-byte slot stride.
    V2,
}

impl ProtocolVersion {
    /// Number of inline grant-token slots in a request record.
    pub const fn inline_segments(self) -> usize {
        match self {
            ProtocolVersion::V1 => 16,
            ProtocolVersion::V2 => 65,
        }
    }

    /// Distance between consecutive ring slots, in bytes.
    ///
    /// The request record (32-byte prefix + 4 bytes per inline segment) is
    /// rounded up to a power of two so slot offsets are shift/mask friendly.
    pub const fn slot_stride(self) -> usize {
        match self {
            ProtocolVersion::V1 => 128,
            ProtocolVersion::V2 => 512,
        }
    }

    /// Maximum number of indirect pages a single request may reference.
    ///
    /// When the indirect flag is set every inline segment carries the grant
    /// of one indirect page, so the bound is the inline capacity.
    pub const fn max_indirect_pages(self) -> usize {
        self.inline_segments()
    }
}
