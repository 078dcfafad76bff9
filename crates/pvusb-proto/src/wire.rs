//! Request and response record layouts.
//!
//! Records are packed little-endian at fixed offsets. Encoding writes into a
//! caller-provided slice that must be at least one slot stride long; decoding
//! tolerates any slice carrying at least the fixed prefix so a hostile peer
//! cannot make the frontend read out of bounds.

use crate::{GrantToken, ProtocolVersion};

/// Fixed request prefix before the inline segment array, in bytes.
pub const REQUEST_PREFIX_LEN: usize = 32;

/// Response record length, in bytes (the remainder of the slot is unused).
pub const RESPONSE_LEN: usize = 20;

/// Request flag: the device may complete an IN transfer short of `length`
/// without reporting an error.
pub const FLAG_SHORT_OK: u8 = 1 << 0;
/// Request flag: reset the target device before anything else.
pub const FLAG_RESET_TARGET: u8 = 1 << 1;
/// Request flag: start an isochronous stream as soon as possible, ignoring
/// the start-frame hint.
pub const FLAG_ISO_ASAP: u8 = 1 << 2;
/// Request flag: the inline segments carry grants of indirect pages rather
/// than of data pages.
pub const FLAG_INDIRECT: u8 = 1 << 3;
/// Request flag: power-cycle the port the target sits on.
pub const FLAG_CYCLE_PORT: u8 = 1 << 4;

const OFF_ID: usize = 0;
const OFF_SETUP: usize = 8;
const OFF_TYPE: usize = 16;
const OFF_ENDPOINT: usize = 17;
const OFF_OFFSET: usize = 18;
const OFF_LENGTH: usize = 20;
const OFF_NR_SEGMENTS: usize = 24;
const OFF_FLAGS: usize = 25;
const OFF_NR_PACKETS: usize = 26;
const OFF_STARTFRAME: usize = 28;
const OFF_SEGMENTS: usize = 32;

const RSP_OFF_ID: usize = 0;
const RSP_OFF_ACTUAL: usize = 8;
const RSP_OFF_AUX: usize = 12;
const RSP_OFF_STATUS: usize = 16;

/// Transfer kind carried in the request `type` byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferType {
    pub const fn raw(self) -> u8 {
        match self {
            TransferType::Control => 0,
            TransferType::Bulk => 1,
            TransferType::Interrupt => 2,
            TransferType::Isochronous => 3,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(TransferType::Control),
            1 => Some(TransferType::Bulk),
            2 => Some(TransferType::Interrupt),
            3 => Some(TransferType::Isochronous),
            _ => None,
        }
    }
}

/// One guest-to-backend request record.
///
/// `segments` is sized for the largest protocol revision; only the first
/// `nr_segments` entries are valid and only the revision's inline capacity is
/// ever encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Correlation key, echoed verbatim in the response.
    pub id: u64,
    /// 8-byte command/setup payload (a USB SETUP packet for control
    /// transfers, otherwise zero).
    pub setup: u64,
    pub transfer_type: TransferType,
    /// Endpoint address; bit 7 is the direction bit (set = device-to-host).
    pub endpoint: u8,
    /// Byte offset of the payload within the first data page.
    pub offset: u16,
    /// Total transfer length in bytes, excluding the setup packet.
    pub length: u32,
    /// Number of valid entries in `segments`.
    pub nr_segments: u8,
    pub flags: u8,
    /// Isochronous packet count; zero for other transfer kinds.
    pub nr_packets: u16,
    /// Isochronous start-frame hint; ignored when `FLAG_ISO_ASAP` is set.
    pub startframe: u32,
    pub segments: Vec<GrantToken>,
}

impl RequestDescriptor {
    /// An empty descriptor with the given correlation id.
    pub fn new(id: u64) -> Self {
        RequestDescriptor {
            id,
            setup: 0,
            transfer_type: TransferType::Control,
            endpoint: 0,
            offset: 0,
            length: 0,
            nr_segments: 0,
            flags: 0,
            nr_packets: 0,
            startframe: 0,
            segments: Vec::new(),
        }
    }

    /// Encodes the record into `slot`, which must be at least one slot stride
    /// of `version` long. Segments beyond the revision's inline capacity are
    /// never written; callers are expected to have respected the capacity
    /// when building the request.
    pub fn encode(&self, version: ProtocolVersion, slot: &mut [u8]) {
        assert!(slot.len() >= version.slot_stride());
        slot[..version.slot_stride()].fill(0);

        slot[OFF_ID..OFF_ID + 8].copy_from_slice(&self.id.to_le_bytes());
        slot[OFF_SETUP..OFF_SETUP + 8].copy_from_slice(&self.setup.to_le_bytes());
        slot[OFF_TYPE] = self.transfer_type.raw();
        slot[OFF_ENDPOINT] = self.endpoint;
        slot[OFF_OFFSET..OFF_OFFSET + 2].copy_from_slice(&self.offset.to_le_bytes());
        slot[OFF_LENGTH..OFF_LENGTH + 4].copy_from_slice(&self.length.to_le_bytes());
        slot[OFF_NR_SEGMENTS] = self.nr_segments;
        slot[OFF_FLAGS] = self.flags;
        slot[OFF_NR_PACKETS..OFF_NR_PACKETS + 2].copy_from_slice(&self.nr_packets.to_le_bytes());
        slot[OFF_STARTFRAME..OFF_STARTFRAME + 4].copy_from_slice(&self.startframe.to_le_bytes());

        let n = (self.nr_segments as usize).min(version.inline_segments());
        for (i, seg) in self.segments.iter().take(n).enumerate() {
            let off = OFF_SEGMENTS + i * 4;
            slot[off..off + 4].copy_from_slice(&seg.0.to_le_bytes());
        }
    }

    /// Decodes a request record (used by tests playing the backend).
    pub fn decode(version: ProtocolVersion, slot: &[u8]) -> Option<Self> {
        if slot.len() < version.slot_stride() {
            return None;
        }
        let transfer_type = TransferType::from_raw(slot[OFF_TYPE])?;
        let nr_segments = slot[OFF_NR_SEGMENTS];
        let n = (nr_segments as usize).min(version.inline_segments());
        let mut segments = Vec::with_capacity(n);
        for i in 0..n {
            let off = OFF_SEGMENTS + i * 4;
            segments.push(GrantToken(u32::from_le_bytes(
                slot[off..off + 4].try_into().ok()?,
            )));
        }
        Some(RequestDescriptor {
            id: u64::from_le_bytes(slot[OFF_ID..OFF_ID + 8].try_into().ok()?),
            setup: u64::from_le_bytes(slot[OFF_SETUP..OFF_SETUP + 8].try_into().ok()?),
            transfer_type,
            endpoint: slot[OFF_ENDPOINT],
            offset: u16::from_le_bytes(slot[OFF_OFFSET..OFF_OFFSET + 2].try_into().ok()?),
            length: u32::from_le_bytes(slot[OFF_LENGTH..OFF_LENGTH + 4].try_into().ok()?),
            nr_segments,
            flags: slot[OFF_FLAGS],
            nr_packets: u16::from_le_bytes(slot[OFF_NR_PACKETS..OFF_NR_PACKETS + 2].try_into().ok()?),
            startframe: u32::from_le_bytes(slot[OFF_STARTFRAME..OFF_STARTFRAME + 4].try_into().ok()?),
            segments,
        })
    }
}

/// One backend-to-guest response record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseDescriptor {
    /// Correlation key copied from the request.
    pub id: u64,
    /// Bytes transferred, or the error-packet count for isochronous
    /// transfers.
    pub actual_length: u32,
    /// First frame sent (isochronous) or the scratch-probe result value.
    pub aux: u32,
    /// Signed wire status code; see [`crate::UsbStatus`].
    pub status: i16,
}

impl ResponseDescriptor {
    pub fn encode(&self, slot: &mut [u8]) {
        assert!(slot.len() >= RESPONSE_LEN);
        slot[RSP_OFF_ID..RSP_OFF_ID + 8].copy_from_slice(&self.id.to_le_bytes());
        slot[RSP_OFF_ACTUAL..RSP_OFF_ACTUAL + 4].copy_from_slice(&self.actual_length.to_le_bytes());
        slot[RSP_OFF_AUX..RSP_OFF_AUX + 4].copy_from_slice(&self.aux.to_le_bytes());
        slot[RSP_OFF_STATUS..RSP_OFF_STATUS + 2].copy_from_slice(&self.status.to_le_bytes());
        slot[RSP_OFF_STATUS + 2..RESPONSE_LEN].fill(0);
    }

    pub fn decode(slot: &[u8]) -> Option<Self> {
        if slot.len() < RESPONSE_LEN {
            return None;
        }
        Some(ResponseDescriptor {
            id: u64::from_le_bytes(slot[RSP_OFF_ID..RSP_OFF_ID + 8].try_into().ok()?),
            actual_length: u32::from_le_bytes(
                slot[RSP_OFF_ACTUAL..RSP_OFF_ACTUAL + 4].try_into().ok()?,
            ),
            aux: u32::from_le_bytes(slot[RSP_OFF_AUX..RSP_OFF_AUX + 4].try_into().ok()?),
            status: i16::from_le_bytes(slot[RSP_OFF_STATUS..RSP_OFF_STATUS + 2].try_into().ok()?),
        })
    }
}
