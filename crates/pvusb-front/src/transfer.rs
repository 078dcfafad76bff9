//! Caller-facing transfer vocabulary: requests, completions, sinks.

use pvusb_proto::iso::PacketDescriptor;
use pvusb_proto::UsbStatus;

use crate::MemoryError;

/// Handle identifying one logical request for cancellation.
///
/// Ids are engine-unique and never reused, unlike the wire correlation id
/// (which is a slot id and recycles with the slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

/// Caller-owned data pages backing a transfer.
///
/// The engine grants each frame to the backend for the lifetime of the
/// request and revokes the grants when the request resolves; it never copies
/// the payload.
#[derive(Clone, Debug)]
pub struct DataPayload {
    /// Page frame numbers covering the buffer, in order.
    pub frames: Vec<u64>,
    /// Byte offset of the payload within the first page.
    pub offset: u16,
    /// Total payload length in bytes.
    pub length: u32,
}

/// Per-kind request parameters.
#[derive(Clone, Debug)]
pub enum TransferKind {
    Control {
        /// The 8-byte SETUP packet, little-endian packed.
        setup: u64,
    },
    Bulk,
    Interrupt,
    Isochronous {
        packets: Vec<PacketDescriptor>,
        /// Start as soon as possible, ignoring `startframe`.
        start_asap: bool,
        startframe: u32,
    },
    /// Reset the target device; carries no payload.
    Reset,
    /// Power-cycle the target's port; carries no payload.
    CyclePort,
    /// Internal control probe reading a small status value into an
    /// engine-owned scratch page; the result is delivered through `aux`.
    ScratchProbe {
        /// The 8-byte SETUP packet, little-endian packed.
        setup: u64,
    },
}

/// One logical request as submitted by a caller.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    /// Endpoint address; bit 7 is the direction bit.
    pub endpoint: u8,
    pub kind: TransferKind,
    /// Allow the device to complete an IN transfer short without error.
    pub short_ok: bool,
    pub data: Option<DataPayload>,
}

/// The specific wire-reported failure carried by a faulted completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportFault {
    Protocol,
    Crc,
    Timeout,
    Stall,
    InputBuffer,
    OutputBuffer,
    Overflow,
    ShortPacket,
    Partial,
    Invalid,
    Reset,
    Shutdown,
    Unknown,
}

/// Terminal outcome kind of a logical request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// The backend reported a wire-level failure; the engine never retries,
    /// retry policy belongs to the caller.
    Fault(TransportFault),
    /// Cancelled before a backend response was consumed.
    Cancelled,
    /// The device disappeared; the channel is dead until reconnected.
    DeviceGone,
}

/// The single completion record delivered for each logical request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub status: CompletionStatus,
    /// Bytes transferred, or the error-packet count for isochronous
    /// transfers.
    pub bytes: u32,
    /// First frame sent (isochronous) or the scratch-probe result value.
    pub aux: u32,
}

impl Completion {
    pub(crate) fn cancelled() -> Self {
        Completion {
            status: CompletionStatus::Cancelled,
            bytes: 0,
            aux: 0,
        }
    }

    pub(crate) fn device_gone() -> Self {
        Completion {
            status: CompletionStatus::DeviceGone,
            bytes: 0,
            aux: 0,
        }
    }

    /// Translates a wire response into the generic outcome delivered to
    /// callers.
    pub(crate) fn from_wire(status: UsbStatus, actual_length: u32, aux: u32) -> Self {
        let status = match status {
            UsbStatus::Ok => CompletionStatus::Success,
            UsbStatus::Canceled => CompletionStatus::Cancelled,
            UsbStatus::DeviceRemoved => CompletionStatus::DeviceGone,
            UsbStatus::Protocol => CompletionStatus::Fault(TransportFault::Protocol),
            UsbStatus::Crc => CompletionStatus::Fault(TransportFault::Crc),
            UsbStatus::Timeout => CompletionStatus::Fault(TransportFault::Timeout),
            UsbStatus::Stalled => CompletionStatus::Fault(TransportFault::Stall),
            UsbStatus::InBuffer => CompletionStatus::Fault(TransportFault::InputBuffer),
            UsbStatus::OutBuffer => CompletionStatus::Fault(TransportFault::OutputBuffer),
            UsbStatus::Overflow => CompletionStatus::Fault(TransportFault::Overflow),
            UsbStatus::ShortPacket => CompletionStatus::Fault(TransportFault::ShortPacket),
            UsbStatus::Partial => CompletionStatus::Fault(TransportFault::Partial),
            UsbStatus::Invalid => CompletionStatus::Fault(TransportFault::Invalid),
            UsbStatus::Reset => CompletionStatus::Fault(TransportFault::Reset),
            UsbStatus::Shutdown => CompletionStatus::Fault(TransportFault::Shutdown),
            // A response is by definition no longer pending; a backend
            // reporting otherwise is confused but not trusted with more than
            // an unknown fault.
            UsbStatus::Pending | UsbStatus::Unknown => {
                CompletionStatus::Fault(TransportFault::Unknown)
            }
        };
        Completion {
            status,
            bytes: actual_length,
            aux,
        }
    }
}

/// Callback invoked exactly once with the terminal outcome.
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send>;

/// Where a request's single terminal outcome goes.
pub enum CompletionSink {
    /// Deliver to caller code. The engine hands the callback back to the
    /// locked front end, which invokes it only after releasing the lock.
    Callback(CompletionCallback),
    /// Internal scratch probe; the outcome lands in the engine's scratch
    /// mailbox and wakes the blocked prober.
    Scratch,
    /// Nobody is listening (internally generated, observer already gone).
    Discard,
}

impl core::fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CompletionSink::Callback(_) => f.write_str("Callback(..)"),
            CompletionSink::Scratch => f.write_str("Scratch"),
            CompletionSink::Discard => f.write_str("Discard"),
        }
    }
}

/// Errors reported synchronously at submission.
///
/// Resource exhaustion is deliberately absent: it is absorbed by the
/// backpressure queue and shows up only as latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("device is gone; channel must be reconnected")]
    DeviceGone,
    #[error("transfer needs {pages} data pages but the protocol addresses at most {max}")]
    TooLarge { pages: usize, max: usize },
    #[error("malformed transfer: {0}")]
    Malformed(&'static str),
    #[error("shared memory fault: {0}")]
    Memory(#[from] MemoryError),
}
