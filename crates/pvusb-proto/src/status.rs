//! Wire status codes.
//!
//! The backend reports completion status as a small signed integer. The
//! enumeration is fixed by the protocol; codes a frontend does not recognize
//! decode to [`UsbStatus::Unknown`] rather than failing, so a newer backend
//! cannot wedge an older frontend.

/// Signed status code carried in a response record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbStatus {
    /// Transfer completed successfully.
    Ok,
    /// Still in flight; never valid in a delivered response.
    Pending,
    /// Cancelled on the backend side.
    Canceled,
    /// USB protocol error on the wire.
    Protocol,
    /// CRC mismatch.
    Crc,
    /// The device did not answer in time.
    Timeout,
    /// Endpoint stalled.
    Stalled,
    /// Device-to-host buffer error.
    InBuffer,
    /// Host-to-device buffer error.
    OutBuffer,
    /// The device sent more data than the request allowed.
    Overflow,
    /// The device sent less data than requested and short packets were not
    /// allowed.
    ShortPacket,
    /// The device is gone.
    DeviceRemoved,
    /// Only part of an isochronous stream was delivered.
    Partial,
    /// The backend rejected the request as malformed.
    Invalid,
    /// The device was reset while the transfer was in flight.
    Reset,
    /// The backend is shutting down.
    Shutdown,
    /// Any code this frontend does not recognize.
    Unknown,
}

impl UsbStatus {
    pub const fn raw(self) -> i16 {
        match self {
            UsbStatus::Ok => 0,
            UsbStatus::Pending => -1,
            UsbStatus::Canceled => -2,
            UsbStatus::Protocol => -3,
            UsbStatus::Crc => -4,
            UsbStatus::Timeout => -5,
            UsbStatus::Stalled => -6,
            UsbStatus::InBuffer => -7,
            UsbStatus::OutBuffer => -8,
            UsbStatus::Overflow => -9,
            UsbStatus::ShortPacket => -10,
            UsbStatus::DeviceRemoved => -11,
            UsbStatus::Partial => -12,
            UsbStatus::Invalid => -13,
            UsbStatus::Reset => -14,
            UsbStatus::Shutdown => -15,
            UsbStatus::Unknown => -16,
        }
    }

    pub fn from_raw(raw: i16) -> Self {
        match raw {
            0 => UsbStatus::Ok,
            -1 => UsbStatus::Pending,
            -2 => UsbStatus::Canceled,
            -3 => UsbStatus::Protocol,
            -4 => UsbStatus::Crc,
            -5 => UsbStatus::Timeout,
            -6 => UsbStatus::Stalled,
            -7 => UsbStatus::InBuffer,
            -8 => UsbStatus::OutBuffer,
            -9 => UsbStatus::Overflow,
            -10 => UsbStatus::ShortPacket,
            -11 => UsbStatus::DeviceRemoved,
            -12 => UsbStatus::Partial,
            -13 => UsbStatus::Invalid,
            -14 => UsbStatus::Reset,
            -15 => UsbStatus::Shutdown,
            _ => UsbStatus::Unknown,
        }
    }
}
