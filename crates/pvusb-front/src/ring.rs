//! The shared request/response ring.
//!
//! A classic bounded single-producer/single-consumer ring on one shared
//! page, with Xen-style notification suppression: each side only signals the
//! other when the other asked to be woken at the index just produced.
//!
//! The peer is less trusted than the frontend. `rsp_prod` and `req_event`
//! are peer-written; both are validated before use. A `rsp_prod` claiming
//! more responses than the frontend has requests outstanding is clamped and
//! reported, never believed.

use pvusb_proto::ring_layout::{
    RingGeometry, OFF_REQ_EVENT, OFF_REQ_PROD, OFF_RSP_EVENT, OFF_RSP_PROD,
};
use pvusb_proto::{RequestDescriptor, ResponseDescriptor, RESPONSE_LEN};

use tracing::warn;

use crate::{MemoryBus, MemoryError};

/// Out-of-band signal to the backend (an event channel, doorbell, or
/// equivalent). Shared by every submitting thread, hence `Sync`.
pub trait EventChannel: Send + Sync {
    fn notify(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// `producer - consumer` would exceed the ring capacity. Admission
    /// control makes this unreachable; hitting it is an engine bug.
    #[error("ring full: producing would overrun the consumer")]
    Full,
    #[error("shared memory fault: {0}")]
    Memory(#[from] MemoryError),
}

/// What the consumer saw when it snapshot the peer's response producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseWindow {
    /// Validated free-running index one past the last available response.
    pub end: u32,
    /// The peer advertised more responses than requests outstanding; the
    /// window was clamped and the excess must be reported.
    pub clamped: bool,
}

pub struct RingChannel {
    geometry: RingGeometry,
    /// Byte address of the shared ring page.
    base: u64,
    /// Private request-producer index; the shared copy is published on
    /// submit.
    req_prod: u32,
    /// Private response-consumer index; the shared `rsp_event` is derived
    /// from it during the final check.
    rsp_cons: u32,
}

impl RingChannel {
    pub fn new(geometry: RingGeometry, base: u64) -> Self {
        RingChannel {
            geometry,
            base,
            req_prod: 0,
            rsp_cons: 0,
        }
    }

    /// Resets the shared indices to a pristine, empty ring.
    ///
    /// Both event indices start at 1: each side wants to be woken by the
    /// very first record the other produces, so the first submit after init
    /// always notifies.
    pub fn init(&mut self, mem: &mut dyn MemoryBus) -> Result<(), MemoryError> {
        self.req_prod = 0;
        self.rsp_cons = 0;
        mem.write_u32(self.base + OFF_REQ_PROD as u64, 0)?;
        mem.write_u32(self.base + OFF_REQ_EVENT as u64, 1)?;
        mem.write_u32(self.base + OFF_RSP_PROD as u64, 0)?;
        mem.write_u32(self.base + OFF_RSP_EVENT as u64, 1)?;
        Ok(())
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub fn req_prod(&self) -> u32 {
        self.req_prod
    }

    pub fn rsp_cons(&self) -> u32 {
        self.rsp_cons
    }

    /// Ring entries currently occupied by requests without a consumed
    /// response.
    pub fn in_flight(&self) -> u32 {
        self.req_prod.wrapping_sub(self.rsp_cons)
    }

    /// Copies the descriptor into the next producer slot, publishes the new
    /// producer index, and returns whether the backend needs a notification
    /// (the standard "did the producer cross the peer's event index" check).
    pub fn submit(
        &mut self,
        mem: &mut dyn MemoryBus,
        req: &RequestDescriptor,
    ) -> Result<bool, RingError> {
        if self.in_flight() >= self.geometry.capacity() {
            return Err(RingError::Full);
        }

        let stride = self.geometry.version().slot_stride();
        let mut slot = vec![0u8; stride];
        req.encode(self.geometry.version(), &mut slot);
        let off = self.geometry.slot_offset(self.req_prod);
        mem.write_physical(self.base + off as u64, &slot)?;

        let old = self.req_prod;
        let new = old.wrapping_add(1);
        self.req_prod = new;
        mem.write_u32(self.base + OFF_REQ_PROD as u64, new)?;

        let req_event = mem.read_u32(self.base + OFF_REQ_EVENT as u64)?;
        // Notify iff req_event lies in (old, new]; free-running arithmetic.
        Ok(new.wrapping_sub(req_event) < new.wrapping_sub(old))
    }

    /// Snapshots and validates the peer's response-producer index.
    pub fn response_window(&self, mem: &dyn MemoryBus) -> Result<ResponseWindow, MemoryError> {
        let rsp_prod = mem.read_u32(self.base + OFF_RSP_PROD as u64)?;
        let avail = rsp_prod.wrapping_sub(self.rsp_cons);
        if avail > self.in_flight() {
            warn!(
                rsp_prod,
                rsp_cons = self.rsp_cons,
                req_prod = self.req_prod,
                "peer advertised more responses than requests outstanding; clamping"
            );
            return Ok(ResponseWindow { end: self.req_prod, clamped: true });
        }
        Ok(ResponseWindow { end: rsp_prod, clamped: false })
    }

    /// Reads the response record at a free-running index within the window.
    pub fn read_response(
        &self,
        mem: &dyn MemoryBus,
        index: u32,
    ) -> Result<ResponseDescriptor, RingError> {
        let off = self.geometry.slot_offset(index);
        let mut slot = [0u8; RESPONSE_LEN];
        mem.read_physical(self.base + off as u64, &mut slot)?;
        // RESPONSE_LEN bytes always decode.
        Ok(ResponseDescriptor::decode(&slot).unwrap_or(ResponseDescriptor {
            id: u64::MAX,
            actual_length: 0,
            aux: 0,
            status: 0,
        }))
    }

    /// Advances the consumer past a drained window.
    pub fn consume_to(&mut self, index: u32) {
        debug_assert!(index.wrapping_sub(self.rsp_cons) <= self.geometry.capacity());
        self.rsp_cons = index;
    }

    /// Notify-suppression bookkeeping after a drain: asks the peer to signal
    /// at the next response, then reports whether responses raced in while
    /// the event index was being published.
    pub fn final_check(&mut self, mem: &mut dyn MemoryBus) -> Result<bool, MemoryError> {
        mem.write_u32(
            self.base + OFF_RSP_EVENT as u64,
            self.rsp_cons.wrapping_add(1),
        )?;
        let window = self.response_window(mem)?;
        Ok(window.end.wrapping_sub(self.rsp_cons) > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvusb_proto::ProtocolVersion;

    struct TestMemory {
        data: Vec<u8>,
    }

    impl MemoryBus for TestMemory {
        fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
            let addr = paddr as usize;
            if addr + buf.len() > self.data.len() {
                return Err(MemoryError::OutOfBounds { addr: paddr, len: buf.len() });
            }
            buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
            Ok(())
        }

        fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
            let addr = paddr as usize;
            if addr + buf.len() > self.data.len() {
                return Err(MemoryError::OutOfBounds { addr: paddr, len: buf.len() });
            }
            self.data[addr..addr + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    fn ring() -> (TestMemory, RingChannel) {
        let mut mem = TestMemory { data: vec![0u8; 4096] };
        let mut ring = RingChannel::new(RingGeometry::for_version(ProtocolVersion::V1), 0);
        ring.init(&mut mem).unwrap();
        (mem, ring)
    }

    fn peer_respond(mem: &mut TestMemory, ring: &RingChannel, index: u32, rsp: ResponseDescriptor) {
        let off = ring.geometry().slot_offset(index);
        let mut slot = [0u8; RESPONSE_LEN];
        rsp.encode(&mut slot);
        mem.write_physical(off as u64, &slot).unwrap();
        mem.write_u32(OFF_RSP_PROD as u64, index.wrapping_add(1)).unwrap();
    }

    #[test]
    fn submit_publishes_the_producer_index() {
        let (mut mem, mut ring) = ring();
        let req = RequestDescriptor::new(3);
        ring.submit(&mut mem, &req).unwrap();
        assert_eq!(mem.read_u32(OFF_REQ_PROD as u64).unwrap(), 1);
        let decoded =
            RequestDescriptor::decode(ProtocolVersion::V1, &mem.data[ring.geometry().slot_offset(0)..])
                .unwrap();
        assert_eq!(decoded.id, 3);
    }

    #[test]
    fn notify_fires_only_when_crossing_the_event_index() {
        let (mut mem, mut ring) = ring();
        // Init arms req_event at 1, so the first request after init must
        // notify without the peer writing anything: a backend that waits
        // for the frontend's kick would otherwise never scan the ring.
        assert_eq!(mem.read_u32(OFF_REQ_EVENT as u64).unwrap(), 1);
        assert!(ring.submit(&mut mem, &RequestDescriptor::new(0)).unwrap());
        // Peer has not re-armed: no further notifications.
        assert!(!ring.submit(&mut mem, &RequestDescriptor::new(1)).unwrap());
        assert!(!ring.submit(&mut mem, &RequestDescriptor::new(2)).unwrap());
        // Re-armed at the next request.
        mem.write_u32(OFF_REQ_EVENT as u64, 4).unwrap();
        assert!(ring.submit(&mut mem, &RequestDescriptor::new(3)).unwrap());
    }

    #[test]
    fn producer_never_overruns_capacity() {
        let (mut mem, mut ring) = ring();
        let cap = ring.geometry().capacity();
        for i in 0..cap {
            ring.submit(&mut mem, &RequestDescriptor::new(u64::from(i))).unwrap();
        }
        assert_eq!(
            ring.submit(&mut mem, &RequestDescriptor::new(99)),
            Err(RingError::Full)
        );
        assert_eq!(ring.in_flight(), cap);
    }

    #[test]
    fn hostile_rsp_prod_is_clamped() {
        let (mut mem, mut ring) = ring();
        ring.submit(&mut mem, &RequestDescriptor::new(0)).unwrap();
        // Peer claims 7 responses for 1 outstanding request.
        mem.write_u32(OFF_RSP_PROD as u64, 7).unwrap();
        let window = ring.response_window(&mem).unwrap();
        assert!(window.clamped);
        assert_eq!(window.end, 1);
    }

    #[test]
    fn final_check_rearms_and_detects_raced_responses() {
        let (mut mem, mut ring) = ring();
        ring.submit(&mut mem, &RequestDescriptor::new(0)).unwrap();
        ring.submit(&mut mem, &RequestDescriptor::new(1)).unwrap();

        peer_respond(
            &mut mem,
            &ring,
            0,
            ResponseDescriptor { id: 0, actual_length: 8, aux: 0, status: 0 },
        );
        let window = ring.response_window(&mem).unwrap();
        assert_eq!(window.end, 1);
        ring.consume_to(window.end);

        // No further responses yet: final check re-arms and reports quiet.
        assert!(!ring.final_check(&mut mem).unwrap());
        assert_eq!(mem.read_u32(OFF_RSP_EVENT as u64).unwrap(), 2);

        // A response racing in after the drain is detected.
        peer_respond(
            &mut mem,
            &ring,
            1,
            ResponseDescriptor { id: 1, actual_length: 8, aux: 0, status: 0 },
        );
        assert!(ring.final_check(&mut mem).unwrap());
    }

    #[test]
    fn responses_roundtrip_through_the_union_slot() {
        let (mut mem, mut ring) = ring();
        ring.submit(&mut mem, &RequestDescriptor::new(0)).unwrap();
        peer_respond(
            &mut mem,
            &ring,
            0,
            ResponseDescriptor { id: 0, actual_length: 123, aux: 9, status: -6 },
        );
        let rsp = ring.read_response(&mem, 0).unwrap();
        assert_eq!(rsp.actual_length, 123);
        assert_eq!(rsp.status, -6);
    }
}
