#![allow(dead_code)]

//! Shared fixtures: a shared-storage memory bus, a grant table that remembers
//! its token-to-frame mapping so the test peer can translate grants, and a
//! peer view that consumes requests and produces responses the way a backend
//! does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use pvusb_front::{
    EngineConfig, EventChannel, GrantTable, MemoryBus, MemoryError, UsbFront, PAGE_SIZE,
};
use pvusb_proto::ring_layout::{OFF_REQ_PROD, OFF_RSP_PROD};
use pvusb_proto::wire::RESPONSE_LEN;
use pvusb_proto::{
    GrantToken, ProtocolVersion, RequestDescriptor, ResponseDescriptor, RingGeometry,
};

/// Guest-physical memory backed by shared storage, so the test can hold
/// several handles (guest side, peer side, prober thread) over the same
/// pages.
#[derive(Clone)]
pub struct SharedMemory {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SharedMemory {
    pub fn new(pages: usize) -> Self {
        SharedMemory {
            data: Arc::new(Mutex::new(vec![0u8; pages * PAGE_SIZE])),
        }
    }
}

impl MemoryBus for SharedMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let data = self.data.lock().unwrap();
        let addr = paddr as usize;
        if addr + buf.len() > data.len() {
            return Err(MemoryError::OutOfBounds { addr: paddr, len: buf.len() });
        }
        buf.copy_from_slice(&data[addr..addr + buf.len()]);
        Ok(())
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let mut data = self.data.lock().unwrap();
        let addr = paddr as usize;
        if addr + buf.len() > data.len() {
            return Err(MemoryError::OutOfBounds { addr: paddr, len: buf.len() });
        }
        data[addr..addr + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Token-to-frame mapping shared between the grant table and the test peer.
pub type GrantMap = Arc<Mutex<HashMap<u32, u64>>>;

/// Grant table with a fixed budget; every live token's frame is visible to
/// the peer through the shared map, mirroring what a real backend resolves
/// through the hypervisor.
pub struct TestTable {
    capacity: usize,
    next: u32,
    map: GrantMap,
    refuse_revoke: Vec<u32>,
}

impl TestTable {
    pub fn new(capacity: usize) -> (Self, GrantMap) {
        let map: GrantMap = Arc::new(Mutex::new(HashMap::new()));
        (
            TestTable {
                capacity,
                next: 1,
                map: map.clone(),
                refuse_revoke: Vec::new(),
            },
            map,
        )
    }

    /// The next `count` issued tokens will refuse revocation.
    pub fn refuse_next_revocations(&mut self, count: u32) {
        for t in self.next..self.next + count {
            self.refuse_revoke.push(t);
        }
    }
}

impl GrantTable for TestTable {
    fn grant(&mut self, frame: u64) -> Option<GrantToken> {
        let mut map = self.map.lock().unwrap();
        if map.len() >= self.capacity {
            return None;
        }
        let t = self.next;
        self.next += 1;
        map.insert(t, frame);
        Some(GrantToken(t))
    }

    fn revoke(&mut self, token: GrantToken) -> bool {
        if self.refuse_revoke.contains(&token.0) {
            return false;
        }
        self.map.lock().unwrap().remove(&token.0).is_some()
    }
}

pub struct CountingChannel {
    pub notifies: AtomicU32,
}

impl EventChannel for CountingChannel {
    fn notify(&self) {
        self.notifies.fetch_add(1, Ordering::SeqCst);
    }
}

/// Backend-side cursor over the shared ring: consumes requests in order and
/// produces responses at its own producer index (which is how out-of-order
/// completion appears on the wire).
pub struct PeerView {
    geometry: RingGeometry,
    req_cons: u32,
    rsp_prod: u32,
}

impl PeerView {
    pub fn new(version: ProtocolVersion) -> Self {
        PeerView {
            geometry: RingGeometry::for_version(version),
            req_cons: 0,
            rsp_prod: 0,
        }
    }

    /// Consumes every request published since the last call.
    pub fn take_requests(&mut self, mem: &SharedMemory) -> Vec<RequestDescriptor> {
        let req_prod = mem.read_u32(OFF_REQ_PROD as u64).unwrap();
        let mut out = Vec::new();
        while self.req_cons != req_prod {
            let off = self.geometry.slot_offset(self.req_cons);
            let mut slot = vec![0u8; self.geometry.version().slot_stride()];
            mem.read_physical(off as u64, &mut slot).unwrap();
            out.push(RequestDescriptor::decode(self.geometry.version(), &slot).unwrap());
            self.req_cons = self.req_cons.wrapping_add(1);
        }
        out
    }

    /// Publishes one response at this peer's producer position.
    pub fn push_response(&mut self, mem: &mut SharedMemory, rsp: ResponseDescriptor) {
        let off = self.geometry.slot_offset(self.rsp_prod);
        let mut slot = [0u8; RESPONSE_LEN];
        rsp.encode(&mut slot);
        mem.write_physical(off as u64, &slot).unwrap();
        self.rsp_prod = self.rsp_prod.wrapping_add(1);
        mem.write_u32(OFF_RSP_PROD as u64, self.rsp_prod).unwrap();
    }

    /// Success response echoing a request's id.
    pub fn complete_ok(&mut self, mem: &mut SharedMemory, id: u64, actual_length: u32) {
        self.push_response(
            mem,
            ResponseDescriptor { id, actual_length, aux: 0, status: 0 },
        );
    }

    /// Writes `rsp_prod` directly, bypassing the cursor (hostile-peer tests).
    pub fn poke_rsp_prod(&self, mem: &mut SharedMemory, value: u32) {
        mem.write_u32(OFF_RSP_PROD as u64, value).unwrap();
    }
}

pub struct Fixture {
    pub mem: SharedMemory,
    pub front: Arc<UsbFront>,
    pub peer: PeerView,
    pub grant_map: GrantMap,
}

/// Standard fixture: v1 ring at frame 0, owned frames 64..80, 128 pages of
/// memory, a generous grant budget.
pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub fn fixture_with(tweak: impl FnOnce(&mut TestTable)) -> Fixture {
    let mut mem = SharedMemory::new(128);
    let (mut table, grant_map) = TestTable::new(4096);
    tweak(&mut table);
    let config = EngineConfig::new(ProtocolVersion::V1, 0, (64..80).collect());
    let front = UsbFront::new(
        config,
        Box::new(table),
        Box::new(CountingChannel { notifies: AtomicU32::new(0) }),
        &mut mem,
    )
    .unwrap();
    Fixture {
        mem,
        front: Arc::new(front),
        peer: PeerView::new(ProtocolVersion::V1),
        grant_map,
    }
}

/// Collector for completion outcomes, shared with callbacks.
pub type Outcomes = Arc<Mutex<Vec<(u64, pvusb_front::Completion)>>>;

pub fn outcomes() -> Outcomes {
    Arc::new(Mutex::new(Vec::new()))
}

/// Callback that records `(tag, completion)` into the collector.
pub fn record(tag: u64, into: &Outcomes) -> impl FnOnce(pvusb_front::Completion) + Send + 'static {
    let into = into.clone();
    move |c| into.lock().unwrap().push((tag, c))
}
