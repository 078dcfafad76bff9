//! Shadow slots: guest-side bookkeeping for in-flight wire requests.
//!
//! One slot exists per possible outstanding ring entry; the slot's index is
//! the wire correlation id, the sole key a response is matched by. Slots are
//! created once at engine initialization and recycled through an index free
//! list; acquisition and release are O(1).

use pvusb_proto::{GrantToken, RequestDescriptor};

use crate::indirect::IndirectBlock;
use crate::transfer::CompletionSink;

/// Lifecycle of one slot.
///
/// The `OnRing -> Resolving` transition is the idempotent claim shared by the
/// completion reaper and the cancellation path: whichever side performs it
/// releases the slot's resources and delivers the single terminal outcome;
/// the other side observes the slot already out of `OnRing` and does nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// On the free list.
    Free,
    /// Acquired, request being built; not yet visible to the peer.
    Staged,
    /// Submitted; a response is expected.
    OnRing,
    /// Claimed for resolution (transient, within one engine operation).
    Resolving,
    /// Cancelled while on the ring: resources already released, outcome
    /// already delivered, but the slot id stays quarantined until the peer's
    /// (discarded) response is consumed, so the id cannot be reused while a
    /// stale response may still be in flight.
    Stale,
}

/// Bookkeeping for one possible outstanding request.
pub struct ShadowSlot {
    id: u16,
    state: SlotState,
    /// Engine-unique sequence number of the logical request currently (or
    /// last) occupying this slot; cancellation handles resolve through it.
    pub seq: u64,
    /// The embedded wire record being built/sent. `request.id` always equals
    /// the slot id.
    pub request: RequestDescriptor,
    /// Back-reference to the logical request's completion sink. `None` only
    /// while free.
    pub sink: Option<CompletionSink>,
    /// Grants covering the caller's data pages (inline path) or the data
    /// pages referenced through the indirect chain.
    pub data_grants: Vec<GrantToken>,
    /// Owned indirect-page block, when the transfer chained.
    pub indirect: Option<IndirectBlock>,
    /// Frontend-owned frames to return to the frame pool (packet-descriptor
    /// page, scratch buffer).
    pub owned_frames: Vec<u64>,
    /// This request is a reset/cycle rather than a data transfer.
    pub is_reset: bool,
}

impl ShadowSlot {
    fn new(id: u16) -> Self {
        ShadowSlot {
            id,
            state: SlotState::Free,
            seq: 0,
            request: RequestDescriptor::new(u64::from(id)),
            sink: None,
            data_grants: Vec::new(),
            indirect: None,
            owned_frames: Vec::new(),
            is_reset: false,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn mark_on_ring(&mut self) {
        debug_assert_eq!(self.state, SlotState::Staged);
        self.state = SlotState::OnRing;
    }

    /// Attempts the single-resolution claim. Exactly one caller per
    /// occupancy observes `true`.
    pub fn claim(&mut self) -> bool {
        if self.state == SlotState::OnRing {
            self.state = SlotState::Resolving;
            true
        } else {
            false
        }
    }
}

/// Fixed array of shadow slots plus an index free list.
pub struct ShadowPool {
    slots: Vec<ShadowSlot>,
    free: Vec<u16>,
}

impl ShadowPool {
    /// `capacity` equals the ring capacity: one slot per possible
    /// outstanding ring entry.
    pub fn new(capacity: u16) -> Self {
        let slots = (0..capacity).map(ShadowSlot::new).collect();
        // Pop order makes slot 0 the first handed out, which keeps wire
        // traces easy to read.
        let free = (0..capacity).rev().collect();
        ShadowPool { slots, free }
    }

    pub fn capacity(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Slots available for admission. Mirrors the ring's available entries,
    /// minus any quarantined ids.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// `None` is the normal backpressure signal, not an error.
    pub fn acquire(&mut self, seq: u64) -> Option<u16> {
        let id = self.free.pop()?;
        let slot = &mut self.slots[usize::from(id)];
        debug_assert_eq!(slot.state, SlotState::Free);
        slot.state = SlotState::Staged;
        slot.seq = seq;
        Some(id)
    }

    pub fn slot(&self, id: u16) -> &ShadowSlot {
        &self.slots[usize::from(id)]
    }

    pub fn slot_mut(&mut self, id: u16) -> &mut ShadowSlot {
        &mut self.slots[usize::from(id)]
    }

    /// Looks up an in-flight slot by the logical request's sequence number.
    pub fn find_by_seq(&self, seq: u64) -> Option<u16> {
        self.slots
            .iter()
            .find(|s| s.seq == seq && matches!(s.state, SlotState::Staged | SlotState::OnRing))
            .map(|s| s.id)
    }

    /// Returns a released slot to the free list.
    ///
    /// The slot must be in use and must already have been stripped of its
    /// resources; transient fields are zeroed here so stale data cannot leak
    /// into a future occupancy.
    pub fn release(&mut self, id: u16) {
        let slot = &mut self.slots[usize::from(id)];
        assert_ne!(slot.state, SlotState::Free, "double release of shadow slot {id}");
        debug_assert!(slot.data_grants.is_empty());
        debug_assert!(slot.indirect.is_none());
        debug_assert!(slot.owned_frames.is_empty());

        slot.state = SlotState::Free;
        slot.sink = None;
        slot.is_reset = false;
        slot.request = RequestDescriptor::new(u64::from(id));
        self.free.push(id);
    }

    /// Parks a cancelled on-ring slot in quarantine instead of freeing it;
    /// see [`SlotState::Stale`].
    pub fn park_stale(&mut self, id: u16) {
        let slot = &mut self.slots[usize::from(id)];
        debug_assert_eq!(slot.state, SlotState::Resolving);
        slot.state = SlotState::Stale;
        slot.sink = None;
    }

    /// Ids currently quarantined (used by the device-gone sweep).
    pub fn stale_ids(&self) -> Vec<u16> {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Stale)
            .map(|s| s.id)
            .collect()
    }

    /// Ids currently awaiting a response.
    pub fn on_ring_ids(&self) -> Vec<u16> {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::OnRing)
            .map(|s| s.id)
            .collect()
    }
}
