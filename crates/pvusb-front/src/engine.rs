//! The transport engine: admission, completion reaping, cancellation.
//!
//! `Engine` is the explicit owner of every pool and of the ring: all state
//! that a driver would traditionally scatter through a global device context
//! lives here and is reached only through `&mut self`. Concurrency is layered
//! on top by [`crate::front::UsbFront`], which serializes callers through one
//! coarse lock and runs completion callbacks outside it.
//!
//! Admission is all-or-nothing: a submission either obtains every resource it
//! needs (shadow slot, grants, owned frames, indirect chain) and lands on the
//! ring, or it unwinds completely and parks on the backpressure queue.
//! Resolution is exactly-once: the completion reaper and the cancellation
//! path race through the shadow slot's claim transition, and only the winner
//! releases resources and delivers the outcome.

use pvusb_proto::iso::{encode_packets, PacketDescriptor};
use pvusb_proto::ring_layout::RingGeometry;
use pvusb_proto::wire::{
    TransferType, FLAG_CYCLE_PORT, FLAG_INDIRECT, FLAG_ISO_ASAP, FLAG_RESET_TARGET, FLAG_SHORT_OK,
};
use pvusb_proto::{GrantToken, ProtocolVersion, UsbStatus};

use tracing::{debug, warn};

use crate::backpressure::{BackpressureQueue, PendingSubmission};
use crate::grant::{GrantExhausted, GrantPool, GrantTable};
use crate::indirect::{ChainError, IndirectBlock, IndirectChainBuilder};
use crate::pages::FramePool;
use crate::ring::{RingChannel, RingError};
use crate::shadow::{ShadowPool, SlotState};
use crate::transfer::{
    Completion, CompletionCallback, CompletionSink, SubmitError, TransferId, TransferKind,
    TransferRequest,
};
use crate::{MemoryBus, MemoryError, PAGE_SIZE};

/// Deterministic work bounds.
///
/// The reaper is peer-driven: the backend controls how fast responses appear.
/// Bounding consecutive drain passes keeps one notification from monopolizing
/// the engine; when the bound is hit the reaper asks to be re-run instead of
/// spinning.
pub mod budget {
    /// Default cap on consecutive reaper passes before rescheduling.
    pub const DEFAULT_REAPER_PASS_CAP: usize = 4;

    /// Bytes an internal scratch probe reads back from the device.
    pub const SCRATCH_PROBE_LEN: u32 = 8;
}

/// Construction parameters for an [`Engine`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub version: ProtocolVersion,
    /// Frame number of the shared ring page.
    pub ring_frame: u64,
    /// Frames reserved for frontend-owned pages (indirect pages, iso packet
    /// pages, scratch buffers).
    pub owned_frames: Vec<u64>,
    /// Cap on consecutive reaper passes; see [`budget`].
    pub reaper_pass_cap: usize,
}

impl EngineConfig {
    pub fn new(version: ProtocolVersion, ring_frame: u64, owned_frames: Vec<u64>) -> Self {
        EngineConfig {
            version,
            ring_frame,
            owned_frames,
            reaper_pass_cap: budget::DEFAULT_REAPER_PASS_CAP,
        }
    }
}

/// Engine-lifetime counters (instrumentation and tests).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub queued: u64,
    pub admitted_from_queue: u64,
    pub peer_violations: u64,
    pub stale_drained: u64,
    pub reaper_overlaps: u64,
    pub reaper_reschedules: u64,
}

/// Work counters for one reaper invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapWork {
    /// Responses resolved to a caller outcome.
    pub responses: usize,
    /// Drain passes performed.
    pub passes: usize,
    /// Submissions admitted from the backpressure queue.
    pub admitted: usize,
    /// Peer protocol violations observed (dropped, not fatal).
    pub violations: usize,
}

/// Result of one reaper invocation. Completion callbacks are handed back,
/// not invoked: the caller runs them with no engine borrow (and no lock)
/// held.
pub struct ReapReport {
    pub completions: Vec<(CompletionCallback, Completion)>,
    pub work: ReapWork,
    /// Work remained at the pass cap; run the reaper again.
    pub needs_reschedule: bool,
    /// An admitted submission crossed the peer's event index.
    pub notify_backend: bool,
    /// The scratch mailbox was filled; wake the blocked prober.
    pub scratch_completed: bool,
}

impl ReapReport {
    fn empty() -> Self {
        ReapReport {
            completions: Vec::new(),
            work: ReapWork::default(),
            needs_reschedule: false,
            notify_backend: false,
            scratch_completed: false,
        }
    }
}

/// Successful submission: the logical id for cancellation plus whether the
/// backend needs a notification.
#[derive(Debug)]
pub struct SubmitOk {
    pub id: TransferId,
    pub notify_backend: bool,
}

/// Rejected submission; the sink comes back so the caller still owns its
/// completion path.
#[derive(Debug)]
pub struct SubmitRejected {
    pub error: SubmitError,
    pub sink: CompletionSink,
}

/// Outcome of a cancellation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the backpressure queue before reaching the ring.
    CancelledQueued,
    /// Claimed off the ring; the peer's eventual response will be discarded.
    CancelledInFlight,
    /// The other side of the race already resolved it; nothing to do.
    AlreadyResolved,
}

/// Result of a cancellation; like [`ReapReport`], callbacks are handed back.
pub struct CancelReport {
    pub outcome: CancelOutcome,
    pub completion: Option<(CompletionCallback, Completion)>,
    pub scratch_completed: bool,
}

/// Result of a device-gone sweep.
pub struct SweepReport {
    pub completions: Vec<(CompletionCallback, Completion)>,
    pub scratch_completed: bool,
}

enum AdmitFailure {
    /// A pool ran dry; the submission comes back intact for the queue.
    Exhausted(PendingSubmission),
    /// Unrecoverable for this submission; the sink comes back.
    Fatal(SubmitError, CompletionSink),
}

/// Resources staged during admission, before they are attached to the slot.
#[derive(Default)]
struct Staging {
    segments: Vec<GrantToken>,
    data_grants: Vec<GrantToken>,
    indirect: Option<IndirectBlock>,
    owned_frames: Vec<u64>,
    flags: u8,
}

pub struct Engine {
    geometry: RingGeometry,
    shadow: ShadowPool,
    grants: GrantPool,
    frames: FramePool,
    ring: RingChannel,
    queue: BackpressureQueue,
    gone: bool,
    next_seq: u64,
    reaper_active: bool,
    reaper_overlap: u32,
    pass_cap: usize,
    scratch_in_flight: Option<u64>,
    scratch_mailbox: Option<Completion>,
    stats: EngineStats,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        table: Box<dyn GrantTable>,
        mem: &mut dyn MemoryBus,
    ) -> Result<Self, MemoryError> {
        let geometry = RingGeometry::for_version(config.version);
        let mut ring = RingChannel::new(geometry, config.ring_frame * PAGE_SIZE as u64);
        ring.init(mem)?;
        Ok(Engine {
            geometry,
            shadow: ShadowPool::new(geometry.capacity() as u16),
            grants: GrantPool::new(table),
            frames: FramePool::new(config.owned_frames),
            ring,
            queue: BackpressureQueue::new(),
            gone: false,
            next_seq: 1,
            reaper_active: false,
            reaper_overlap: 0,
            pass_cap: config.reaper_pass_cap.max(1),
            scratch_in_flight: None,
            scratch_mailbox: None,
            stats: EngineStats::default(),
        })
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn grants_leaked(&self) -> u64 {
        self.grants.leaked()
    }

    /// Ring entries currently awaiting a response (invariant: never exceeds
    /// the ring capacity).
    pub fn in_flight(&self) -> u32 {
        self.ring.in_flight()
    }

    /// Submissions parked on the backpressure queue.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Slots available for admission, which is also the ring's available
    /// entry count (one shadow slot per outstanding ring entry).
    pub fn available_slots(&self) -> usize {
        self.shadow.free_count()
    }

    pub fn is_gone(&self) -> bool {
        self.gone
    }

    // ---- submission -----------------------------------------------------

    /// Submits a logical request.
    ///
    /// Resource exhaustion is not an error: the request is queued and the
    /// returned id stays valid for cancellation. Only device-gone and
    /// malformed/oversized requests reject.
    pub fn submit(
        &mut self,
        mem: &mut dyn MemoryBus,
        request: TransferRequest,
        sink: CompletionSink,
    ) -> Result<SubmitOk, SubmitRejected> {
        if self.gone {
            return Err(SubmitRejected { error: SubmitError::DeviceGone, sink });
        }
        if let Err(error) = self.validate(&request) {
            return Err(SubmitRejected { error, sink });
        }
        if matches!(sink, CompletionSink::Scratch) {
            if self.scratch_in_flight.is_some() {
                return Err(SubmitRejected {
                    error: SubmitError::Malformed("scratch probe already in flight"),
                    sink,
                });
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        if matches!(sink, CompletionSink::Scratch) {
            self.scratch_in_flight = Some(seq);
        }
        let pending = PendingSubmission { seq, request, sink };

        // Admission gate: while older submissions wait, fresh ones queue
        // behind them so FIFO order is never mixed.
        if !self.queue.is_empty() {
            self.queue.enqueue(pending);
            self.stats.queued += 1;
            return Ok(SubmitOk { id: TransferId(seq), notify_backend: false });
        }

        match self.try_admit(mem, pending) {
            Ok(notify_backend) => Ok(SubmitOk { id: TransferId(seq), notify_backend }),
            Err(AdmitFailure::Exhausted(pending)) => {
                self.queue.enqueue(pending);
                self.stats.queued += 1;
                Ok(SubmitOk { id: TransferId(seq), notify_backend: false })
            }
            Err(AdmitFailure::Fatal(error, sink)) => {
                if matches!(sink, CompletionSink::Scratch) {
                    self.scratch_in_flight = None;
                }
                Err(SubmitRejected { error, sink })
            }
        }
    }

    fn validate(&self, request: &TransferRequest) -> Result<(), SubmitError> {
        let version = self.geometry.version();
        let inline = version.inline_segments();

        if let Some(data) = &request.data {
            if usize::from(data.offset) >= PAGE_SIZE {
                return Err(SubmitError::Malformed("payload offset beyond first page"));
            }
            let span = usize::from(data.offset) + data.length as usize;
            let needed = span.div_ceil(PAGE_SIZE);
            if data.frames.len() != needed {
                return Err(SubmitError::Malformed("frame count does not cover payload"));
            }
        }
        let pages = request.data.as_ref().map_or(0, |d| d.frames.len());

        match &request.kind {
            TransferKind::Control { .. } | TransferKind::Bulk | TransferKind::Interrupt => {
                let max = version.max_indirect_pages() * pvusb_proto::indirect::GRANTS_PER_INDIRECT_PAGE;
                if pages > max {
                    return Err(SubmitError::TooLarge { pages, max });
                }
            }
            TransferKind::Isochronous { packets, .. } => {
                if packets.is_empty() || packets.len() > pvusb_proto::iso::PACKETS_PER_PAGE {
                    return Err(SubmitError::Malformed("isochronous packet count"));
                }
                // One inline slot is reserved for the packet-descriptor page
                // and isochronous transfers may not chain.
                let max = inline - 1;
                if pages > max {
                    return Err(SubmitError::TooLarge { pages, max });
                }
            }
            TransferKind::Reset | TransferKind::CyclePort | TransferKind::ScratchProbe { .. } => {
                if request.data.is_some() {
                    return Err(SubmitError::Malformed("request kind carries no payload"));
                }
            }
        }
        Ok(())
    }

    /// Attempts to put one pending submission on the ring. All-or-nothing:
    /// any failure unwinds every resource staged in this call.
    fn try_admit(
        &mut self,
        mem: &mut dyn MemoryBus,
        pending: PendingSubmission,
    ) -> Result<bool, AdmitFailure> {
        let Some(slot_id) = self.shadow.acquire(pending.seq) else {
            return Err(AdmitFailure::Exhausted(pending));
        };

        let staging = match self.stage_resources(mem, &pending.request) {
            Ok(staging) => staging,
            Err(StageFailure::Exhausted) => {
                self.shadow.release(slot_id);
                return Err(AdmitFailure::Exhausted(pending));
            }
            Err(StageFailure::Fatal(error)) => {
                self.shadow.release(slot_id);
                return Err(AdmitFailure::Fatal(error, pending.sink));
            }
        };

        self.fill_request(slot_id, &pending.request, &staging);

        match self.ring.submit(mem, &self.shadow.slot(slot_id).request) {
            Ok(notify) => {
                let slot = self.shadow.slot_mut(slot_id);
                slot.sink = Some(pending.sink);
                slot.data_grants = staging.data_grants;
                slot.indirect = staging.indirect;
                slot.owned_frames = staging.owned_frames;
                slot.is_reset = matches!(
                    pending.request.kind,
                    TransferKind::Reset | TransferKind::CyclePort
                );
                slot.mark_on_ring();
                self.stats.submitted += 1;
                Ok(notify)
            }
            Err(err) => {
                self.unwind_staging(staging);
                self.shadow.release(slot_id);
                match err {
                    // Admission control keeps the ring from filling while a
                    // slot is free; treat a full ring as transient pressure.
                    RingError::Full => {
                        debug_assert!(false, "ring full with a free shadow slot");
                        Err(AdmitFailure::Exhausted(pending))
                    }
                    RingError::Memory(e) => {
                        Err(AdmitFailure::Fatal(SubmitError::Memory(e), pending.sink))
                    }
                }
            }
        }
    }

    /// Acquires grants/frames/chains for a request, without touching the
    /// slot yet.
    fn stage_resources(
        &mut self,
        mem: &mut dyn MemoryBus,
        request: &TransferRequest,
    ) -> Result<Staging, StageFailure> {
        let version = self.geometry.version();
        let inline = version.inline_segments();
        let mut staging = Staging::default();

        if request.short_ok {
            staging.flags |= FLAG_SHORT_OK;
        }

        let data_frames: Vec<u64> = request
            .data
            .as_ref()
            .map(|d| d.frames.clone())
            .unwrap_or_default();

        match &request.kind {
            TransferKind::Isochronous { packets, start_asap, .. } => {
                if *start_asap {
                    staging.flags |= FLAG_ISO_ASAP;
                }
                let packet_frame = match self.stage_packet_page(mem, packets) {
                    Ok(f) => f,
                    Err(failure) => {
                        self.unwind_staging(staging);
                        return Err(failure);
                    }
                };
                staging.owned_frames.push(packet_frame);

                let packet_grant = match self.grants.acquire(packet_frame) {
                    Ok(tok) => tok,
                    Err(GrantExhausted) => {
                        self.unwind_staging(staging);
                        return Err(StageFailure::Exhausted);
                    }
                };
                staging.segments.push(packet_grant);
                staging.data_grants.push(packet_grant);

                match self.grants.acquire_many(&data_frames) {
                    Ok(tokens) => {
                        staging.segments.extend(tokens.iter().copied());
                        staging.data_grants.extend(tokens);
                    }
                    Err(GrantExhausted) => {
                        self.unwind_staging(staging);
                        return Err(StageFailure::Exhausted);
                    }
                }
            }
            TransferKind::Reset | TransferKind::CyclePort => {
                staging.flags |= match request.kind {
                    TransferKind::Reset => FLAG_RESET_TARGET,
                    _ => FLAG_CYCLE_PORT,
                };
            }
            TransferKind::ScratchProbe { .. } => {
                let Some(frame) = self.frames.alloc() else {
                    return Err(StageFailure::Exhausted);
                };
                staging.owned_frames.push(frame);
                if let Err(e) = mem.zero_frame(frame) {
                    self.unwind_staging(staging);
                    return Err(StageFailure::Fatal(SubmitError::Memory(e)));
                }
                match self.grants.acquire(frame) {
                    Ok(tok) => {
                        staging.segments.push(tok);
                        staging.data_grants.push(tok);
                    }
                    Err(GrantExhausted) => {
                        self.unwind_staging(staging);
                        return Err(StageFailure::Exhausted);
                    }
                }
            }
            TransferKind::Control { .. } | TransferKind::Bulk | TransferKind::Interrupt => {
                if data_frames.len() <= inline {
                    match self.grants.acquire_many(&data_frames) {
                        Ok(tokens) => {
                            staging.segments.extend(tokens.iter().copied());
                            staging.data_grants.extend(tokens);
                        }
                        Err(GrantExhausted) => return Err(StageFailure::Exhausted),
                    }
                } else {
                    let max_pages = inline.min(version.max_indirect_pages());
                    match IndirectChainBuilder::build(
                        mem,
                        &mut self.grants,
                        &mut self.frames,
                        &data_frames,
                        None,
                        max_pages,
                    ) {
                        Ok(block) => {
                            staging.segments.extend(block.page_grants.iter().copied());
                            staging.flags |= FLAG_INDIRECT;
                            staging.indirect = Some(block);
                        }
                        Err(ChainError::Exhausted) => return Err(StageFailure::Exhausted),
                        Err(ChainError::TooLarge { pages_needed, max_pages }) => {
                            return Err(StageFailure::Fatal(SubmitError::TooLarge {
                                pages: pages_needed,
                                max: max_pages,
                            }))
                        }
                        Err(ChainError::Memory(e)) => {
                            return Err(StageFailure::Fatal(SubmitError::Memory(e)))
                        }
                    }
                }
            }
        }

        Ok(staging)
    }

    fn stage_packet_page(
        &mut self,
        mem: &mut dyn MemoryBus,
        packets: &[PacketDescriptor],
    ) -> Result<u64, StageFailure> {
        let Some(frame) = self.frames.alloc() else {
            return Err(StageFailure::Exhausted);
        };
        let mut page = vec![0u8; PAGE_SIZE];
        encode_packets(packets, &mut page);
        if let Err(e) = mem.write_physical(frame * PAGE_SIZE as u64, &page) {
            self.frames.free(frame);
            return Err(StageFailure::Fatal(SubmitError::Memory(e)));
        }
        Ok(frame)
    }

    fn unwind_staging(&mut self, staging: Staging) {
        self.grants.release_all(staging.data_grants);
        if let Some(block) = staging.indirect {
            block.release(&mut self.grants, &mut self.frames);
        }
        self.frames.free_all(staging.owned_frames);
    }

    fn fill_request(&mut self, slot_id: u16, request: &TransferRequest, staging: &Staging) {
        let (transfer_type, setup, nr_packets, startframe) = match &request.kind {
            TransferKind::Control { setup } => (TransferType::Control, *setup, 0, 0),
            TransferKind::ScratchProbe { setup } => (TransferType::Control, *setup, 0, 0),
            TransferKind::Bulk => (TransferType::Bulk, 0, 0, 0),
            TransferKind::Interrupt => (TransferType::Interrupt, 0, 0, 0),
            TransferKind::Isochronous { packets, startframe, .. } => (
                TransferType::Isochronous,
                0,
                packets.len() as u16,
                *startframe,
            ),
            TransferKind::Reset | TransferKind::CyclePort => (TransferType::Control, 0, 0, 0),
        };

        let (offset, length) = match (&request.kind, &request.data) {
            (TransferKind::ScratchProbe { .. }, _) => (0, budget::SCRATCH_PROBE_LEN),
            (_, Some(data)) => (data.offset, data.length),
            (_, None) => (0, 0),
        };

        let slot = self.shadow.slot_mut(slot_id);
        let req = &mut slot.request;
        req.setup = setup;
        req.transfer_type = transfer_type;
        req.endpoint = request.endpoint;
        req.offset = offset;
        req.length = length;
        req.nr_segments = staging.segments.len() as u8;
        req.flags = staging.flags;
        req.nr_packets = nr_packets;
        req.startframe = startframe;
        req.segments = staging.segments.clone();
    }

    // ---- resolution -----------------------------------------------------

    /// Drains all visible responses and replays the backpressure queue.
    ///
    /// Single-instance: a call that arrives while a pass is active records an
    /// overlap and returns immediately; the active pass observes the overlap
    /// as "more work" on its next iteration. Consecutive passes are capped;
    /// if work remains at the cap the report asks to be rescheduled instead
    /// of spinning.
    pub fn reap(&mut self, mem: &mut dyn MemoryBus) -> ReapReport {
        if self.reaper_active {
            self.reaper_overlap += 1;
            self.stats.reaper_overlaps += 1;
            return ReapReport::empty();
        }
        self.reaper_active = true;

        let mut report = ReapReport::empty();
        loop {
            report.work.passes += 1;
            match self.drain_pass(mem, &mut report) {
                Ok(()) => {}
                Err(e) => {
                    // Our own ring page failed to read/write; nothing more
                    // this pass can do.
                    warn!(error = %e, "ring memory fault during reap");
                    break;
                }
            }

            let more = match self.ring.final_check(mem) {
                Ok(more) => more,
                Err(e) => {
                    warn!(error = %e, "ring memory fault during final check");
                    false
                }
            };
            let overlapped = self.reaper_overlap > 0;
            self.reaper_overlap = 0;
            if !(more || overlapped) {
                break;
            }
            if report.work.passes >= self.pass_cap {
                report.needs_reschedule = true;
                self.stats.reaper_reschedules += 1;
                debug!(passes = report.work.passes, "reaper pass cap hit; rescheduling");
                break;
            }
        }

        // Resources were just freed; replay the queue head-first.
        self.admit_waiters(mem, &mut report);

        self.reaper_active = false;
        report
    }

    fn drain_pass(
        &mut self,
        mem: &mut dyn MemoryBus,
        report: &mut ReapReport,
    ) -> Result<(), MemoryError> {
        let window = self.ring.response_window(mem)?;
        if window.clamped {
            report.work.violations += 1;
            self.stats.peer_violations += 1;
        }

        let mut index = self.ring.rsp_cons();
        while index != window.end {
            match self.ring.read_response(mem, index) {
                Ok(rsp) => self.resolve_response(rsp.id, rsp.status, rsp.actual_length, rsp.aux, report),
                Err(RingError::Memory(e)) => return Err(e),
                Err(RingError::Full) => unreachable!("read path never reports Full"),
            }
            index = index.wrapping_add(1);
        }
        self.ring.consume_to(index);
        Ok(())
    }

    fn resolve_response(
        &mut self,
        id: u64,
        status: i16,
        actual_length: u32,
        aux: u32,
        report: &mut ReapReport,
    ) {
        if !self.geometry.id_in_range(id) {
            warn!(id, "response id out of range; dropped");
            report.work.violations += 1;
            self.stats.peer_violations += 1;
            return;
        }
        let slot_id = id as u16;

        match self.shadow.slot(slot_id).state() {
            SlotState::Stale => {
                // The cancellation path already resolved this request; the
                // late response only lifts the id's quarantine.
                self.shadow.release(slot_id);
                self.stats.stale_drained += 1;
            }
            SlotState::OnRing => {
                let claimed = self.shadow.slot_mut(slot_id).claim();
                debug_assert!(claimed);
                let completion =
                    Completion::from_wire(UsbStatus::from_raw(status), actual_length, aux);
                self.release_slot_resources(slot_id);
                let sink = self.shadow.slot_mut(slot_id).sink.take();
                self.shadow.release(slot_id);
                self.stats.completed += 1;
                report.work.responses += 1;
                self.deliver(sink, completion, &mut report.completions, &mut report.scratch_completed);
            }
            SlotState::Free | SlotState::Staged | SlotState::Resolving => {
                // A response for a slot with no matching cancellation in
                // progress: peer-controlled data is never trusted enough to
                // act on.
                warn!(id, "response for a slot not on the ring; dropped");
                report.work.violations += 1;
                self.stats.peer_violations += 1;
            }
        }
    }

    fn admit_waiters(&mut self, mem: &mut dyn MemoryBus, report: &mut ReapReport) {
        loop {
            let Some(pending) = self.queue.take_head() else { break };
            match self.try_admit(mem, pending) {
                Ok(notify) => {
                    report.work.admitted += 1;
                    self.stats.admitted_from_queue += 1;
                    report.notify_backend |= notify;
                }
                Err(AdmitFailure::Exhausted(pending)) => {
                    // Head still blocked: stop rather than thrash the rest.
                    self.queue.put_back(pending);
                    break;
                }
                Err(AdmitFailure::Fatal(error, sink)) => {
                    // The queued submission can no longer be admitted at
                    // all; resolve it as a fault rather than dropping it.
                    warn!(error = %error, "queued submission failed admission");
                    let completion = Completion::from_wire(UsbStatus::Invalid, 0, 0);
                    self.deliver(
                        Some(sink),
                        completion,
                        &mut report.completions,
                        &mut report.scratch_completed,
                    );
                }
            }
        }
    }

    fn release_slot_resources(&mut self, slot_id: u16) {
        let slot = self.shadow.slot_mut(slot_id);
        let data_grants = std::mem::take(&mut slot.data_grants);
        let indirect = slot.indirect.take();
        let owned_frames = std::mem::take(&mut slot.owned_frames);

        self.grants.release_all(data_grants);
        if let Some(block) = indirect {
            block.release(&mut self.grants, &mut self.frames);
        }
        self.frames.free_all(owned_frames);
    }

    fn deliver(
        &mut self,
        sink: Option<CompletionSink>,
        completion: Completion,
        completions: &mut Vec<(CompletionCallback, Completion)>,
        scratch_completed: &mut bool,
    ) {
        match sink {
            Some(CompletionSink::Callback(cb)) => completions.push((cb, completion)),
            Some(CompletionSink::Scratch) => {
                self.scratch_in_flight = None;
                self.scratch_mailbox = Some(completion);
                *scratch_completed = true;
            }
            Some(CompletionSink::Discard) | None => {}
        }
    }

    // ---- cancellation ---------------------------------------------------

    /// Cancels a logical request. Exactly one of this path and the reaper
    /// resolves any given request; the loser observes [`CancelOutcome::AlreadyResolved`].
    pub fn cancel(&mut self, id: TransferId) -> CancelReport {
        let seq = id.0;

        if let Some(pending) = self.queue.remove_by_seq(seq) {
            self.stats.cancelled += 1;
            let mut completions = Vec::new();
            let mut scratch = false;
            self.deliver(
                Some(pending.sink),
                Completion::cancelled(),
                &mut completions,
                &mut scratch,
            );
            return CancelReport {
                outcome: CancelOutcome::CancelledQueued,
                completion: completions.pop(),
                scratch_completed: scratch,
            };
        }

        if let Some(slot_id) = self.shadow.find_by_seq(seq) {
            if self.shadow.slot_mut(slot_id).claim() {
                self.release_slot_resources(slot_id);
                let sink = self.shadow.slot_mut(slot_id).sink.take();
                // The request stays on the ring; quarantine the id until the
                // peer's response is consumed.
                self.shadow.park_stale(slot_id);
                self.stats.cancelled += 1;
                let mut completions = Vec::new();
                let mut scratch = false;
                self.deliver(sink, Completion::cancelled(), &mut completions, &mut scratch);
                return CancelReport {
                    outcome: CancelOutcome::CancelledInFlight,
                    completion: completions.pop(),
                    scratch_completed: scratch,
                };
            }
        }

        CancelReport {
            outcome: CancelOutcome::AlreadyResolved,
            completion: None,
            scratch_completed: false,
        }
    }

    // ---- device removal -------------------------------------------------

    /// Declares the device gone: sweeps every in-flight and queued request
    /// without waiting for the peer, and fails all future submissions.
    pub fn set_gone(&mut self) -> SweepReport {
        self.gone = true;
        let mut report = SweepReport { completions: Vec::new(), scratch_completed: false };

        for slot_id in self.shadow.on_ring_ids() {
            let claimed = self.shadow.slot_mut(slot_id).claim();
            debug_assert!(claimed);
            self.release_slot_resources(slot_id);
            let sink = self.shadow.slot_mut(slot_id).sink.take();
            self.shadow.release(slot_id);
            self.stats.cancelled += 1;
            self.deliver(
                sink,
                Completion::device_gone(),
                &mut report.completions,
                &mut report.scratch_completed,
            );
        }
        // Quarantined ids no longer need their responses; the channel is
        // dead.
        for slot_id in self.shadow.stale_ids() {
            self.shadow.release(slot_id);
        }
        for pending in self.queue.drain_all() {
            self.stats.cancelled += 1;
            self.deliver(
                Some(pending.sink),
                Completion::device_gone(),
                &mut report.completions,
                &mut report.scratch_completed,
            );
        }
        report
    }

    // ---- scratch probe --------------------------------------------------

    /// Takes the completed scratch probe's outcome, if any.
    pub fn take_scratch_result(&mut self) -> Option<Completion> {
        self.scratch_mailbox.take()
    }
}

enum StageFailure {
    Exhausted,
    Fatal(SubmitError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{CompletionStatus, DataPayload};
    use pvusb_proto::ring_layout::OFF_RSP_PROD;
    use pvusb_proto::wire::RESPONSE_LEN;
    use pvusb_proto::{RequestDescriptor, ResponseDescriptor};
    use std::collections::HashSet;

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

    struct TestTable {
        capacity: usize,
        live: HashSet<u32>,
        next: u32,
    }

    impl GrantTable for TestTable {
        fn grant(&mut self, _frame: u64) -> Option<GrantToken> {
            if self.live.len() >= self.capacity {
                return None;
            }
            let t = self.next;
            self.next += 1;
            self.live.insert(t);
            Some(GrantToken(t))
        }

        fn revoke(&mut self, token: GrantToken) -> bool {
            self.live.remove(&token.0)
        }
    }

    const RING_FRAME: u64 = 0;

    fn engine_with(grant_capacity: usize, owned_frames: usize) -> (TestMemory, Engine) {
        let mut mem = TestMemory { data: vec![0u8; 128 * PAGE_SIZE] };
        let config = EngineConfig::new(
            ProtocolVersion::V1,
            RING_FRAME,
            (64..64 + owned_frames as u64).collect(),
        );
        let table = TestTable { capacity: grant_capacity, live: HashSet::new(), next: 1 };
        let engine = Engine::new(config, Box::new(table), &mut mem).unwrap();
        (mem, engine)
    }

    fn bulk(frames: Vec<u64>, length: u32) -> TransferRequest {
        TransferRequest {
            endpoint: 0x02,
            kind: TransferKind::Bulk,
            short_ok: false,
            data: Some(DataPayload { frames, offset: 0, length }),
        }
    }

    /// Writes a response into the ring slot for `request_index` and bumps
    /// `rsp_prod` (the test acting as the peer).
    fn respond(mem: &mut TestMemory, engine: &Engine, request_index: u32, rsp: ResponseDescriptor) {
        let geo = engine.geometry;
        let off = geo.slot_offset(request_index);
        let mut slot = [0u8; RESPONSE_LEN];
        rsp.encode(&mut slot);
        mem.write_physical(off as u64, &slot).unwrap();
        let prod = mem.read_u32(OFF_RSP_PROD as u64).unwrap();
        mem.write_u32(OFF_RSP_PROD as u64, prod.max(request_index + 1)).unwrap();
    }

    fn request_on_ring(mem: &TestMemory, engine: &Engine, index: u32) -> RequestDescriptor {
        let off = engine.geometry.slot_offset(index);
        RequestDescriptor::decode(ProtocolVersion::V1, &mem.data[off..off + 128]).unwrap()
    }

    #[test]
    fn submit_then_reap_resolves_with_bytes_transferred() {
        let (mut mem, mut engine) = engine_with(64, 4);
        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let d2 = delivered.clone();
        let sink = CompletionSink::Callback(Box::new(move |c| d2.lock().unwrap().push(c)));

        let ok = engine.submit(&mut mem, bulk(vec![8], 512), sink).unwrap();
        assert_eq!(engine.in_flight(), 1);

        let wire = request_on_ring(&mem, &engine, 0);
        assert_eq!(wire.id, 0);
        assert_eq!(wire.length, 512);
        assert_eq!(wire.nr_segments, 1);

        respond(
            &mut mem,
            &engine,
            0,
            ResponseDescriptor { id: 0, actual_length: 512, aux: 0, status: 0 },
        );
        let report = engine.reap(&mut mem);
        assert_eq!(report.work.responses, 1);
        for (cb, c) in report.completions {
            cb(c);
        }
        let seen = delivered.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, CompletionStatus::Success);
        assert_eq!(seen[0].bytes, 512);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.grants_leaked(), 0);
        let _ = ok;
    }

    #[test]
    fn indirect_path_is_selected_only_beyond_inline_capacity() {
        let (mut mem, mut engine) = engine_with(256, 4);
        // 16 pages fit inline on v1.
        engine
            .submit(&mut mem, bulk((8..24).collect(), 16 * PAGE_SIZE as u32), CompletionSink::Discard)
            .unwrap();
        let inline = request_on_ring(&mem, &engine, 0);
        assert_eq!(inline.flags & FLAG_INDIRECT, 0);
        assert_eq!(inline.nr_segments, 16);

        // 20 pages chain through one indirect page.
        engine
            .submit(&mut mem, bulk((8..28).collect(), 20 * PAGE_SIZE as u32), CompletionSink::Discard)
            .unwrap();
        let chained = request_on_ring(&mem, &engine, 1);
        assert_ne!(chained.flags & FLAG_INDIRECT, 0);
        assert_eq!(chained.nr_segments, 1);
    }

    #[test]
    fn exhausted_pool_queues_instead_of_failing() {
        let (mut mem, mut engine) = engine_with(1024, 4);
        let cap = engine.geometry.capacity();
        for i in 0..cap + 3 {
            engine
                .submit(&mut mem, bulk(vec![8 + u64::from(i)], 16), CompletionSink::Discard)
                .unwrap();
        }
        assert_eq!(engine.in_flight(), cap);
        assert_eq!(engine.queue_len(), 3);
        // The admission gate holds fresh submissions behind the queue.
        let ok = engine
            .submit(&mut mem, bulk(vec![60], 16), CompletionSink::Discard)
            .unwrap();
        assert!(!ok.notify_backend);
        assert_eq!(engine.queue_len(), 4);
    }

    #[test]
    fn reap_admits_queued_submissions_in_fifo_order() {
        let (mut mem, mut engine) = engine_with(1024, 4);
        let cap = engine.geometry.capacity();
        for i in 0..cap + 2 {
            engine
                .submit(&mut mem, bulk(vec![8 + u64::from(i)], 16), CompletionSink::Discard)
                .unwrap();
        }
        respond(&mut mem, &engine, 0, ResponseDescriptor { id: 0, actual_length: 16, aux: 0, status: 0 });
        respond(&mut mem, &engine, 1, ResponseDescriptor { id: 1, actual_length: 16, aux: 0, status: 0 });

        let report = engine.reap(&mut mem);
        assert_eq!(report.work.responses, 2);
        assert_eq!(report.work.admitted, 2);
        assert_eq!(engine.queue_len(), 0);
        // The replayed requests reuse the freed slots in FIFO order: first
        // queued landed first.
        let a = request_on_ring(&mem, &engine, cap);
        let b = request_on_ring(&mem, &engine, cap + 1);
        let seg_a = a.segments[0].0;
        let seg_b = b.segments[0].0;
        assert!(seg_a < seg_b, "queued submissions admitted out of order");
    }

    #[test]
    fn cancel_then_late_response_is_the_expected_race() {
        let (mut mem, mut engine) = engine_with(64, 4);
        let ok = engine
            .submit(&mut mem, bulk(vec![8], 16), CompletionSink::Discard)
            .unwrap();

        let report = engine.cancel(ok.id);
        assert_eq!(report.outcome, CancelOutcome::CancelledInFlight);
        assert_eq!(engine.grants.outstanding(), 0);
        // The id stays quarantined: the pool has capacity-1 slots until the
        // stale response drains.
        assert_eq!(engine.available_slots(), engine.shadow.capacity() as usize - 1);

        // Cancelling again is the losing side of the race: a no-op.
        assert_eq!(engine.cancel(ok.id).outcome, CancelOutcome::AlreadyResolved);

        respond(&mut mem, &engine, 0, ResponseDescriptor { id: 0, actual_length: 16, aux: 0, status: 0 });
        let report = engine.reap(&mut mem);
        // The stale response resolves nothing and violates nothing.
        assert_eq!(report.work.responses, 0);
        assert_eq!(report.work.violations, 0);
        assert_eq!(engine.stats().stale_drained, 1);
        assert_eq!(engine.available_slots(), engine.shadow.capacity() as usize);
    }

    #[test]
    fn response_for_a_free_slot_is_a_peer_violation() {
        let (mut mem, mut engine) = engine_with(64, 4);
        engine
            .submit(&mut mem, bulk(vec![8], 16), CompletionSink::Discard)
            .unwrap();
        // Peer answers with an id that was never submitted.
        respond(&mut mem, &engine, 0, ResponseDescriptor { id: 9, actual_length: 0, aux: 0, status: 0 });
        let report = engine.reap(&mut mem);
        assert_eq!(report.work.responses, 0);
        assert_eq!(report.work.violations, 1);
        assert_eq!(engine.stats().peer_violations, 1);
    }

    #[test]
    fn out_of_range_response_id_is_dropped() {
        let (mut mem, mut engine) = engine_with(64, 4);
        engine
            .submit(&mut mem, bulk(vec![8], 16), CompletionSink::Discard)
            .unwrap();
        respond(
            &mut mem,
            &engine,
            0,
            ResponseDescriptor { id: 1 << 32, actual_length: 0, aux: 0, status: 0 },
        );
        let report = engine.reap(&mut mem);
        assert_eq!(report.work.violations, 1);
    }

    #[test]
    fn reaper_overlap_is_counted_and_consumed() {
        let (mut mem, mut engine) = engine_with(64, 4);
        engine.reaper_active = true;
        let report = engine.reap(&mut mem);
        assert_eq!(report.work.passes, 0);
        assert_eq!(engine.stats().reaper_overlaps, 1);
        assert_eq!(engine.reaper_overlap, 1);

        engine.reaper_active = false;
        // The overlap signal forces a second (empty) pass before settling.
        let report = engine.reap(&mut mem);
        assert_eq!(report.work.passes, 2);
        assert_eq!(engine.reaper_overlap, 0);
    }

    #[test]
    fn pending_work_at_the_pass_cap_reschedules_instead_of_spinning() {
        let (mut mem, mut engine) = engine_with(64, 4);
        engine.pass_cap = 1;
        engine
            .submit(&mut mem, bulk(vec![8], 16), CompletionSink::Discard)
            .unwrap();
        respond(&mut mem, &engine, 0, ResponseDescriptor { id: 0, actual_length: 16, aux: 0, status: 0 });
        // A pending overlap means more work may exist, but the cap stops the
        // loop here.
        engine.reaper_overlap = 1;

        let report = engine.reap(&mut mem);
        assert_eq!(report.work.responses, 1);
        assert_eq!(report.work.passes, 1);
        assert!(report.needs_reschedule);
        assert_eq!(engine.stats().reaper_reschedules, 1);
    }

    #[test]
    fn device_gone_sweeps_everything_and_fails_fast() {
        let (mut mem, mut engine) = engine_with(1024, 4);
        let cap = engine.geometry.capacity();
        for i in 0..cap + 2 {
            engine
                .submit(&mut mem, bulk(vec![8 + u64::from(i)], 16), CompletionSink::Discard)
                .unwrap();
        }
        let on_ring = engine.in_flight();
        let queued = engine.queue_len() as u64;
        let report = engine.set_gone();
        // Discard sinks deliver nothing, but every request was resolved.
        assert!(report.completions.is_empty());
        assert_eq!(engine.stats().cancelled, u64::from(on_ring) + queued);
        assert_eq!(engine.grants.outstanding(), 0);
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(engine.available_slots(), cap as usize);

        let rejected = engine
            .submit(&mut mem, bulk(vec![8], 16), CompletionSink::Discard)
            .unwrap_err();
        assert_eq!(rejected.error, SubmitError::DeviceGone);
    }

    #[test]
    fn iso_reserves_the_first_inline_slot_for_the_packet_page() {
        let (mut mem, mut engine) = engine_with(64, 4);
        let packets = vec![
            PacketDescriptor { offset: 0, length: 100 },
            PacketDescriptor { offset: 100, length: 100 },
        ];
        let req = TransferRequest {
            endpoint: 0x81,
            kind: TransferKind::Isochronous { packets, start_asap: true, startframe: 0 },
            short_ok: false,
            data: Some(DataPayload { frames: vec![8], offset: 0, length: 200 }),
        };
        engine.submit(&mut mem, req, CompletionSink::Discard).unwrap();
        let wire = request_on_ring(&mem, &engine, 0);
        assert_eq!(wire.transfer_type, TransferType::Isochronous);
        assert_eq!(wire.nr_packets, 2);
        assert_ne!(wire.flags & FLAG_ISO_ASAP, 0);
        // Packet page plus one data page.
        assert_eq!(wire.nr_segments, 2);

        // An iso transfer with more data pages than inline-1 is too large
        // rather than chained.
        let packets = vec![PacketDescriptor { offset: 0, length: 64 }];
        let req = TransferRequest {
            endpoint: 0x81,
            kind: TransferKind::Isochronous { packets, start_asap: false, startframe: 7 },
            short_ok: false,
            data: Some(DataPayload {
                frames: (8..8 + 16).collect(),
                offset: 0,
                length: 16 * PAGE_SIZE as u32,
            }),
        };
        let rejected = engine.submit(&mut mem, req, CompletionSink::Discard).unwrap_err();
        assert_eq!(rejected.error, SubmitError::TooLarge { pages: 16, max: 15 });
    }

    #[test]
    fn reset_and_cycle_requests_carry_only_flags() {
        let (mut mem, mut engine) = engine_with(64, 4);
        let reset = TransferRequest {
            endpoint: 0,
            kind: TransferKind::Reset,
            short_ok: false,
            data: None,
        };
        engine.submit(&mut mem, reset, CompletionSink::Discard).unwrap();
        let wire = request_on_ring(&mem, &engine, 0);
        assert_ne!(wire.flags & FLAG_RESET_TARGET, 0);
        assert_eq!(wire.nr_segments, 0);

        let cycle = TransferRequest {
            endpoint: 0,
            kind: TransferKind::CyclePort,
            short_ok: false,
            data: None,
        };
        engine.submit(&mut mem, cycle, CompletionSink::Discard).unwrap();
        let wire = request_on_ring(&mem, &engine, 1);
        assert_ne!(wire.flags & FLAG_CYCLE_PORT, 0);
    }

    #[test]
    fn scratch_probe_result_lands_in_the_mailbox() {
        let (mut mem, mut engine) = engine_with(64, 4);
        let req = TransferRequest {
            endpoint: 0,
            kind: TransferKind::ScratchProbe { setup: 0xa006_0000_0000_0000 },
            short_ok: false,
            data: None,
        };
        engine.submit(&mut mem, req, CompletionSink::Scratch).unwrap();
        assert!(engine.scratch_in_flight.is_some());

        respond(
            &mut mem,
            &engine,
            0,
            ResponseDescriptor { id: 0, actual_length: 8, aux: 0x0103, status: 0 },
        );
        let report = engine.reap(&mut mem);
        assert!(report.scratch_completed);
        let result = engine.take_scratch_result().unwrap();
        assert_eq!(result.status, CompletionStatus::Success);
        assert_eq!(result.aux, 0x0103);
        assert!(engine.scratch_in_flight.is_none());
        // The probe's owned page went back to the frame pool.
        assert_eq!(engine.frames.free_count(), 4);
    }

    #[test]
    fn malformed_payload_is_rejected_synchronously() {
        let (mut mem, mut engine) = engine_with(64, 4);
        // Two frames claimed, but the length only spans one page.
        let req = bulk(vec![8, 9], 100);
        let rejected = engine.submit(&mut mem, req, CompletionSink::Discard).unwrap_err();
        assert!(matches!(rejected.error, SubmitError::Malformed(_)));
        assert_eq!(engine.in_flight(), 0);
    }
}
