//! Coarse-locked concurrent front end over the engine.
//!
//! One mutex serializes every engine operation; completion callbacks are
//! never invoked with the lock held, so a callback may re-enter the front
//! (submit a follow-up, cancel a sibling) without deadlocking. The price is
//! that a callback can observe engine state that moved on since its response
//! was consumed, which is inherent to any post-unlock delivery.
//!
//! The scratch probe is the one synchronous path: the calling thread parks on
//! a condvar until the reaper (driven by whichever thread services backend
//! notifications) fills the scratch mailbox, with a bounded retry-then-fail
//! timeout so a dead backend cannot park the caller forever.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::warn;

use crate::engine::{CancelOutcome, Engine, EngineConfig, EngineStats};
use crate::grant::GrantTable;
use crate::ring::EventChannel;
use crate::transfer::{
    Completion, CompletionStatus, CompletionSink, SubmitError, TransferId, TransferKind,
    TransferRequest, TransportFault,
};
use crate::{MemoryBus, MemoryError};

/// How long one scratch-probe wait lasts before the backend is re-kicked.
pub const SCRATCH_TIMEOUT: Duration = Duration::from_millis(500);

/// Re-kicks before a scratch probe gives up.
pub const SCRATCH_RETRIES: u32 = 3;

/// Why a scratch probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScratchError {
    /// The backend produced no response within the retry budget. The channel
    /// should be treated as wedged.
    #[error("scratch probe timed out with no backend response")]
    Timeout,
    #[error("scratch probe rejected: {0}")]
    Submit(#[from] SubmitError),
    #[error("scratch probe faulted: {0:?}")]
    Fault(TransportFault),
    /// The device disappeared while the probe was in flight.
    #[error("device is gone")]
    Gone,
}

pub struct UsbFront {
    engine: Mutex<Engine>,
    scratch_cv: Condvar,
    notifier: Box<dyn EventChannel>,
}

impl UsbFront {
    pub fn new(
        config: EngineConfig,
        table: Box<dyn GrantTable>,
        notifier: Box<dyn EventChannel>,
        mem: &mut dyn MemoryBus,
    ) -> Result<Self, MemoryError> {
        Ok(UsbFront {
            engine: Mutex::new(Engine::new(config, table, mem)?),
            scratch_cv: Condvar::new(),
            notifier,
        })
    }

    /// A poisoned lock means a panic mid-operation; the engine's state is
    /// still structurally sound (resources may be conservatively held), so
    /// keep serving rather than propagating the poison to every caller.
    fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits a logical request; `on_complete` runs exactly once with the
    /// terminal outcome, on whichever thread resolves the request.
    pub fn submit(
        &self,
        mem: &mut dyn MemoryBus,
        request: TransferRequest,
        on_complete: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<TransferId, SubmitError> {
        let sink = CompletionSink::Callback(Box::new(on_complete));
        let result = self.lock().submit(mem, request, sink);
        match result {
            Ok(ok) => {
                if ok.notify_backend {
                    self.notifier.notify();
                }
                Ok(ok.id)
            }
            // The callback is dropped unrun; the synchronous error is the
            // caller's single notification.
            Err(rejected) => Err(rejected.error),
        }
    }

    /// Cancels a request by id. The cancelled request's callback (if it wins
    /// the race) runs before this returns, without the lock held.
    pub fn cancel(&self, id: TransferId) -> CancelOutcome {
        let report = self.lock().cancel(id);
        if let Some((cb, completion)) = report.completion {
            cb(completion);
        }
        if report.scratch_completed {
            self.scratch_cv.notify_all();
        }
        report.outcome
    }

    /// Services a backend notification: drains responses, dispatches the
    /// resulting callbacks, and loops while the reaper reports more work than
    /// its pass cap allowed in one go.
    pub fn on_backend_notify(&self, mem: &mut dyn MemoryBus) {
        loop {
            let report = self.lock().reap(mem);
            if report.notify_backend {
                self.notifier.notify();
            }
            let scratch_completed = report.scratch_completed;
            let needs_reschedule = report.needs_reschedule;
            for (cb, completion) in report.completions {
                cb(completion);
            }
            if scratch_completed {
                self.scratch_cv.notify_all();
            }
            if !needs_reschedule {
                break;
            }
            // Yield between bounded drains so other lock contenders (submits,
            // cancels) interleave with a response flood.
            std::thread::yield_now();
        }
    }

    /// Declares the device gone and resolves everything outstanding.
    pub fn set_gone(&self) {
        let report = self.lock().set_gone();
        for (cb, completion) in report.completions {
            cb(completion);
        }
        if report.scratch_completed {
            self.scratch_cv.notify_all();
        }
    }

    /// Issues a synchronous control probe into an engine-owned scratch page
    /// and blocks until its result value arrives.
    ///
    /// The wait piggybacks on normal notification servicing: some thread must
    /// be calling [`UsbFront::on_backend_notify`] for the probe to resolve.
    /// Each timeout re-kicks the backend; after [`SCRATCH_RETRIES`] silent
    /// windows the probe is cancelled and fails.
    pub fn scratch_probe(&self, mem: &mut dyn MemoryBus, setup: u64) -> Result<u32, ScratchError> {
        let request = TransferRequest {
            endpoint: 0,
            kind: TransferKind::ScratchProbe { setup },
            short_ok: false,
            data: None,
        };

        let mut eng = self.lock();
        let ok = match eng.submit(mem, request, CompletionSink::Scratch) {
            Ok(ok) => ok,
            Err(rejected) => return Err(ScratchError::Submit(rejected.error)),
        };
        if ok.notify_backend {
            self.notifier.notify();
        }

        let mut timeouts = 0;
        loop {
            if let Some(completion) = eng.take_scratch_result() {
                return scratch_outcome(completion);
            }

            let (guard, wait) = self
                .scratch_cv
                .wait_timeout(eng, SCRATCH_TIMEOUT)
                .unwrap_or_else(PoisonError::into_inner);
            eng = guard;
            if wait.timed_out() {
                timeouts += 1;
                if timeouts >= SCRATCH_RETRIES {
                    // A result can land on the same edge the last wait gave
                    // up on; it beats the cancellation.
                    if let Some(completion) = eng.take_scratch_result() {
                        return scratch_outcome(completion);
                    }
                    warn!(attempts = timeouts, "scratch probe timed out; cancelling");
                    let report = eng.cancel(ok.id);
                    // The cancellation routed a Cancelled outcome into the
                    // mailbox; clear it so the next probe starts clean.
                    let _ = eng.take_scratch_result();
                    debug_assert!(report.completion.is_none());
                    return Err(ScratchError::Timeout);
                }
                self.notifier.notify();
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.lock().stats()
    }

    pub fn grants_leaked(&self) -> u64 {
        self.lock().grants_leaked()
    }
}

fn scratch_outcome(completion: Completion) -> Result<u32, ScratchError> {
    match completion.status {
        CompletionStatus::Success => Ok(completion.aux),
        CompletionStatus::Fault(fault) => Err(ScratchError::Fault(fault)),
        CompletionStatus::Cancelled | CompletionStatus::DeviceGone => Err(ScratchError::Gone),
    }
}
