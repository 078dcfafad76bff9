//! Guest-side transport engine for a paravirtual USB host controller.
//!
//! This crate intentionally stays small and self-contained: the only external
//! inputs are a grant-table backend (page sharing with the peer domain), an
//! event channel (out-of-band notification), and a memory bus (access to the
//! shared ring page and to frontend-owned pages).
//!
//! What it provides:
//! - the shared request/response ring with Xen-style notification suppression
//!   ([`ring::RingChannel`])
//! - bounded shadow-slot and grant-token pools with O(1) free lists
//!   ([`shadow::ShadowPool`], [`grant::GrantPool`])
//! - indirect-descriptor chaining for transfers larger than the inline
//!   segment capacity ([`indirect::IndirectChainBuilder`])
//! - the completion reaper with its cancellation race handling and bounded
//!   pass loop ([`engine::Engine::reap`])
//! - FIFO backpressure when a pool is exhausted
//!   ([`backpressure::BackpressureQueue`])
//! - a coarse-locked front end with the synchronous scratch-probe path
//!   ([`front::UsbFront`])
//!
//! Out of scope (external collaborators): USB enumeration and descriptor
//! business logic, root-hub port semantics, translation of OS-specific URBs
//! into [`transfer::TransferRequest`], and the backend implementation.
//!
//! All reads of peer-written ring state are treated as potentially hostile
//! and validated before use; a misbehaving backend can degrade service but
//! never crash the engine.

pub mod backpressure;
pub mod engine;
pub mod front;
pub mod grant;
pub mod indirect;
pub mod pages;
pub mod ring;
pub mod shadow;
pub mod transfer;

pub use engine::{CancelOutcome, Engine, EngineConfig, EngineStats, ReapReport, ReapWork};
pub use front::{ScratchError, UsbFront};
pub use grant::{GrantPool, GrantTable};
pub use ring::EventChannel;
pub use transfer::{
    Completion, CompletionSink, CompletionStatus, DataPayload, SubmitError, TransferId,
    TransferKind, TransferRequest, TransportFault,
};

/// Size of one page frame, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Errors returned when the engine cannot access shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory access out of bounds: {len} bytes at {addr:#x}")]
    OutOfBounds { addr: u64, len: usize },
}

/// Access to the memory domain holding the shared ring page and the
/// frontend-owned pages (indirect pages, packet-descriptor pages, scratch
/// buffers).
///
/// Tests implement this over a plain `Vec<u8>` and double as the peer by
/// writing response records and `rsp_prod` directly.
pub trait MemoryBus {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError>;

    fn read_u32(&self, paddr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&mut self, paddr: u64, val: u32) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }

    /// Zeroes one whole page frame.
    fn zero_frame(&mut self, frame: u64) -> Result<(), MemoryError> {
        self.write_physical(frame * PAGE_SIZE as u64, &[0u8; PAGE_SIZE])
    }
}
