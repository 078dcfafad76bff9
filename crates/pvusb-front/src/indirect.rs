//! Indirect-descriptor chain builder.
//!
//! When a transfer references more data pages than the request record can
//! carry inline, the frontend builds a chain of indirect pages: each inline
//! segment slot then holds the grant of one frontend-owned page that itself
//! holds up to 1023 data-page grant tokens. The chain is built all-or-nothing
//! and recorded on the owning shadow slot so everything is released together.

use pvusb_proto::indirect::{encode_page, indirect_pages_for, GRANTS_PER_INDIRECT_PAGE};
use pvusb_proto::GrantToken;

use crate::grant::{GrantExhausted, GrantPool};
use crate::pages::FramePool;
use crate::{MemoryBus, MemoryError, PAGE_SIZE};

/// Everything a built chain owns; released atomically with its shadow slot.
#[derive(Debug)]
pub struct IndirectBlock {
    /// Frontend-owned frames backing the indirect pages.
    pub page_frames: Vec<u64>,
    /// One grant per indirect page; these go into the request's inline
    /// segment slots.
    pub page_grants: Vec<GrantToken>,
    /// The tokens written into the indirect pages (data pages, plus the
    /// packet-descriptor page when present).
    pub entry_grants: Vec<GrantToken>,
    /// Total valid entries across the chain.
    pub entries: u32,
}

impl IndirectBlock {
    /// Number of inline segment slots the chain occupies.
    pub fn inline_segments(&self) -> u8 {
        self.page_grants.len() as u8
    }

    /// Releases every grant and frame the chain owns. Refused revocations
    /// are absorbed (and counted) by the grant pool.
    pub fn release(self, grants: &mut GrantPool, frames: &mut FramePool) {
        grants.release_all(self.entry_grants);
        grants.release_all(self.page_grants);
        frames.free_all(self.page_frames);
    }
}

/// Why a chain could not be built. Exhaustion feeds backpressure; the other
/// two surface as submission errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    Exhausted,
    TooLarge { pages_needed: usize, max_pages: usize },
    Memory(MemoryError),
}

impl From<GrantExhausted> for ChainError {
    fn from(_: GrantExhausted) -> Self {
        ChainError::Exhausted
    }
}

impl From<MemoryError> for ChainError {
    fn from(e: MemoryError) -> Self {
        ChainError::Memory(e)
    }
}

pub struct IndirectChainBuilder;

impl IndirectChainBuilder {
    /// Builds a chain referencing `data_frames` (prepending the
    /// packet-descriptor page's grant when given one).
    ///
    /// Failure at any point unwinds every grant and frame taken in this call
    /// before reporting; no partial chain ever escapes.
    pub fn build(
        mem: &mut dyn MemoryBus,
        grants: &mut GrantPool,
        frames: &mut FramePool,
        data_frames: &[u64],
        packet_frame: Option<u64>,
        max_pages: usize,
    ) -> Result<IndirectBlock, ChainError> {
        let mut chain = ChainInProgress::new();

        if let Some(frame) = packet_frame {
            match grants.acquire(frame) {
                Ok(tok) => chain.entry_grants.push(tok),
                Err(GrantExhausted) => return Err(chain.unwind(grants, frames)),
            }
        }
        for &frame in data_frames {
            match grants.acquire(frame) {
                Ok(tok) => chain.entry_grants.push(tok),
                Err(GrantExhausted) => return Err(chain.unwind(grants, frames)),
            }
        }

        let entries = chain.entry_grants.len();
        let pages_needed = indirect_pages_for(entries);
        if pages_needed > max_pages {
            chain.unwind(grants, frames);
            return Err(ChainError::TooLarge { pages_needed, max_pages });
        }

        let mut staged = vec![0u8; PAGE_SIZE];
        for tokens in chain.entry_grants.chunks(GRANTS_PER_INDIRECT_PAGE) {
            let frame = match frames.alloc() {
                Some(f) => f,
                None => return Err(chain.unwind(grants, frames)),
            };
            chain.page_frames.push(frame);

            staged.fill(0);
            encode_page(tokens, &mut staged);
            if let Err(e) = mem.write_physical(frame * PAGE_SIZE as u64, &staged) {
                chain.unwind(grants, frames);
                return Err(ChainError::Memory(e));
            }

            match grants.acquire(frame) {
                Ok(tok) => chain.page_grants.push(tok),
                Err(GrantExhausted) => return Err(chain.unwind(grants, frames)),
            }
        }

        debug_assert_eq!(chain.page_frames.len(), pages_needed);
        Ok(IndirectBlock {
            page_frames: chain.page_frames,
            page_grants: chain.page_grants,
            entry_grants: chain.entry_grants,
            entries: entries as u32,
        })
    }
}

/// Partial chain state; turned into either an [`IndirectBlock`] or a full
/// unwind.
struct ChainInProgress {
    page_frames: Vec<u64>,
    page_grants: Vec<GrantToken>,
    entry_grants: Vec<GrantToken>,
}

impl ChainInProgress {
    fn new() -> Self {
        ChainInProgress {
            page_frames: Vec::new(),
            page_grants: Vec::new(),
            entry_grants: Vec::new(),
        }
    }

    fn unwind(&mut self, grants: &mut GrantPool, frames: &mut FramePool) -> ChainError {
        grants.release_all(self.entry_grants.drain(..));
        grants.release_all(self.page_grants.drain(..));
        frames.free_all(self.page_frames.drain(..));
        ChainError::Exhausted
    }
}
