//! Grant-token pool: accounting on top of the grant-table backend.
//!
//! The grant mechanism itself (making a page visible to the peer domain and
//! revoking that visibility) is platform-specific and sits behind the
//! [`GrantTable`] trait. [`GrantPool`] adds what the engine needs on top:
//! outstanding-token accounting, double-release rejection, all-or-nothing
//! multi-grant acquisition, and the leak bookkeeping for revocations the
//! backend refuses.

use std::collections::HashSet;

use pvusb_proto::GrantToken;

use tracing::warn;

/// Platform seam for page sharing with the peer domain.
pub trait GrantTable: Send {
    /// Makes `frame` visible to the peer. `None` means the table is
    /// exhausted; this is the backpressure signal, not an error.
    fn grant(&mut self, frame: u64) -> Option<GrantToken>;

    /// Revokes the peer's access. Returns `false` when the peer still holds
    /// the page and revocation is refused.
    fn revoke(&mut self, token: GrantToken) -> bool;
}

/// Grant-table exhaustion; recovered by the backpressure queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantExhausted;

pub struct GrantPool {
    table: Box<dyn GrantTable>,
    outstanding: HashSet<u32>,
    leaked: u64,
}

impl GrantPool {
    pub fn new(table: Box<dyn GrantTable>) -> Self {
        GrantPool {
            table,
            outstanding: HashSet::new(),
            leaked: 0,
        }
    }

    /// Grants one page. Exhaustion is the caller's cue to roll back and
    /// queue.
    pub fn acquire(&mut self, frame: u64) -> Result<GrantToken, GrantExhausted> {
        let token = self.table.grant(frame).ok_or(GrantExhausted)?;
        let fresh = self.outstanding.insert(token.0);
        debug_assert!(fresh, "grant table reissued an outstanding token");
        Ok(token)
    }

    /// Grants every frame or none: on mid-sequence exhaustion all tokens
    /// taken so far in this call are released before reporting failure.
    pub fn acquire_many(&mut self, frames: &[u64]) -> Result<Vec<GrantToken>, GrantExhausted> {
        let mut tokens = Vec::with_capacity(frames.len());
        for &frame in frames {
            match self.acquire(frame) {
                Ok(tok) => tokens.push(tok),
                Err(GrantExhausted) => {
                    for tok in tokens.drain(..).rev() {
                        self.release(tok);
                    }
                    return Err(GrantExhausted);
                }
            }
        }
        Ok(tokens)
    }

    /// Releases a token. Returns `true` when the revocation went through.
    ///
    /// A refused revocation means the peer still maps the page: the token is
    /// counted as leaked, logged, and retired. It is never retried and never
    /// reissued by this pool. A token not currently outstanding is rejected
    /// outright (double release).
    pub fn release(&mut self, token: GrantToken) -> bool {
        if !self.outstanding.remove(&token.0) {
            warn!(token = token.0, "double release of grant token rejected");
            return false;
        }
        if !self.table.revoke(token) {
            self.leaked += 1;
            warn!(
                token = token.0,
                leaked = self.leaked,
                "backend refused grant revocation; token leaked"
            );
            return false;
        }
        true
    }

    /// Releases a batch, tolerating (and logging) individual refusals.
    pub fn release_all(&mut self, tokens: impl IntoIterator<Item = GrantToken>) {
        for tok in tokens {
            self.release(tok);
        }
    }

    /// Tokens currently held by in-flight requests.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Tokens permanently lost to refused revocations.
    pub fn leaked(&self) -> u64 {
        self.leaked
    }
}
