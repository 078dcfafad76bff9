//! Indirect-page layout.
//!
//! An indirect page is a frontend-owned page, shared with the backend through
//! its own grant, that carries additional data-page grant tokens: a u32
//! valid-count followed by up to [`GRANTS_PER_INDIRECT_PAGE`] u32 tokens.
//! With the count field this fills a 4 KiB page exactly.
//!
//! A request using indirect addressing puts one indirect-page grant in each
//! inline segment slot, so the reachable payload is
//! `inline_segments * 1023 * page_size` bytes.

use crate::GrantToken;

/// Grant tokens held by one indirect page.
pub const GRANTS_PER_INDIRECT_PAGE: usize = 1023;

/// Byte offset of the first token within an indirect page.
pub const INDIRECT_TOKENS_OFFSET: usize = 4;

/// Number of indirect pages needed to reference `entries` grant tokens.
pub const fn indirect_pages_for(entries: usize) -> usize {
    entries.div_ceil(GRANTS_PER_INDIRECT_PAGE)
}

/// Byte offset of token `index` within its indirect page.
pub const fn token_offset(index: usize) -> usize {
    INDIRECT_TOKENS_OFFSET + index * 4
}

/// Encodes one full indirect page into `page` (used by unit tests and by the
/// chain builder when it stages a page before pushing it through the memory
/// bus).
pub fn encode_page(tokens: &[GrantToken], page: &mut [u8]) {
    assert!(tokens.len() <= GRANTS_PER_INDIRECT_PAGE);
    page[..4].copy_from_slice(&(tokens.len() as u32).to_le_bytes());
    for (i, tok) in tokens.iter().enumerate() {
        let off = token_offset(i);
        page[off..off + 4].copy_from_slice(&tok.0.to_le_bytes());
    }
}

/// Reads the valid-count of an indirect page.
pub fn decode_count(page: &[u8]) -> u32 {
    u32::from_le_bytes([page[0], page[1], page[2], page[3]])
}
