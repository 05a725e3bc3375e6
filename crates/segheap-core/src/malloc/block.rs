//! Boundary-tag block layout.
//!
//! Every block is `[header][payload][footer]` with identical 8-byte tags at
//! both ends. A tag's low word holds `size | ALLOC_BIT`; the high word holds
//! `TAG_MAGIC ^ low` so stray bytes are unlikely to read as a valid tag.
//! Free blocks thread their class list through the first 8 payload bytes as
//! two little-endian `u32` offsets (`prev`, `next`).

use crate::config::MAX_HEAP_LIMIT;

/// Bytes per boundary tag.
pub const TAG_SIZE: usize = 8;

/// Header plus footer.
pub const TAG_OVERHEAD: usize = 2 * TAG_SIZE;

/// Check word mixed into every tag.
pub const TAG_MAGIC: u32 = 0x5E6A_11C3;

/// Low bit of the size word: set while the block is handed out.
pub const ALLOC_BIT: u32 = 0x1;

const SIZE_MASK: u32 = !0x7;

/// "No block" sentinel for free-list links.
pub const NIL: u32 = u32::MAX;

/// Offset of the `prev` link inside a free block.
pub const PREV_LINK: usize = TAG_SIZE;

/// Offset of the `next` link inside a free block.
pub const NEXT_LINK: usize = TAG_SIZE + 4;

/// Header, two links, footer.
const MIN_BLOCK_BYTES: usize = TAG_OVERHEAD + 8;

/// Decoded boundary tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub size: usize,
    pub allocated: bool,
}

#[must_use]
pub fn encode_tag(size: usize, allocated: bool) -> u64 {
    let mut low = (size as u32) & SIZE_MASK;
    if allocated {
        low |= ALLOC_BIT;
    }
    let high = TAG_MAGIC ^ low;
    (u64::from(high) << 32) | u64::from(low)
}

/// Decodes a tag, or `None` when its check word does not match.
#[must_use]
pub fn decode_tag(raw: u64) -> Option<Tag> {
    let low = raw as u32;
    let high = (raw >> 32) as u32;
    if high != TAG_MAGIC ^ low || low & !SIZE_MASK & !ALLOC_BIT != 0 {
        return None;
    }
    Some(Tag {
        size: (low & SIZE_MASK) as usize,
        allocated: low & ALLOC_BIT != 0,
    })
}

/// Size field of a raw tag, check word ignored.
#[must_use]
pub fn raw_size(raw: u64) -> usize {
    ((raw as u32) & SIZE_MASK) as usize
}

/// Rounds `n` up to a multiple of `alignment` (a power of two).
#[must_use]
pub fn align_up(n: usize, alignment: usize) -> Option<usize> {
    let mask = alignment - 1;
    n.checked_add(mask).map(|v| v & !mask)
}

/// Smallest legal block for `alignment`.
#[must_use]
pub fn min_block(alignment: usize) -> usize {
    // MIN_BLOCK_BYTES is tiny, so this cannot overflow.
    align_up(MIN_BLOCK_BYTES, alignment).unwrap_or(MIN_BLOCK_BYTES)
}

/// Block size needed to hold `payload_size` bytes.
///
/// `None` when the result would not fit the tag's size field or the largest
/// permitted heap.
#[must_use]
pub fn wrap(payload_size: usize, alignment: usize) -> Option<usize> {
    let size = align_up(payload_size.checked_add(TAG_OVERHEAD)?, alignment)?;
    let size = size.max(min_block(alignment));
    (size < MAX_HEAP_LIMIT).then_some(size)
}

/// Usable payload bytes of a block.
#[must_use]
pub fn capacity(block_size: usize) -> usize {
    block_size.saturating_sub(TAG_OVERHEAD)
}

/// Size of the free remainder carved off when a block of `block_size` serves
/// a request of `needed` bytes, or `None` when the block is handed out whole.
///
/// The leftover counts its own tags. It is split off only when it exceeds
/// `split_threshold` and can form a legal block.
#[must_use]
pub fn split_remainder(
    block_size: usize,
    needed: usize,
    split_threshold: usize,
    alignment: usize,
) -> Option<usize> {
    let rest = block_size.checked_sub(needed)?;
    (rest > split_threshold && rest >= min_block(alignment)).then_some(rest)
}
