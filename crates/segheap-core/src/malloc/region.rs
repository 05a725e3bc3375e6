//! Growable heap region.
//!
//! The region is one contiguous `Vec<u8>` addressed by byte offsets. Its
//! layout is `[prologue pad][blocks...][epilogue tag]`: the pad is
//! `alignment - TAG_SIZE` bytes so the first payload lands on an alignment
//! boundary, and the trailing 8-byte epilogue (allocated, size 0) terminates
//! every heap walk. The region only grows, in whole alignment units.

use super::block::{self, TAG_SIZE};
use crate::error::AllocError;

#[derive(Debug, Clone)]
pub struct HeapRegion {
    bytes: Vec<u8>,
    alignment: usize,
    limit: usize,
}

impl HeapRegion {
    /// Creates an empty region: prologue pad plus epilogue, no blocks.
    pub fn new(alignment: usize, limit: usize) -> Self {
        let mut region = Self {
            bytes: vec![0; alignment],
            alignment,
            limit,
        };
        region.write_epilogue();
        region
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_block() == self.epilogue()
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Header offset of the lowest block.
    #[must_use]
    pub fn first_block(&self) -> usize {
        self.alignment - TAG_SIZE
    }

    /// Offset of the epilogue tag.
    #[must_use]
    pub fn epilogue(&self) -> usize {
        self.bytes.len() - TAG_SIZE
    }

    /// Extends the region by `minimum_bytes` rounded up to the alignment unit.
    ///
    /// Returns the old epilogue offset, which is where the new span begins. The
    /// span itself is left untagged; a fresh epilogue is written at the end.
    pub fn grow(&mut self, minimum_bytes: usize) -> Result<usize, AllocError> {
        let oom = AllocError::OutOfMemory {
            requested: minimum_bytes,
            heap_len: self.bytes.len(),
            limit: self.limit,
        };
        let Some(amount) = block::align_up(minimum_bytes.max(1), self.alignment) else {
            return Err(oom);
        };
        let new_len = match self.bytes.len().checked_add(amount) {
            Some(len) if len <= self.limit => len,
            _ => return Err(oom),
        };
        let base = self.epilogue();
        self.bytes.resize(new_len, 0);
        self.write_epilogue();
        Ok(base)
    }

    fn write_epilogue(&mut self) {
        let at = self.epilogue();
        self.write_tag(at, block::encode_tag(0, true));
    }

    /// Reads a raw 64-bit tag at `offset`.
    #[must_use]
    pub fn read_tag(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }

    /// Bounds-checked tag read for offsets that come from callers.
    #[must_use]
    pub fn try_read_tag(&self, offset: usize) -> Option<u64> {
        let end = offset.checked_add(8)?;
        let slice = self.bytes.get(offset..end)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(slice);
        Some(u64::from_le_bytes(raw))
    }

    pub fn write_tag(&mut self, offset: usize, tag: u64) {
        self.bytes[offset..offset + 8].copy_from_slice(&tag.to_le_bytes());
    }

    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    #[must_use]
    pub fn try_read_u32(&self, offset: usize) -> Option<u32> {
        let slice = self.bytes.get(offset..offset.checked_add(4)?)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(slice);
        Some(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Size field of the tag at `offset`, without verifying the check word.
    #[must_use]
    pub fn block_size(&self, offset: usize) -> usize {
        block::raw_size(self.read_tag(offset))
    }

    #[must_use]
    pub fn payload(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes[offset..offset + len]
    }

    pub fn payload_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.bytes[offset..offset + len]
    }

    /// Copies `len` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        self.bytes.copy_within(src..src + len, dst);
    }
}
