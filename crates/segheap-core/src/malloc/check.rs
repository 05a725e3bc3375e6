//! Heap consistency checker.
//!
//! Walks every block from the prologue to the epilogue and every class list
//! of the free list index, and cross-checks the two views. Any mismatch is
//! reported as [`AllocError::HeapCorruption`] naming the operation that
//! triggered the check and the offending offset.

use std::collections::HashSet;

use serde::Serialize;

use super::block::{self, NIL, PREV_LINK};
use super::free_list::{self, FreeListIndex, NUM_CLASSES};
use super::region::HeapRegion;
use crate::error::AllocError;

/// Summary of a successful heap walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapReport {
    pub heap_len: usize,
    pub blocks: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
}

impl HeapReport {
    /// Bytes that blocks may occupy: everything but prologue pad and epilogue.
    #[must_use]
    pub fn usable_bytes(&self) -> usize {
        self.allocated_bytes + self.free_bytes
    }
}

pub fn check_heap(
    op: &'static str,
    region: &HeapRegion,
    index: &FreeListIndex,
) -> Result<HeapReport, AllocError> {
    let alignment = region.alignment();
    let min_block = block::min_block(alignment);
    let epilogue = region.epilogue();
    let mut report = HeapReport {
        heap_len: region.len(),
        ..HeapReport::default()
    };
    let mut free_set = HashSet::new();
    let mut prev_free = false;
    let mut at = region.first_block();

    loop {
        let raw = region.read_tag(at);
        let Some(tag) = block::decode_tag(raw) else {
            return Err(AllocError::corruption(op, at, "header check word mismatch"));
        };
        if tag.size == 0 {
            if at != epilogue || !tag.allocated {
                return Err(AllocError::corruption(op, at, "zero-size block before epilogue"));
            }
            break;
        }
        if tag.size < min_block || tag.size % alignment != 0 {
            return Err(AllocError::corruption(
                op,
                at,
                format!("illegal block size {}", tag.size),
            ));
        }
        if at + tag.size > epilogue {
            return Err(AllocError::corruption(
                op,
                at,
                format!("block of {} bytes runs past epilogue at {epilogue:#x}", tag.size),
            ));
        }
        if region.read_tag(at + tag.size - block::TAG_SIZE) != raw {
            return Err(AllocError::corruption(op, at, "footer does not match header"));
        }
        report.blocks += 1;
        if tag.allocated {
            report.allocated_blocks += 1;
            report.allocated_bytes += tag.size;
            prev_free = false;
        } else {
            if prev_free {
                return Err(AllocError::corruption(op, at, "adjacent free blocks"));
            }
            report.free_blocks += 1;
            report.free_bytes += tag.size;
            report.largest_free = report.largest_free.max(tag.size);
            free_set.insert(at);
            prev_free = true;
        }
        at += tag.size;
    }

    check_index(op, region, index, &free_set)?;
    Ok(report)
}

fn check_index(
    op: &'static str,
    region: &HeapRegion,
    index: &FreeListIndex,
    free_set: &HashSet<usize>,
) -> Result<(), AllocError> {
    let mut listed = 0usize;
    let mut listed_bytes = 0usize;
    for class in 0..NUM_CLASSES {
        let occupied = index.occupancy() & (1 << class) != 0;
        if occupied != index.head(class).is_some() {
            return Err(AllocError::corruption(
                op,
                0,
                format!("occupancy bit for class {class} disagrees with list head"),
            ));
        }
        let mut prev = NIL;
        let mut walked = 0usize;
        for node in index.iter_class(region, class) {
            // A list longer than the free block count means a cycle.
            if walked >= free_set.len() || !free_set.contains(&node) {
                return Err(AllocError::corruption(
                    op,
                    node,
                    format!("class {class} lists a block that is not free"),
                ));
            }
            let size = region.block_size(node);
            if free_list::class_of(size) != class {
                return Err(AllocError::corruption(
                    op,
                    node,
                    format!("block of {size} bytes filed under class {class}"),
                ));
            }
            if region.read_u32(node + PREV_LINK) != prev {
                return Err(AllocError::corruption(op, node, "broken prev link"));
            }
            prev = node as u32;
            walked += 1;
            listed_bytes += size;
        }
        if walked != index.class_len(class) {
            return Err(AllocError::corruption(
                op,
                0,
                format!(
                    "class {class} holds {walked} blocks, index counts {}",
                    index.class_len(class)
                ),
            ));
        }
        listed += walked;
    }
    if listed != free_set.len() {
        return Err(AllocError::corruption(
            op,
            0,
            format!("{} free blocks in heap, {listed} listed", free_set.len()),
        ));
    }
    if listed_bytes != index.free_bytes() {
        return Err(AllocError::corruption(op, 0, "free byte count drifted"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::block::encode_tag;

    fn free_block(region: &mut HeapRegion, index: &mut FreeListIndex, at: usize, size: usize) {
        region.write_tag(at, encode_tag(size, false));
        region.write_tag(at + size - 8, encode_tag(size, false));
        index.insert(region, at, size);
    }

    fn used_block(region: &mut HeapRegion, at: usize, size: usize) {
        region.write_tag(at, encode_tag(size, true));
        region.write_tag(at + size - 8, encode_tag(size, true));
    }

    #[test]
    fn empty_heap_is_consistent() {
        let region = HeapRegion::new(8, 4096);
        let report = check_heap("check", &region, &FreeListIndex::new()).unwrap();
        assert_eq!(report.blocks, 0);
        assert_eq!(report.heap_len, 8);
    }

    #[test]
    fn reports_block_totals() {
        let mut region = HeapRegion::new(8, 4096);
        let mut index = FreeListIndex::new();
        region.grow(96).unwrap();
        used_block(&mut region, 0, 32);
        free_block(&mut region, &mut index, 32, 64);
        let report = check_heap("check", &region, &index).unwrap();
        assert_eq!(report.allocated_blocks, 1);
        assert_eq!(report.free_blocks, 1);
        assert_eq!(report.largest_free, 64);
        assert_eq!(report.usable_bytes(), 96);
    }

    #[test]
    fn detects_adjacent_free_blocks() {
        let mut region = HeapRegion::new(8, 4096);
        let mut index = FreeListIndex::new();
        region.grow(96).unwrap();
        free_block(&mut region, &mut index, 0, 32);
        free_block(&mut region, &mut index, 32, 64);
        let err = check_heap("free", &region, &index).unwrap_err();
        assert!(matches!(
            err,
            AllocError::HeapCorruption {
                op: "free",
                offset: 32,
                ..
            }
        ));
    }

    #[test]
    fn detects_footer_mismatch_and_unlisted_blocks() {
        let mut region = HeapRegion::new(8, 4096);
        let mut index = FreeListIndex::new();
        region.grow(96).unwrap();
        used_block(&mut region, 0, 32);
        free_block(&mut region, &mut index, 32, 64);
        region.write_tag(24, encode_tag(40, true));
        assert!(check_heap("check", &region, &index).is_err());

        let mut region = HeapRegion::new(8, 4096);
        region.grow(96).unwrap();
        used_block(&mut region, 0, 32);
        region.write_tag(32, encode_tag(64, false));
        region.write_tag(88, encode_tag(64, false));
        let err = check_heap("check", &region, &FreeListIndex::new()).unwrap_err();
        assert!(err.to_string().contains("1 free blocks in heap, 0 listed"));
    }
}
