//! Segregated free list index.
//!
//! Free blocks are bucketed into power-of-two size classes: class `c` holds
//! block sizes in `[2^(c+3), 2^(c+4))`. Each class is a LIFO doubly linked
//! list threaded through the free blocks themselves, and a 32-bit occupancy
//! bitmap finds the next non-empty class without scanning.

use super::block::{NEXT_LINK, NIL, PREV_LINK};
use super::region::HeapRegion;
use crate::config::FitPolicy;

/// Number of size classes.
pub const NUM_CLASSES: usize = 29;

/// Size class of a block size.
#[must_use]
pub fn class_of(size: usize) -> usize {
    let log2 = usize::BITS - 1 - size.max(8).leading_zeros();
    (log2 as usize - 3).min(NUM_CLASSES - 1)
}

/// Smallest block size held by `class`.
#[must_use]
pub fn class_floor(class: usize) -> usize {
    1 << (class + 3)
}

#[derive(Debug, Clone)]
pub struct FreeListIndex {
    heads: [u32; NUM_CLASSES],
    lens: [usize; NUM_CLASSES],
    occupancy: u32,
    free_bytes: usize,
}

impl Default for FreeListIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeListIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heads: [NIL; NUM_CLASSES],
            lens: [0; NUM_CLASSES],
            occupancy: 0,
            free_bytes: 0,
        }
    }

    /// Pushes a free block of `size` bytes at the head of its class.
    pub fn insert(&mut self, region: &mut HeapRegion, block: usize, size: usize) {
        let class = class_of(size);
        let head = self.heads[class];
        region.write_u32(block + PREV_LINK, NIL);
        region.write_u32(block + NEXT_LINK, head);
        if head != NIL {
            region.write_u32(head as usize + PREV_LINK, block as u32);
        }
        self.heads[class] = block as u32;
        self.lens[class] += 1;
        self.occupancy |= 1 << class;
        self.free_bytes += size;
    }

    /// Unlinks a listed block of `size` bytes.
    pub fn remove(&mut self, region: &mut HeapRegion, block: usize, size: usize) {
        let class = class_of(size);
        let prev = region.read_u32(block + PREV_LINK);
        let next = region.read_u32(block + NEXT_LINK);
        if prev == NIL {
            self.heads[class] = next;
        } else {
            region.write_u32(prev as usize + NEXT_LINK, next);
        }
        if next != NIL {
            region.write_u32(next as usize + PREV_LINK, prev);
        }
        self.lens[class] = self.lens[class].saturating_sub(1);
        if self.heads[class] == NIL {
            self.occupancy &= !(1 << class);
        }
        self.free_bytes = self.free_bytes.saturating_sub(size);
    }

    /// Finds a free block of at least `size` bytes. The block stays listed.
    #[must_use]
    pub fn find_fit(&self, region: &HeapRegion, size: usize, policy: FitPolicy) -> Option<usize> {
        let class = class_of(size);
        let in_class = match policy {
            FitPolicy::FirstFit => self
                .iter_class(region, class)
                .find(|&b| region.block_size(b) >= size),
            FitPolicy::BestFit => self.smallest_in(region, class, size),
        };
        if in_class.is_some() {
            return in_class;
        }
        let larger = self.next_occupied_above(class)?;
        match policy {
            FitPolicy::FirstFit => Some(self.heads[larger] as usize),
            FitPolicy::BestFit => self.smallest_in(region, larger, size),
        }
    }

    fn smallest_in(&self, region: &HeapRegion, class: usize, size: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for block in self.iter_class(region, class) {
            let block_size = region.block_size(block);
            if block_size < size {
                continue;
            }
            // Strict comparison keeps the first of equal candidates.
            if best.is_none_or(|(_, s)| block_size < s) {
                best = Some((block, block_size));
                if block_size == size {
                    break;
                }
            }
        }
        best.map(|(block, _)| block)
    }

    /// First non-empty class strictly above `class`.
    #[must_use]
    pub fn next_occupied_above(&self, class: usize) -> Option<usize> {
        let above = if class + 1 >= NUM_CLASSES {
            0
        } else {
            self.occupancy & !((1u32 << (class + 1)) - 1)
        };
        (above != 0).then(|| above.trailing_zeros() as usize)
    }

    /// Walks one class list in link order.
    pub fn iter_class<'a>(&self, region: &'a HeapRegion, class: usize) -> ClassIter<'a> {
        ClassIter {
            region,
            cursor: self.heads[class],
        }
    }

    #[must_use]
    pub fn head(&self, class: usize) -> Option<usize> {
        let head = self.heads[class];
        (head != NIL).then_some(head as usize)
    }

    #[must_use]
    pub fn class_len(&self, class: usize) -> usize {
        self.lens[class]
    }

    /// Total number of listed blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lens.iter().sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.occupancy == 0
    }

    #[must_use]
    pub fn occupancy(&self) -> u32 {
        self.occupancy
    }

    /// Sum of listed block sizes.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }
}

/// Iterator over the block offsets of one class list.
pub struct ClassIter<'a> {
    region: &'a HeapRegion,
    cursor: u32,
}

impl Iterator for ClassIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cursor == NIL {
            return None;
        }
        let block = self.cursor as usize;
        // A corrupt link ends the walk instead of reading past the heap.
        self.cursor = self
            .region
            .try_read_u32(block + NEXT_LINK)
            .unwrap_or(NIL);
        Some(block)
    }
}
