//! Trace validator.
//!
//! Replays a [`Trace`] against an allocator and checks, after every request:
//! - the returned payload is aligned
//! - the payload lies inside the heap
//! - the payload does not overlap any other live payload
//! - realloc preserved the old payload prefix
//!
//! Every payload is filled with a pattern derived from its own offset, so a
//! realloc that moved a block without copying it is caught on the next check.

use std::collections::BTreeMap;
use std::path::Path;

use segheap_core::{AllocError, Heap, HeapConfig, ParamError};
use serde::Serialize;
use thiserror::Error;

use crate::trace::{Trace, TraceError, TraceOp};

/// Allocator interface the validator drives.
pub trait TraceAllocator {
    fn allocate(&mut self, size: usize) -> Result<usize, AllocError>;
    fn free(&mut self, ptr: usize) -> Result<(), AllocError>;
    fn reallocate(&mut self, ptr: usize, size: usize) -> Result<usize, AllocError>;
    /// First `len` payload bytes at `ptr`, or `None` if they are not addressable.
    fn payload(&self, ptr: usize, len: usize) -> Option<&[u8]>;
    fn payload_mut(&mut self, ptr: usize, len: usize) -> Option<&mut [u8]>;
    /// Payload-addressable heap range, `[lo, hi)`.
    fn heap_bounds(&self) -> (usize, usize);
    fn alignment(&self) -> usize;
    /// Allocator-internal consistency check.
    fn check(&self) -> Result<(), AllocError> {
        Ok(())
    }
}

impl TraceAllocator for Heap {
    fn allocate(&mut self, size: usize) -> Result<usize, AllocError> {
        Heap::allocate(self, size)
    }

    fn free(&mut self, ptr: usize) -> Result<(), AllocError> {
        Heap::free(self, ptr)
    }

    fn reallocate(&mut self, ptr: usize, size: usize) -> Result<usize, AllocError> {
        Heap::reallocate(self, ptr, size)
    }

    fn payload(&self, ptr: usize, len: usize) -> Option<&[u8]> {
        Heap::payload(self, ptr).ok().and_then(|p| p.get(..len))
    }

    fn payload_mut(&mut self, ptr: usize, len: usize) -> Option<&mut [u8]> {
        Heap::payload_mut(self, ptr).ok().and_then(|p| p.get_mut(..len))
    }

    fn heap_bounds(&self) -> (usize, usize) {
        // Prologue pad below, epilogue tag above.
        (self.config().alignment, self.heap_len().saturating_sub(8))
    }

    fn alignment(&self) -> usize {
        self.config().alignment
    }

    fn check(&self) -> Result<(), AllocError> {
        Heap::check(self).map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Config(#[from] ParamError),
    #[error("op {index} ({op}): allocator failed: {source}")]
    Allocator {
        index: usize,
        op: &'static str,
        source: AllocError,
    },
    #[error("op {index}: payload {ptr:#x} not {alignment}-byte aligned")]
    Misaligned {
        index: usize,
        ptr: usize,
        alignment: usize,
    },
    #[error("op {index}: payload {ptr:#x}+{size} outside heap [{lo:#x}, {hi:#x})")]
    OutsideHeap {
        index: usize,
        ptr: usize,
        size: usize,
        lo: usize,
        hi: usize,
    },
    #[error("op {index}: payload {ptr:#x}+{size} overlaps id {other_id} at {other_ptr:#x}")]
    Overlap {
        index: usize,
        ptr: usize,
        size: usize,
        other_id: usize,
        other_ptr: usize,
    },
    #[error("op {index}: realloc of id {id} lost data at byte {byte}")]
    DataLost { index: usize, id: usize, byte: usize },
    #[error("op {index}: heap check failed: {source}")]
    Consistency { index: usize, source: AllocError },
}

impl ValidationError {
    /// Index of the failing request, when the failure is tied to one.
    #[must_use]
    pub fn op_index(&self) -> Option<usize> {
        match self {
            Self::Trace(_) | Self::Config(_) => None,
            Self::Allocator { index, .. }
            | Self::Misaligned { index, .. }
            | Self::OutsideHeap { index, .. }
            | Self::Overlap { index, .. }
            | Self::DataLost { index, .. }
            | Self::Consistency { index, .. } => Some(*index),
        }
    }
}

/// Outcome of a clean replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub trace: String,
    /// SHA-256 of the replayed trace.
    pub digest: String,
    pub ops: usize,
    pub allocs: usize,
    pub frees: usize,
    pub reallocs: usize,
    /// Largest sum of requested payload bytes live at once.
    pub peak_requested_bytes: usize,
    /// Heap top (`hi` bound) after the last request.
    pub final_heap_hi: usize,
}

#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    ptr: usize,
    size: usize,
}

/// Replays traces and checks allocator behaviour.
#[derive(Debug, Clone)]
pub struct TraceValidator {
    /// Run the allocator's own consistency check after every request.
    pub check_each_op: bool,
}

impl Default for TraceValidator {
    fn default() -> Self {
        Self {
            check_each_op: true,
        }
    }
}

impl TraceValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a fresh heap from `config` and replays `trace` on it.
    pub fn validate_config(
        &self,
        config: HeapConfig,
        trace: &Trace,
    ) -> Result<ValidationReport, ValidationError> {
        let mut heap = Heap::new(config)?;
        self.validate(&mut heap, trace)
    }

    /// Loads a trace file and replays it on a fresh heap.
    pub fn validate_file(
        &self,
        config: HeapConfig,
        path: &Path,
    ) -> Result<ValidationReport, ValidationError> {
        let trace = Trace::from_file(path)?;
        self.validate_config(config, &trace)
    }

    pub fn validate<A: TraceAllocator>(
        &self,
        allocator: &mut A,
        trace: &Trace,
    ) -> Result<ValidationReport, ValidationError> {
        trace.check_shape()?;
        let digest = trace.digest().map_err(TraceError::from)?;
        let mut report = ValidationReport {
            trace: trace.name.clone(),
            digest,
            ops: trace.ops.len(),
            allocs: 0,
            frees: 0,
            reallocs: 0,
            peak_requested_bytes: 0,
            final_heap_hi: 0,
        };
        let mut blocks: Vec<Option<LiveBlock>> = vec![None; trace.num_ids];
        // Payload start -> (end, id) for every live, non-empty payload.
        let mut ranges: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        let mut live_bytes = 0usize;

        for (index, op) in trace.ops.iter().enumerate() {
            match *op {
                TraceOp::Alloc { id, size } => {
                    let ptr = allocator
                        .allocate(size)
                        .map_err(|source| ValidationError::Allocator {
                            index,
                            op: "alloc",
                            source,
                        })?;
                    add_range(allocator, &mut ranges, index, id, ptr, size)?;
                    fill(allocator, ptr, size);
                    blocks[id] = Some(LiveBlock { ptr, size });
                    live_bytes += size;
                    report.allocs += 1;
                }
                TraceOp::Realloc { id, size } => {
                    let Some(old) = blocks[id] else {
                        continue;
                    };
                    let ptr = allocator.reallocate(old.ptr, size).map_err(|source| {
                        ValidationError::Allocator {
                            index,
                            op: "realloc",
                            source,
                        }
                    })?;
                    ranges.remove(&old.ptr);
                    add_range(allocator, &mut ranges, index, id, ptr, size)?;
                    let kept = old.size.min(size);
                    if let Some(byte) = first_mismatch(allocator, ptr, old.ptr, kept) {
                        return Err(ValidationError::DataLost { index, id, byte });
                    }
                    fill(allocator, ptr, size);
                    blocks[id] = Some(LiveBlock { ptr, size });
                    live_bytes = live_bytes - old.size + size;
                    report.reallocs += 1;
                }
                TraceOp::Free { id } => {
                    let Some(old) = blocks[id].take() else {
                        continue;
                    };
                    ranges.remove(&old.ptr);
                    allocator
                        .free(old.ptr)
                        .map_err(|source| ValidationError::Allocator {
                            index,
                            op: "free",
                            source,
                        })?;
                    live_bytes -= old.size;
                    report.frees += 1;
                }
            }
            report.peak_requested_bytes = report.peak_requested_bytes.max(live_bytes);
            if self.check_each_op {
                allocator
                    .check()
                    .map_err(|source| ValidationError::Consistency { index, source })?;
            }
        }

        report.final_heap_hi = allocator.heap_bounds().1;
        Ok(report)
    }
}

fn add_range<A: TraceAllocator>(
    allocator: &A,
    ranges: &mut BTreeMap<usize, (usize, usize)>,
    index: usize,
    id: usize,
    ptr: usize,
    size: usize,
) -> Result<(), ValidationError> {
    let alignment = allocator.alignment();
    if ptr % alignment != 0 {
        return Err(ValidationError::Misaligned {
            index,
            ptr,
            alignment,
        });
    }
    let (lo, hi) = allocator.heap_bounds();
    let end = ptr.saturating_add(size);
    if ptr < lo || end > hi {
        return Err(ValidationError::OutsideHeap {
            index,
            ptr,
            size,
            lo,
            hi,
        });
    }
    if size == 0 {
        return Ok(());
    }
    let below = ranges.range(..=ptr).next_back();
    let above = ranges.range(ptr..).next();
    for (&other_ptr, &(other_end, other_id)) in below.into_iter().chain(above) {
        if other_ptr < end && ptr < other_end {
            return Err(ValidationError::Overlap {
                index,
                ptr,
                size,
                other_id,
                other_ptr,
            });
        }
    }
    ranges.insert(ptr, (end, id));
    Ok(())
}

/// Byte `j` of the pattern stored in a payload that lives at `ptr`.
fn pattern_byte(ptr: usize, j: usize) -> u8 {
    let mixed = (ptr as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17);
    mixed.to_le_bytes()[j % 8]
}

fn fill<A: TraceAllocator>(allocator: &mut A, ptr: usize, size: usize) {
    if let Some(payload) = allocator.payload_mut(ptr, size) {
        for (j, b) in payload.iter_mut().enumerate() {
            *b = pattern_byte(ptr, j);
        }
    }
}

fn first_mismatch<A: TraceAllocator>(
    allocator: &A,
    ptr: usize,
    old_ptr: usize,
    len: usize,
) -> Option<usize> {
    let Some(payload) = allocator.payload(ptr, len) else {
        return Some(0);
    };
    payload
        .iter()
        .enumerate()
        .find(|&(j, &b)| b != pattern_byte(old_ptr, j))
        .map(|(j, _)| j)
}
