//! Trace replay against the real heap and against deliberately broken
//! allocators the validator must catch.

use std::path::PathBuf;

use segheap_core::params::{ALIGNMENT, SPLIT_THRESHOLD};
use segheap_core::{AllocError, FitPolicy, Heap, HeapConfig};
use segheap_harness::{Trace, TraceAllocator, TraceValidator, ValidationError};

fn traces_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/traces")
}

fn fixture_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(traces_dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect();
    paths.sort();
    paths
}

#[test]
fn fixture_traces_are_well_formed() {
    let paths = fixture_paths();
    assert!(paths.len() >= 3, "expected trace fixtures, found {paths:?}");
    for path in paths {
        let trace = Trace::from_file(&path).unwrap();
        let stem = path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(trace.name, stem);
        assert!(!trace.ops.is_empty());
    }
}

#[test]
fn fixture_traces_replay_cleanly_under_every_alignment() {
    let validator = TraceValidator::new();
    for path in fixture_paths() {
        for alignment in ALIGNMENT.domain() {
            for policy in [FitPolicy::FirstFit, FitPolicy::BestFit] {
                let config = HeapConfig {
                    alignment: alignment as usize,
                    fit_policy: policy,
                    ..HeapConfig::default()
                };
                let report = validator
                    .validate_file(config, &path)
                    .unwrap_or_else(|e| panic!("{}: {e}", path.display()));
                assert_eq!(report.ops, report.allocs + report.frees + report.reallocs);
            }
        }
    }
}

#[test]
fn end_to_end_fixture_leaves_one_free_block() {
    let trace = Trace::from_file(&traces_dir().join("end_to_end.json")).unwrap();
    let mut heap = Heap::new(HeapConfig::default()).unwrap();
    let report = TraceValidator::new().validate(&mut heap, &trace).unwrap();
    assert_eq!(report.peak_requested_bytes, 300);
    let heap_report = heap.check().unwrap();
    assert_eq!(heap_report.allocated_blocks, 0);
    assert_eq!(heap_report.free_blocks, 1);
}

#[test]
fn synthetic_traces_replay_across_thresholds() {
    let validator = TraceValidator::new();
    for threshold in [SPLIT_THRESHOLD.min, 75, SPLIT_THRESHOLD.default, 120, SPLIT_THRESHOLD.max] {
        let trace = Trace::synthetic("churn", threshold, 24, 800, 2048);
        let config = HeapConfig {
            split_threshold: threshold as usize,
            ..HeapConfig::default()
        };
        let report = validator.validate_config(config, &trace).unwrap();
        assert_eq!(report.ops, trace.ops.len());
        assert!(report.final_heap_hi > 0);
    }
}

#[test]
fn heap_limit_surfaces_as_allocator_failure() {
    let mut trace = Trace::new("too_big", 1);
    trace.alloc(0, 100_000).free(0);
    let config = HeapConfig {
        max_heap_bytes: 8192,
        ..HeapConfig::default()
    };
    let err = TraceValidator::new()
        .validate_config(config, &trace)
        .unwrap_err();
    assert!(matches!(
        err,
        ValidationError::Allocator {
            index: 0,
            op: "alloc",
            source: AllocError::OutOfMemory { .. },
        }
    ));
    assert_eq!(err.op_index(), Some(0));
}

#[test]
fn invalid_config_is_rejected_before_replay() {
    let trace = Trace::synthetic("any", 1, 4, 10, 64);
    let config = HeapConfig {
        alignment: 12,
        ..HeapConfig::default()
    };
    let err = TraceValidator::new()
        .validate_config(config, &trace)
        .unwrap_err();
    assert!(matches!(err, ValidationError::Config(_)));
}

// ---------------------------------------------------------------------------
// Broken allocators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Defect {
    None,
    /// Payloads start one byte past an aligned offset.
    Misaligned,
    /// Every allocation returns the same payload.
    Overlapping,
    /// Realloc moves the block without copying the old payload.
    NoCopyRealloc,
    /// The returned payload runs past the heap top.
    PastTop,
}

/// Bump allocator over a flat buffer that never reuses memory.
struct BumpAllocator {
    memory: Vec<u8>,
    top: usize,
    alignment: usize,
    defect: Defect,
    sizes: std::collections::HashMap<usize, usize>,
}

impl BumpAllocator {
    fn new(defect: Defect) -> Self {
        Self {
            memory: vec![0; 1 << 20],
            top: 16,
            alignment: 8,
            defect,
            sizes: std::collections::HashMap::new(),
        }
    }

    fn bump(&mut self, size: usize) -> usize {
        let ptr = self.top;
        self.top += (size + 7) / 8 * 8 + 8;
        ptr
    }
}

impl TraceAllocator for BumpAllocator {
    fn allocate(&mut self, size: usize) -> Result<usize, AllocError> {
        let ptr = match self.defect {
            Defect::Overlapping => {
                self.bump(size);
                16
            }
            Defect::Misaligned => self.bump(size + 8) + 1,
            Defect::PastTop => self.top + 8,
            Defect::None | Defect::NoCopyRealloc => self.bump(size),
        };
        self.sizes.insert(ptr, size);
        Ok(ptr)
    }

    fn free(&mut self, ptr: usize) -> Result<(), AllocError> {
        self.sizes.remove(&ptr);
        Ok(())
    }

    fn reallocate(&mut self, ptr: usize, size: usize) -> Result<usize, AllocError> {
        let old = self.sizes.remove(&ptr).unwrap_or(0);
        let new = self.bump(size);
        if self.defect != Defect::NoCopyRealloc {
            self.memory.copy_within(ptr..ptr + old.min(size), new);
        }
        self.sizes.insert(new, size);
        Ok(new)
    }

    fn payload(&self, ptr: usize, len: usize) -> Option<&[u8]> {
        self.memory.get(ptr..ptr.checked_add(len)?)
    }

    fn payload_mut(&mut self, ptr: usize, len: usize) -> Option<&mut [u8]> {
        self.memory.get_mut(ptr..ptr.checked_add(len)?)
    }

    fn heap_bounds(&self) -> (usize, usize) {
        (16, self.top)
    }

    fn alignment(&self) -> usize {
        self.alignment
    }
}

fn two_block_trace() -> Trace {
    let mut trace = Trace::new("two_blocks", 2);
    trace.alloc(0, 64).alloc(1, 64).realloc(0, 128).free(0).free(1);
    trace
}

#[test]
fn sound_bump_allocator_passes() {
    let mut allocator = BumpAllocator::new(Defect::None);
    let report = TraceValidator::new()
        .validate(&mut allocator, &two_block_trace())
        .unwrap();
    assert_eq!(report.reallocs, 1);
}

#[test]
fn misaligned_payload_is_caught() {
    let mut allocator = BumpAllocator::new(Defect::Misaligned);
    let err = TraceValidator::new()
        .validate(&mut allocator, &two_block_trace())
        .unwrap_err();
    assert!(
        matches!(err, ValidationError::Misaligned { index: 0, alignment: 8, .. }),
        "{err}"
    );
}

#[test]
fn overlapping_payloads_are_caught() {
    let mut allocator = BumpAllocator::new(Defect::Overlapping);
    let err = TraceValidator::new()
        .validate(&mut allocator, &two_block_trace())
        .unwrap_err();
    assert!(
        matches!(err, ValidationError::Overlap { index: 1, other_id: 0, .. }),
        "{err}"
    );
}

#[test]
fn realloc_without_copy_is_caught() {
    let mut allocator = BumpAllocator::new(Defect::NoCopyRealloc);
    let err = TraceValidator::new()
        .validate(&mut allocator, &two_block_trace())
        .unwrap_err();
    assert!(
        matches!(err, ValidationError::DataLost { index: 2, id: 0, .. }),
        "{err}"
    );
}

#[test]
fn payload_past_heap_top_is_caught() {
    let mut allocator = BumpAllocator::new(Defect::PastTop);
    let err = TraceValidator::new()
        .validate(&mut allocator, &two_block_trace())
        .unwrap_err();
    assert!(
        matches!(err, ValidationError::OutsideHeap { index: 0, size: 64, .. }),
        "{err}"
    );
}
