//! Allocator error kinds.
//!
//! Every variant is terminal for the trial that produced it: once a heap
//! reports an error it latches the fault and refuses further work (see
//! [`AllocError::TrialAborted`]).

use thiserror::Error;

/// Failure reported by a [`crate::Heap`] operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The heap could not be extended to satisfy the request.
    #[error("out of memory: requested {requested} bytes with heap at {heap_len}/{limit} bytes")]
    OutOfMemory {
        requested: usize,
        heap_len: usize,
        limit: usize,
    },
    /// `free`/`reallocate` was handed an offset that is not a live block.
    #[error("invalid free in {op} at offset {offset:#x}: {reason}")]
    InvalidFree {
        op: &'static str,
        offset: usize,
        reason: &'static str,
    },
    /// A boundary-tag or free-list invariant does not hold.
    #[error("heap corruption detected in {op} at offset {offset:#x}: {detail}")]
    HeapCorruption {
        op: &'static str,
        offset: usize,
        detail: String,
    },
    /// An earlier fatal error aborted the trial; the heap is no longer usable.
    #[error("trial aborted, {op} refused after earlier fault: {cause}")]
    TrialAborted {
        op: &'static str,
        cause: Box<AllocError>,
    },
}

impl AllocError {
    /// Short machine-readable label for lifecycle records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::InvalidFree { .. } => "invalid_free",
            Self::HeapCorruption { .. } => "heap_corruption",
            Self::TrialAborted { .. } => "trial_aborted",
        }
    }

    /// The error that originally faulted the trial.
    #[must_use]
    pub fn root_cause(&self) -> &AllocError {
        match self {
            Self::TrialAborted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub(crate) fn corruption(op: &'static str, offset: usize, detail: impl Into<String>) -> Self {
        Self::HeapCorruption {
            op,
            offset,
            detail: detail.into(),
        }
    }
}
