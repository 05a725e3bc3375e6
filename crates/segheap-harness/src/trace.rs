//! Allocation trace model.
//!
//! A trace is an ordered list of requests against a fixed set of block ids.
//! On disk it is JSON:
//!
//! ```json
//! {"name": "short", "num_ids": 2, "ops": [
//!   {"op": "alloc", "id": 0, "size": 100},
//!   {"op": "realloc", "id": 0, "size": 300},
//!   {"op": "free", "id": 0}
//! ]}
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// One request in a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceOp {
    Alloc { id: usize, size: usize },
    Free { id: usize },
    Realloc { id: usize, size: usize },
}

impl TraceOp {
    #[must_use]
    pub fn id(&self) -> usize {
        match *self {
            Self::Alloc { id, .. } | Self::Free { id } | Self::Realloc { id, .. } => id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Alloc { .. } => "alloc",
            Self::Free { .. } => "free",
            Self::Realloc { .. } => "realloc",
        }
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("reading trace '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("trace json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("op {index}: id {id} outside 0..{num_ids}")]
    IdOutOfRange {
        index: usize,
        id: usize,
        num_ids: usize,
    },
    #[error("op {index}: {op} of id {id}, which is not live")]
    NotLive {
        index: usize,
        id: usize,
        op: &'static str,
    },
    #[error("op {index}: alloc of id {id}, which is already live")]
    AlreadyLive { index: usize, id: usize },
}

/// A named request sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub name: String,
    /// Ids range over `0..num_ids`.
    pub num_ids: usize,
    pub ops: Vec<TraceOp>,
}

impl Trace {
    #[must_use]
    pub fn new(name: impl Into<String>, num_ids: usize) -> Self {
        Self {
            name: name.into(),
            num_ids,
            ops: Vec::new(),
        }
    }

    pub fn alloc(&mut self, id: usize, size: usize) -> &mut Self {
        self.ops.push(TraceOp::Alloc { id, size });
        self
    }

    pub fn free(&mut self, id: usize) -> &mut Self {
        self.ops.push(TraceOp::Free { id });
        self
    }

    pub fn realloc(&mut self, id: usize, size: usize) -> &mut Self {
        self.ops.push(TraceOp::Realloc { id, size });
        self
    }

    /// Load a trace from a JSON string and check its shape.
    pub fn from_json(json: &str) -> Result<Self, TraceError> {
        let trace: Self = serde_json::from_str(json)?;
        trace.check_shape()?;
        Ok(trace)
    }

    /// Serialize the trace to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load a trace from a file path.
    pub fn from_file(path: &Path) -> Result<Self, TraceError> {
        let content = std::fs::read_to_string(path).map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// SHA-256 of the compact JSON form, lowercase hex.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex_lower(&Sha256::digest(&canonical)))
    }

    /// Checks that ids are in range, only live ids are freed or resized, and
    /// live ids are not allocated again.
    pub fn check_shape(&self) -> Result<(), TraceError> {
        let mut live = vec![false; self.num_ids];
        for (index, op) in self.ops.iter().enumerate() {
            let id = op.id();
            let Some(slot) = live.get_mut(id) else {
                return Err(TraceError::IdOutOfRange {
                    index,
                    id,
                    num_ids: self.num_ids,
                });
            };
            match op {
                TraceOp::Alloc { .. } if *slot => {
                    return Err(TraceError::AlreadyLive { index, id });
                }
                TraceOp::Alloc { .. } => *slot = true,
                TraceOp::Free { .. } | TraceOp::Realloc { .. } if !*slot => {
                    return Err(TraceError::NotLive {
                        index,
                        id,
                        op: op.name(),
                    });
                }
                TraceOp::Free { .. } => *slot = false,
                TraceOp::Realloc { .. } => {}
            }
        }
        Ok(())
    }

    /// Largest request size in the trace.
    #[must_use]
    pub fn max_request(&self) -> usize {
        self.ops
            .iter()
            .filter_map(|op| match *op {
                TraceOp::Alloc { size, .. } | TraceOp::Realloc { size, .. } => Some(size),
                TraceOp::Free { .. } => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Seeded random trace over `num_ids` ids. Every id left live at the end
    /// is freed, so the trace always ends with an empty heap.
    #[must_use]
    pub fn synthetic(
        name: impl Into<String>,
        seed: u64,
        num_ids: usize,
        num_ops: usize,
        max_size: usize,
    ) -> Self {
        let mut rng = XorShift64::new(seed);
        let mut trace = Self::new(name, num_ids.max(1));
        let mut live = vec![false; trace.num_ids];
        for _ in 0..num_ops {
            let id = rng.gen_range(0, trace.num_ids - 1);
            let size = rng.gen_range(0, max_size);
            if !live[id] {
                trace.alloc(id, size);
                live[id] = true;
            } else if rng.gen_range(0, 2) == 0 {
                trace.realloc(id, size);
            } else {
                trace.free(id);
                live[id] = false;
            }
        }
        for (id, is_live) in live.into_iter().enumerate() {
            if is_live {
                trace.free(id);
            }
        }
        trace
    }
}

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        // Zero is a fixed point of the xorshift step.
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}
