//! Dynamic memory allocation.
//!
//! A boundary-tag allocator over a single growable region:
//! - `region`: the byte arena and its growth
//! - `block`: tag encoding, size rounding and the split rule
//! - `free_list`: segregated power-of-two class lists with an occupancy bitmap
//! - `allocator`: the allocate/free/reallocate engine
//! - `check`: the full-heap consistency checker

pub mod allocator;
pub mod block;
pub mod check;
pub mod free_list;
pub mod region;

pub use allocator::{AllocatorLogLevel, AllocatorLogRecord, Heap, HeapStats};
pub use check::HeapReport;
pub use free_list::{FreeListIndex, NUM_CLASSES};
pub use region::HeapRegion;
