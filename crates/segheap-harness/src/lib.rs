//! Correctness harness for segheap.
//!
//! This crate provides:
//! - Trace model: ordered alloc/free/realloc requests loaded from JSON
//! - Trace validator: replays a trace and checks alignment, heap bounds,
//!   payload overlap and realloc data integrity after every request
//! - Structured logging: JSONL log entries, including lifted core lifecycle records

#![forbid(unsafe_code)]

pub mod structured_log;
pub mod trace;
pub mod validator;

pub use trace::{Trace, TraceError, TraceOp};
pub use validator::{TraceAllocator, TraceValidator, ValidationError, ValidationReport};
