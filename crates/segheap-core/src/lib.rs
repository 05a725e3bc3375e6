//! # segheap-core
//!
//! A single-threaded dynamic-memory allocator built on an offset-addressed
//! byte arena. Blocks carry embedded boundary tags, free space is indexed by
//! segregated power-of-two size classes, and a small set of bounded policy
//! parameters can be swapped per trial by an external tuner.
//!
//! No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod malloc;
pub mod params;

pub use config::{FitPolicy, HeapConfig, LogThreshold};
pub use error::AllocError;
pub use malloc::{AllocatorLogLevel, AllocatorLogRecord, Heap, HeapReport, HeapStats};
pub use params::{ParamError, ParamKind, ParamSet, ParamSpec};
