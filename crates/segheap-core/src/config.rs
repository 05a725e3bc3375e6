//! Per-trial heap configuration.
//!
//! A [`HeapConfig`] is built once per trial, either from a tuner proposal
//! ([`HeapConfig::from_params`]), from `SEGHEAP_*` environment variables
//! ([`HeapConfig::from_env`]) or from a stored JSON document, and is then
//! handed to [`crate::Heap::new`] by value. Nothing here is process-global.

use serde::{Deserialize, Serialize};

use crate::malloc::allocator::AllocatorLogLevel;
use crate::malloc::block::TAG_SIZE;
use crate::params::{self, ParamError, ParamSet};

/// Default heap growth limit (64 MiB).
pub const DEFAULT_MAX_HEAP_BYTES: usize = 64 * 1024 * 1024;

/// Largest heap addressable by 32-bit tags and links.
pub const MAX_HEAP_LIMIT: usize = 1 << 31;

/// Fit-search policy of the free list index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitPolicy {
    /// First fitting block within the request's class, else the head of the
    /// next non-empty class.
    #[default]
    FirstFit,
    /// Smallest fitting block within the request's class, else the smallest
    /// block of the next non-empty class.
    BestFit,
}

impl FitPolicy {
    /// Parse from string (case-insensitive). Unknown input is `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first_fit" | "firstfit" | "first-fit" => Some(Self::FirstFit),
            "best" | "best_fit" | "bestfit" | "best-fit" => Some(Self::BestFit),
            _ => None,
        }
    }
}

/// Minimum severity of lifecycle records the heap keeps.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogThreshold {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Keep nothing.
    Off,
}

impl LogThreshold {
    /// Parse from string (case-insensitive). Unknown input falls back to `Info`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Info,
        }
    }

    /// Returns true if a record at `level` should be kept.
    #[must_use]
    pub fn admits(self, level: AllocatorLogLevel) -> bool {
        let rank = match level {
            AllocatorLogLevel::Trace => Self::Trace,
            AllocatorLogLevel::Debug => Self::Debug,
            AllocatorLogLevel::Info => Self::Info,
            AllocatorLogLevel::Warn => Self::Warn,
            AllocatorLogLevel::Error => Self::Error,
        };
        self != Self::Off && rank >= self
    }
}

/// Immutable policy for one heap instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Leftover bytes at or below which a free block is handed out whole.
    pub split_threshold: usize,
    /// Payload alignment unit (power of two, at least the tag size).
    pub alignment: usize,
    pub fit_policy: FitPolicy,
    /// Growth limit; `grow` fails with `OutOfMemory` beyond it.
    pub max_heap_bytes: usize,
    /// Run the full consistency checker after every mutating operation.
    pub check_each_op: bool,
    pub log_level: LogThreshold,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            split_threshold: params::SPLIT_THRESHOLD.default as usize,
            alignment: params::ALIGNMENT.default as usize,
            fit_policy: FitPolicy::FirstFit,
            max_heap_bytes: DEFAULT_MAX_HEAP_BYTES,
            check_each_op: false,
            log_level: LogThreshold::Info,
        }
    }
}

impl HeapConfig {
    /// Builds a configuration from a tuner proposal. Unset parameters take
    /// their declared defaults.
    pub fn from_params(set: &ParamSet) -> Result<Self, ParamError> {
        let config = Self {
            split_threshold: set.value_or_default(&params::SPLIT_THRESHOLD) as usize,
            alignment: set.value_or_default(&params::ALIGNMENT) as usize,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads `SEGHEAP_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ParamError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads `SEGHEAP_*` keys through an arbitrary lookup.
    ///
    /// Besides the tunable parameters this honours `SEGHEAP_FIT_POLICY`,
    /// `SEGHEAP_MAX_HEAP_BYTES`, `SEGHEAP_CHECK` and `SEGHEAP_LOG`.
    pub fn from_lookup<F>(lookup_var: F) -> Result<Self, ParamError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = ParamSet::from_lookup(&lookup_var)?;
        let mut config = Self::from_params(&set)?;
        if let Some(raw) = lookup_var("SEGHEAP_FIT_POLICY") {
            config.fit_policy = FitPolicy::parse(&raw).ok_or_else(|| ParamError::Malformed {
                name: "FIT_POLICY".to_string(),
                raw: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup_var("SEGHEAP_MAX_HEAP_BYTES") {
            config.max_heap_bytes = raw.trim().parse().map_err(|_| ParamError::Malformed {
                name: "MAX_HEAP_BYTES".to_string(),
                raw: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup_var("SEGHEAP_CHECK") {
            config.check_each_op = matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(raw) = lookup_var("SEGHEAP_LOG") {
            config.log_level = LogThreshold::from_str_loose(&raw);
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses a stored configuration document.
    pub fn from_json(json: &str) -> Result<Self, ParamError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ParamError::Document {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Checks every field against its declared domain.
    pub fn validate(&self) -> Result<(), ParamError> {
        params::SPLIT_THRESHOLD.validate(as_i64(self.split_threshold))?;
        params::ALIGNMENT.validate(as_i64(self.alignment))?;
        if self.max_heap_bytes > MAX_HEAP_LIMIT {
            return Err(ParamError::InvalidLimit {
                value: self.max_heap_bytes,
                reason: "exceeds 32-bit tag range",
            });
        }
        if self.max_heap_bytes < self.alignment + TAG_SIZE {
            return Err(ParamError::InvalidLimit {
                value: self.max_heap_bytes,
                reason: "smaller than the empty heap",
            });
        }
        Ok(())
    }

    /// The tuner-visible part of this configuration.
    #[must_use]
    pub fn to_params(&self) -> ParamSet {
        let mut set = ParamSet::new();
        // Values that fail validation are simply left out of the proposal.
        let _ = set.set(params::SPLIT_THRESHOLD.name, as_i64(self.split_threshold));
        let _ = set.set(params::ALIGNMENT.name, as_i64(self.alignment));
        set
    }
}

fn as_i64(v: usize) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
