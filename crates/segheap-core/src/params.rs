//! Tunable parameter surface.
//!
//! The allocator exposes a fixed, declarative set of bounded integer
//! parameters. An external tuner reads the declarations (see [`manifest`]),
//! proposes one value per entry as a [`ParamSet`], and the allocator turns a
//! validated set into a [`crate::HeapConfig`] before a trial starts. Values
//! outside their domain are rejected here, never inside a running trial.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment prefix for parameter overrides (`SEGHEAP_SPLIT_THRESHOLD`, ...).
pub const ENV_PREFIX: &str = "SEGHEAP_";

/// Domain shape of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Any integer in `[min, max]`.
    Integer,
    /// Powers of two in `[min, max]`.
    PowerOfTwo,
}

/// Declaration of one tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub min: u64,
    pub max: u64,
    /// Value used when the tuner leaves the parameter unset.
    pub default: u64,
}

/// Largest leftover (in bytes) that is still handed out whole instead of split.
pub const SPLIT_THRESHOLD: ParamSpec = ParamSpec {
    name: "SPLIT_THRESHOLD",
    kind: ParamKind::Integer,
    min: 50,
    max: 150,
    default: 64,
};

/// Payload alignment unit.
pub const ALIGNMENT: ParamSpec = ParamSpec {
    name: "ALIGNMENT",
    kind: ParamKind::PowerOfTwo,
    min: 8,
    max: 64,
    default: 8,
};

const PARAMETERS: [ParamSpec; 2] = [SPLIT_THRESHOLD, ALIGNMENT];

/// Parameter validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("unknown parameter '{name}'")]
    UnknownParameter { name: String },
    #[error("{name}={value} is outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: i64,
        min: u64,
        max: u64,
    },
    #[error("{name}={value} is not a power of two")]
    NotPowerOfTwo { name: &'static str, value: i64 },
    #[error("malformed value for {name}: '{raw}'")]
    Malformed { name: String, raw: String },
    #[error("invalid parameter document: {message}")]
    Document { message: String },
    #[error("invalid heap limit {value}: {reason}")]
    InvalidLimit { value: usize, reason: &'static str },
}

impl ParamSpec {
    /// Checks `value` against this parameter's domain.
    pub fn validate(&self, value: i64) -> Result<u64, ParamError> {
        let in_range = u64::try_from(value)
            .ok()
            .filter(|v| (self.min..=self.max).contains(v));
        let Some(v) = in_range else {
            return Err(ParamError::OutOfRange {
                name: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        };
        if self.kind == ParamKind::PowerOfTwo && !v.is_power_of_two() {
            return Err(ParamError::NotPowerOfTwo {
                name: self.name,
                value,
            });
        }
        Ok(v)
    }

    /// Returns true if `value` is a legal proposal.
    #[must_use]
    pub fn admits(&self, value: i64) -> bool {
        self.validate(value).is_ok()
    }

    /// Enumerates every legal value, smallest first.
    #[must_use]
    pub fn domain(&self) -> Vec<u64> {
        match self.kind {
            ParamKind::Integer => (self.min..=self.max).collect(),
            ParamKind::PowerOfTwo => {
                let mut values = Vec::new();
                let mut v = self.min.max(1).next_power_of_two();
                while v <= self.max {
                    values.push(v);
                    match v.checked_mul(2) {
                        Some(next) => v = next,
                        None => break,
                    }
                }
                values
            }
        }
    }

    /// Environment variable consulted by [`ParamSet::from_env`].
    #[must_use]
    pub fn env_key(&self) -> String {
        format!("{ENV_PREFIX}{}", self.name)
    }
}

/// All declared parameters.
#[must_use]
pub fn manifest() -> &'static [ParamSpec] {
    &PARAMETERS
}

/// Declarations as pretty JSON, for the tuner.
pub fn manifest_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(manifest())
}

/// Finds a declaration by name.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static ParamSpec> {
    PARAMETERS.iter().find(|spec| spec.name == name)
}

/// One configuration proposal: parameter name to value.
///
/// Every entry is validated on insertion, so a `ParamSet` never holds an
/// out-of-domain value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ParamSet {
    values: BTreeMap<String, u64>,
}

impl ParamSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a value.
    pub fn set(&mut self, name: &str, value: i64) -> Result<&mut Self, ParamError> {
        let spec = lookup(name).ok_or_else(|| ParamError::UnknownParameter {
            name: name.to_string(),
        })?;
        let v = spec.validate(value)?;
        self.values.insert(spec.name.to_string(), v);
        Ok(self)
    }

    /// Value proposed for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    /// Proposed value, or the declared default when unset.
    #[must_use]
    pub fn value_or_default(&self, spec: &ParamSpec) -> u64 {
        self.get(spec.name).unwrap_or(spec.default)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parses a flat JSON object such as `{"SPLIT_THRESHOLD": 96}`.
    pub fn from_json(json: &str) -> Result<Self, ParamError> {
        let raw: BTreeMap<String, i64> =
            serde_json::from_str(json).map_err(|e| ParamError::Document {
                message: e.to_string(),
            })?;
        let mut set = Self::new();
        for (name, value) in raw {
            set.set(&name, value)?;
        }
        Ok(set)
    }

    /// Serializes the proposal as a flat JSON object.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Reads `SEGHEAP_<NAME>` overrides from the process environment.
    pub fn from_env() -> Result<Self, ParamError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup_var: F) -> Result<Self, ParamError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut set = Self::new();
        for spec in manifest() {
            let Some(raw) = lookup_var(&spec.env_key()) else {
                continue;
            };
            let value: i64 = raw.trim().parse().map_err(|_| ParamError::Malformed {
                name: spec.name.to_string(),
                raw: raw.clone(),
            })?;
            set.set(spec.name, value)?;
        }
        Ok(set)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_threshold_bounds_are_inclusive() {
        assert!(SPLIT_THRESHOLD.admits(50));
        assert!(SPLIT_THRESHOLD.admits(150));
        assert!(!SPLIT_THRESHOLD.admits(49));
        assert!(!SPLIT_THRESHOLD.admits(151));
        assert!(!SPLIT_THRESHOLD.admits(-1));
    }

    #[test]
    fn alignment_requires_power_of_two() {
        assert_eq!(ALIGNMENT.validate(16), Ok(16));
        assert_eq!(
            ALIGNMENT.validate(24),
            Err(ParamError::NotPowerOfTwo {
                name: "ALIGNMENT",
                value: 24
            })
        );
        assert!(matches!(
            ALIGNMENT.validate(4),
            Err(ParamError::OutOfRange { .. })
        ));
    }

    #[test]
    fn domains_enumerate_legal_values() {
        assert_eq!(ALIGNMENT.domain(), vec![8, 16, 32, 64]);
        let split = SPLIT_THRESHOLD.domain();
        assert_eq!(split.len(), 101);
        assert_eq!(split.first(), Some(&50));
        assert_eq!(split.last(), Some(&150));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let mut set = ParamSet::new();
        assert_eq!(
            set.set("CHUNK_SIZE", 4096).unwrap_err(),
            ParamError::UnknownParameter {
                name: "CHUNK_SIZE".to_string()
            }
        );
        assert!(set.is_empty());
    }

    #[test]
    fn json_proposal_roundtrip() {
        let set = ParamSet::from_json(r#"{"SPLIT_THRESHOLD": 96, "ALIGNMENT": 16}"#).unwrap();
        assert_eq!(set.get("SPLIT_THRESHOLD"), Some(96));
        assert_eq!(set.get("ALIGNMENT"), Some(16));
        let json = set.to_json().unwrap();
        assert_eq!(ParamSet::from_json(&json).unwrap(), set);
    }

    #[test]
    fn json_proposal_out_of_range_fails() {
        let err = ParamSet::from_json(r#"{"SPLIT_THRESHOLD": 200}"#).unwrap_err();
        assert_eq!(
            err,
            ParamError::OutOfRange {
                name: "SPLIT_THRESHOLD",
                value: 200,
                min: 50,
                max: 150
            }
        );
        assert!(matches!(
            ParamSet::from_json("[1, 2]"),
            Err(ParamError::Document { .. })
        ));
    }

    #[test]
    fn lookup_reads_prefixed_keys() {
        let set = ParamSet::from_lookup(|key| match key {
            "SEGHEAP_SPLIT_THRESHOLD" => Some(" 120 ".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(set.get("SPLIT_THRESHOLD"), Some(120));
        assert_eq!(set.value_or_default(&ALIGNMENT), 8);

        let err = ParamSet::from_lookup(|key| {
            (key == "SEGHEAP_ALIGNMENT").then(|| "sixteen".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ParamError::Malformed { .. }));
    }

    #[test]
    fn manifest_json_lists_every_parameter() {
        let json = manifest_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["name"], "SPLIT_THRESHOLD");
        assert_eq!(entries[0]["kind"], "integer");
        assert_eq!(entries[1]["kind"], "power_of_two");
        assert_eq!(entries[1]["min"], 8);
    }
}
