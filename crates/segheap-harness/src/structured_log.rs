//! Structured JSONL logging for allocator trials.
//!
//! Provides:
//! - [`LogEntry`]: canonical JSONL record with required and optional fields.
//! - [`LogEmitter`]: writes JSONL lines to a file or an in-memory buffer.
//! - [`LogEntry::from_lifecycle`]: lifts a core [`AllocatorLogRecord`] into a log entry.
//! - [`validate_log_line`] / [`validate_log_file`]: schema checks.

use std::io::Write;
use std::path::Path;

use segheap_core::{AllocatorLogLevel, AllocatorLogRecord, HeapConfig};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<AllocatorLogLevel> for LogLevel {
    fn from(level: AllocatorLogLevel) -> Self {
        match level {
            AllocatorLogLevel::Trace => Self::Trace,
            AllocatorLogLevel::Debug => Self::Debug,
            AllocatorLogLevel::Info => Self::Info,
            AllocatorLogLevel::Warn => Self::Warn,
            AllocatorLogLevel::Error => Self::Error,
        }
    }
}

/// Trial verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    /// Trial name, usually the replayed trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial: Option<String>,
    /// Heap operation (`allocate`, `free`, `reallocate`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Free list size class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<usize>,
    /// Machine-readable outcome label from the allocator (`success`, `noop`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_threshold: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<usize>,
    /// SHA-256 of the trace under test.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            trial: None,
            symbol: None,
            offset: None,
            size: None,
            class: None,
            outcome: None,
            verdict: None,
            split_threshold: None,
            alignment: None,
            trace_digest: None,
            details: None,
        }
    }

    /// Lifts a core lifecycle record. The record's own trace id and counter
    /// snapshot are kept.
    #[must_use]
    pub fn from_lifecycle(record: &AllocatorLogRecord) -> Self {
        let mut entry = Self::new(record.trace_id.clone(), record.level.into(), record.event);
        entry.symbol = Some(record.symbol.to_string());
        entry.offset = record.offset;
        entry.size = record.size;
        entry.class = record.class;
        entry.outcome = Some(record.outcome.to_string());
        entry.details = Some(serde_json::json!({
            "decision_id": record.decision_id,
            "details": record.details,
            "heap_len": record.heap_len,
            "live_blocks": record.live_blocks,
            "free_blocks": record.free_blocks,
            "fit_hits": record.fit_hits,
            "fit_misses": record.fit_misses,
            "splits": record.splits,
            "coalesces": record.coalesces,
            "grows": record.grows,
        }));
        entry
    }

    #[must_use]
    pub fn with_trial(mut self, trial: impl Into<String>) -> Self {
        self.trial = Some(trial.into());
        self
    }

    /// Attach the tunable part of a heap configuration.
    #[must_use]
    pub fn with_config(mut self, config: &HeapConfig) -> Self {
        self.split_threshold = Some(config.split_threshold);
        self.alignment = Some(config.alignment);
        self
    }

    #[must_use]
    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    #[must_use]
    pub fn with_trace_digest(mut self, digest: impl Into<String>) -> Self {
        self.trace_digest = Some(digest.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// Writes structured JSONL log entries.
pub struct LogEmitter<W: Write> {
    writer: W,
    seq: u64,
    trial: String,
    run_id: String,
}

impl LogEmitter<std::io::BufWriter<std::fs::File>> {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, trial: &str, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(std::io::BufWriter::new(file), trial, run_id))
    }
}

impl LogEmitter<Vec<u8>> {
    /// Create an emitter that writes to an in-memory buffer.
    #[must_use]
    pub fn to_buffer(trial: &str, run_id: &str) -> Self {
        Self::new(Vec::new(), trial, run_id)
    }
}

impl<W: Write> LogEmitter<W> {
    pub fn new(writer: W, trial: &str, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            trial: trial.to_string(),
            run_id: run_id.to_string(),
        }
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{}::{:03}", self.trial, self.run_id, self.seq)
    }

    /// Emit a log entry with auto-generated trace_id and trial.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event).with_trial(&self.trial);
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        Ok(entry)
    }

    /// Emit a fully-populated log entry.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.trial.is_none() {
            entry.trial = Some(self.trial.clone());
        }
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    /// Emit every lifecycle record drained from a heap. Returns the count.
    pub fn emit_lifecycle<I>(&mut self, records: I) -> std::io::Result<usize>
    where
        I: IntoIterator<Item = AllocatorLogRecord>,
    {
        let mut count = 0;
        for record in records {
            self.emit_entry(LogEntry::from_lifecycle(&record))?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validation error for a log line.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();
    let mut fail = |field: &str, message: String| {
        errors.push(LogValidationError {
            line_number,
            field: field.to_string(),
            message,
        });
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            fail("<json>", format!("invalid JSON: {e}"));
            return Err(errors);
        }
    };

    let Some(obj) = value.as_object() else {
        fail("<root>", "expected JSON object".to_string());
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            fail(field, "required field missing".to_string());
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !["trace", "debug", "info", "warn", "error"].contains(&level)
    {
        fail("level", format!("invalid level: '{level}'"));
    }

    if let Some(verdict) = obj.get("verdict").and_then(|v| v.as_str())
        && !["pass", "fail"].contains(&verdict)
    {
        fail("verdict", format!("invalid verdict: '{verdict}'"));
    }

    if let Some(outcome) = obj.get("outcome")
        && !outcome.as_str().is_some_and(|s| !s.trim().is_empty())
    {
        fail("outcome", "outcome must be a non-empty string".to_string());
    }

    for field in ["offset", "size", "class", "split_threshold", "alignment"] {
        if let Some(v) = obj.get(field)
            && !v.is_u64()
        {
            fail(field, format!("expected unsigned integer, got {v}"));
        }
    }

    // A config snapshot carries both tunables or neither.
    if obj.contains_key("split_threshold") != obj.contains_key("alignment") {
        fail(
            "split_threshold",
            "split_threshold and alignment must appear together".to_string(),
        );
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !trace_id.contains("::")
    {
        fail(
            "trace_id",
            format!("trace_id should follow <trial>::<run_id>::<seq> format, got: '{trace_id}'"),
        );
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![LogValidationError {
            line_number,
            field: "<deserialization>".to_string(),
            message: format!("failed to deserialize: {e}"),
        }]
    })
}

/// Validate an entire JSONL file.
///
/// Returns the total line count and any validation errors found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    format!("{secs}.{:03}Z", duration.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("churn::run-1::001", LogLevel::Info, "trial_start");
        let json = entry.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["trace_id"], "churn::run-1::001");
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "trial_start");
        assert!(parsed.get("trial").is_none());
        assert!(parsed.get("offset").is_none());
    }

    #[test]
    fn validate_valid_line() {
        let entry = LogEntry::new("churn::run-1::001", LogLevel::Info, "trial_start")
            .with_config(&HeapConfig::default())
            .with_verdict(Verdict::Pass);
        let json = entry.to_jsonl().unwrap();
        let result = validate_log_line(&json, 1);
        assert!(result.is_ok(), "Valid line should pass: {result:?}");
    }

    #[test]
    fn validate_missing_required_field() {
        let json = r#"{"timestamp":"1.000Z","level":"info","event":"test"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "trace_id"));
    }

    #[test]
    fn validate_invalid_level_and_json() {
        let json = r#"{"timestamp":"1.000Z","trace_id":"a::b::c","level":"fatal","event":"test"}"#;
        let errors = validate_log_line(json, 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "level"));

        let errors = validate_log_line("not json at all", 1).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "<json>"));
    }

    #[test]
    fn validate_rejects_half_config_and_negative_offset() {
        let json = r#"{"timestamp":"1.000Z","trace_id":"a::b::c","level":"info","event":"x","split_threshold":64,"offset":-8}"#;
        let errors = validate_log_line(json, 4).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "offset"));
        assert!(errors.iter().any(|e| e.field == "split_threshold"));
        assert!(errors.iter().all(|e| e.line_number == 4));
    }

    #[test]
    fn emitter_generates_sequential_trace_ids() {
        let mut emitter = LogEmitter::to_buffer("churn", "run-42");
        let e1 = emitter.emit(LogLevel::Info, "start").unwrap();
        let e2 = emitter.emit(LogLevel::Info, "end").unwrap();
        assert!(e1.trace_id.ends_with("::001"));
        assert!(e2.trace_id.ends_with("::002"));
        assert!(e1.trace_id.starts_with("churn::run-42::"));
        let text = String::from_utf8(emitter.into_inner()).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
