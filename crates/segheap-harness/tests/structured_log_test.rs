//! Allocator lifecycle records flow through the JSONL emitter and come out
//! schema-valid.

use segheap_core::{Heap, HeapConfig, LogThreshold};
use segheap_harness::structured_log::{
    LogEmitter, LogEntry, LogLevel, Verdict, validate_log_file, validate_log_line,
};
use segheap_harness::{Trace, TraceValidator};

fn traced_heap() -> Heap {
    Heap::new(HeapConfig {
        log_level: LogThreshold::Trace,
        ..HeapConfig::default()
    })
    .unwrap()
}

#[test]
fn lifecycle_records_emit_as_valid_jsonl() {
    let mut heap = traced_heap();
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(200).unwrap();
    heap.free(a).unwrap();
    heap.reallocate(b, 500).unwrap();
    heap.free(0).unwrap();

    let records = heap.drain_lifecycle_logs();
    assert!(records.len() >= 5);
    assert!(heap.lifecycle_logs().is_empty());

    let mut emitter = LogEmitter::to_buffer("lifecycle", "run-1");
    let count = emitter.emit_lifecycle(records.clone()).unwrap();
    assert_eq!(count, records.len());
    let text = String::from_utf8(emitter.into_inner()).unwrap();

    let mut events = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let entry = validate_log_line(line, i + 1)
            .unwrap_or_else(|errs| panic!("line {}: {errs:?}", i + 1));
        assert!(entry.trace_id.starts_with("core::heap::"));
        assert_eq!(entry.trial.as_deref(), Some("lifecycle"));
        events.push(entry.event);
    }
    assert_eq!(events.first().map(String::as_str), Some("init"));
    assert!(events.iter().any(|e| e == "grow"));
    assert!(events.iter().any(|e| e == "realloc"));
}

#[test]
fn lifted_entry_keeps_counter_snapshot() {
    let mut heap = traced_heap();
    heap.allocate(64).unwrap();
    let record = heap
        .lifecycle_logs()
        .iter()
        .rev()
        .find(|r| r.event == "alloc")
        .cloned()
        .unwrap();

    let entry = LogEntry::from_lifecycle(&record);
    assert_eq!(entry.level, LogLevel::from(record.level));
    assert_eq!(entry.symbol.as_deref(), Some("allocate"));
    assert_eq!(entry.offset, record.offset);
    let details = entry.details.unwrap();
    assert_eq!(details["decision_id"], record.decision_id);
    assert_eq!(details["heap_len"], heap.heap_len());
    assert_eq!(details["live_blocks"], 1);
}

#[test]
fn off_threshold_records_nothing() {
    let mut heap = Heap::new(HeapConfig {
        log_level: LogThreshold::Off,
        ..HeapConfig::default()
    })
    .unwrap();
    let ptr = heap.allocate(10).unwrap();
    heap.free(ptr).unwrap();
    assert!(heap.lifecycle_logs().is_empty());
}

#[test]
fn trial_summary_round_trips_through_a_log_file() {
    let config = HeapConfig::default();
    let trace = Trace::synthetic("summary", 11, 8, 200, 700);
    let report = TraceValidator::new()
        .validate_config(config.clone(), &trace)
        .unwrap();

    let dir = std::env::temp_dir().join(format!("segheap-log-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("trial.jsonl");
    {
        let mut emitter = LogEmitter::to_file(&path, "summary", "run-7").unwrap();
        emitter.emit(LogLevel::Info, "trial_start").unwrap();
        let summary = LogEntry::new("", LogLevel::Info, "trial_end")
            .with_config(&config)
            .with_trace_digest(report.digest.clone())
            .with_verdict(Verdict::Pass)
            .with_details(serde_json::to_value(&report).unwrap());
        emitter.emit_entry(summary).unwrap();
        emitter.flush().unwrap();
    }

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 2);
    assert!(errors.is_empty(), "{errors:?}");
    let text = std::fs::read_to_string(&path).unwrap();
    let last = text.lines().last().unwrap();
    let entry = validate_log_line(last, 2).unwrap();
    assert_eq!(entry.trace_id, "summary::run-7::002");
    assert_eq!(entry.split_threshold, Some(config.split_threshold));
    assert_eq!(entry.trace_digest.as_deref(), Some(report.digest.as_str()));
    std::fs::remove_dir_all(&dir).ok();
}
