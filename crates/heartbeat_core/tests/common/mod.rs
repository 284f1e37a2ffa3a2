#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use heartbeat_core::{
    AuthError, BatchHandler, CanonicalRecord, Cursor, HostSampleSource, QueryBatch, QueryError,
    RelayError, Sample, SampleSource, ShareIdentity, Sink, SinkError, WakeReceiver,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

pub fn sample(bpm: f64, end_ms: i64) -> Sample {
    Sample::instant(bpm, at(end_ms), "Watch").unwrap()
}

/// One JSON-lines record as the file source reads it.
pub fn jsonl_line(bpm: f64, end_ms: i64) -> String {
    let end = at(end_ms).to_rfc3339();
    format!(r#"{{"bpm":{bpm},"start":"{end}","end":"{end}","source":"Watch"}}"#) + "\n"
}

pub fn write_lines(path: &std::path::Path, lines: &[String]) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for line in lines {
        file.write_all(line.as_bytes()).unwrap();
    }
}

pub fn sample_from(bpm: f64, end_ms: i64, source: &str) -> Sample {
    Sample::instant(bpm, at(end_ms), source).unwrap()
}

/// Host source that records every anchor it is queried with and can be told
/// to fail or park the next query.
pub struct ScriptedSource {
    pub inner: HostSampleSource,
    anchors: Mutex<Vec<Option<Cursor>>>,
    fail_next: Mutex<Option<QueryError>>,
    hold_next: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::wrap(HostSampleSource::new("scripted"))
    }

    pub fn wrap(inner: HostSampleSource) -> Self {
        Self {
            inner,
            anchors: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            hold_next: AtomicBool::new(false),
            entered: Notify::new(),
            released: Notify::new(),
        }
    }

    pub fn push(&self, samples: impl IntoIterator<Item = Sample>) {
        self.inner.push(samples);
    }

    pub fn fail_next_query(&self, err: QueryError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    /// Parks the next query until `release_query` is called.
    pub fn hold_next_query(&self) {
        self.hold_next.store(true, Ordering::SeqCst);
    }

    /// Resolves once a held query has been entered.
    pub async fn query_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release_query(&self) {
        self.released.notify_one();
    }

    pub fn anchors(&self) -> Vec<Option<Cursor>> {
        self.anchors.lock().unwrap().clone()
    }

    pub fn query_count(&self) -> usize {
        self.anchors.lock().unwrap().len()
    }
}

#[async_trait]
impl SampleSource for ScriptedSource {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn request_authorization(&self) -> Result<(), AuthError> {
        self.inner.request_authorization().await
    }

    async fn query_anchored(&self, anchor: Option<&Cursor>) -> Result<QueryBatch, QueryError> {
        self.anchors.lock().unwrap().push(anchor.cloned());
        if self.hold_next.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.released.notified().await;
        }
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        self.inner.query_anchored(anchor).await
    }

    fn register_wakeups(&self) -> Option<WakeReceiver> {
        self.inner.register_wakeups()
    }

    fn release_wakeups(&self) {
        self.inner.release_wakeups()
    }
}

/// Batch handler that records batches and can fail a number of calls,
/// dispatching only part of the batch before failing.
#[derive(Default)]
pub struct RecordingHandler {
    batches: Mutex<Vec<Vec<Sample>>>,
    failures_left: AtomicUsize,
}

impl RecordingHandler {
    pub fn failing(times: usize) -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(times),
        }
    }

    pub fn batches(&self) -> Vec<Vec<Sample>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<Sample> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl BatchHandler for RecordingHandler {
    async fn deliver(&self, batch: &[Sample]) -> Result<usize, RelayError> {
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(RelayError::Halted {
                dispatched: batch.len() / 2,
            });
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(batch.len())
    }
}

/// Sink that rejects every record.
pub struct FailingSink;

#[async_trait]
impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn accept(
        &self,
        _record: &CanonicalRecord,
        _identity: &ShareIdentity,
    ) -> Result<(), SinkError> {
        Err(SinkError::Backend("backend offline".to_string()))
    }
}

/// Sink that keeps every accepted record in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<CanonicalRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<CanonicalRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn accept(
        &self,
        record: &CanonicalRecord,
        _identity: &ShareIdentity,
    ) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
