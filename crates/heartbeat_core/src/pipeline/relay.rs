//! Sample relay: per-sample conversion and fan-out to sinks.
//!
//! # Responsibility
//! - Convert each sample of a batch into a [`CanonicalRecord`] in arrival order.
//! - Queue the record on every sink's ordered writer without awaiting it.
//! - Publish the most recent record to the observed notification slot.
//!
//! # Invariants
//! - Holds no sample state across `deliver` calls.
//! - One failing sink never blocks or fails another sink or the batch.
//! - Per sink, writes apply in dispatch order, so `latest` is the last
//!   dispatched record.
//! - Once halted, no further record is dispatched. A batch that passed the
//!   halt check before `halt()` may still finish dispatching.

use crate::model::identity::ShareIdentity;
use crate::model::record::CanonicalRecord;
use crate::model::sample::Sample;
use crate::pipeline::sink::{Sink, SinkSet};
use crate::pipeline::{report, Advisory};
use crate::repo::state_repo::IdentityProvider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Consumer of observed batches.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Hands a batch off; returns the number of dispatched samples.
    ///
    /// An error means the batch was not fully handed off and the cursor must
    /// not advance.
    async fn deliver(&self, batch: &[Sample]) -> Result<usize, RelayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The relay was halted; `dispatched` samples went out before that.
    Halted { dispatched: usize },
}

impl Display for RelayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Halted { dispatched } => {
                write!(f, "relay halted after dispatching {dispatched} sample(s)")
            }
        }
    }
}

impl Error for RelayError {}

/// Presentation-facing summary of the most recently dispatched record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordObserved {
    pub bpm: u32,
    pub at: DateTime<Utc>,
    pub source: String,
}

impl From<&CanonicalRecord> for RecordObserved {
    fn from(value: &CanonicalRecord) -> Self {
        Self {
            bpm: value.bpm,
            at: value.end,
            source: value.source.clone(),
        }
    }
}

enum SinkJob {
    Write {
        record: Arc<CanonicalRecord>,
        identity: ShareIdentity,
    },
    Flush(oneshot::Sender<()>),
}

struct SinkWorker {
    name: String,
    jobs: mpsc::UnboundedSender<SinkJob>,
}

impl SinkWorker {
    fn spawn(sink: Arc<dyn Sink>, advisories: broadcast::Sender<Advisory>) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let name = sink.name().to_string();
        tokio::spawn(run_sink_worker(sink, rx, advisories));
        Self { name, jobs }
    }
}

/// Fan-out stage between the observer and the sinks.
pub struct Relay {
    share_id: String,
    identity: Arc<dyn IdentityProvider>,
    workers: Vec<SinkWorker>,
    observed: Arc<watch::Sender<Option<RecordObserved>>>,
    advisories: broadcast::Sender<Advisory>,
    halted: AtomicBool,
}

impl Relay {
    /// Spawns one ordered writer task per configured sink.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        share_id: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
        sinks: &SinkSet,
        observed: Arc<watch::Sender<Option<RecordObserved>>>,
        advisories: broadcast::Sender<Advisory>,
    ) -> Self {
        let workers = sinks
            .iter()
            .map(|sink| SinkWorker::spawn(sink.clone(), advisories.clone()))
            .collect();
        Self {
            share_id: share_id.into(),
            identity,
            workers,
            observed,
            advisories,
            halted: AtomicBool::new(false),
        }
    }

    /// Stops dispatching. Idempotent.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Waits until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let mut acks = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let (tx, rx) = oneshot::channel();
            if worker.jobs.send(SinkJob::Flush(tx)).is_ok() {
                acks.push(rx);
            }
        }
        for ack in acks {
            // A dropped ack means the worker is gone; nothing left to wait for.
            let _ = ack.await;
        }
    }

    fn dispatch(&self, record: Arc<CanonicalRecord>, identity: &ShareIdentity) {
        for worker in &self.workers {
            let job = SinkJob::Write {
                record: record.clone(),
                identity: identity.clone(),
            };
            if worker.jobs.send(job).is_err() {
                error!(
                    "event=sink_enqueue module=pipeline status=error sink={} error_code=worker_gone",
                    worker.name
                );
                report(
                    &self.advisories,
                    Advisory::SinkFailed {
                        sink: worker.name.clone(),
                        key: record.key(),
                        message: "sink writer is no longer running".to_string(),
                    },
                );
            }
        }
        self.observed
            .send_replace(Some(RecordObserved::from(record.as_ref())));
    }
}

#[async_trait]
impl BatchHandler for Relay {
    async fn deliver(&self, batch: &[Sample]) -> Result<usize, RelayError> {
        let identity = ShareIdentity::new(self.identity.owner_id(), self.share_id.clone());
        for (index, sample) in batch.iter().enumerate() {
            if self.is_halted() {
                return Err(RelayError::Halted { dispatched: index });
            }
            let record = Arc::new(CanonicalRecord::from_sample(sample));
            debug!(
                "event=record_dispatch module=pipeline status=ok key={} bpm={} sinks={}",
                record.key(),
                record.bpm,
                self.workers.len()
            );
            self.dispatch(record, &identity);
        }
        if batch.is_empty() && self.is_halted() {
            return Err(RelayError::Halted { dispatched: 0 });
        }
        Ok(batch.len())
    }
}

async fn run_sink_worker(
    sink: Arc<dyn Sink>,
    mut jobs: mpsc::UnboundedReceiver<SinkJob>,
    advisories: broadcast::Sender<Advisory>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            SinkJob::Write { record, identity } => {
                let started_at = Instant::now();
                match sink.accept(&record, &identity).await {
                    Ok(()) => debug!(
                        "event=sink_write module=pipeline status=ok sink={} key={} duration_ms={}",
                        sink.name(),
                        record.key(),
                        started_at.elapsed().as_millis()
                    ),
                    Err(err) => {
                        warn!(
                            "event=sink_write module=pipeline status=error sink={} key={} duration_ms={} error={}",
                            sink.name(),
                            record.key(),
                            started_at.elapsed().as_millis(),
                            err
                        );
                        report(
                            &advisories,
                            Advisory::SinkFailed {
                                sink: sink.name().to_string(),
                                key: record.key(),
                                message: err.to_string(),
                            },
                        );
                    }
                }
            }
            SinkJob::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
