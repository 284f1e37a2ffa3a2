//! Record sinks and the document backend they write through.
//!
//! # Responsibility
//! - `PrivateLogSink`: `owner/{ownerId}/heartRate/{key}`.
//! - `PublicStreamSink`: `public/{shareId}/latest` and
//!   `public/{shareId}/heartRate/{key}`.
//!
//! # Invariants
//! - Writes are replace-by-key; no sink keeps state between records.
//! - A missing owner id is a soft skip for the private log only.
//! - Path segments never contain characters the backend treats as structure.

use crate::model::identity::ShareIdentity;
use crate::model::record::CanonicalRecord;
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub const OWNER_ROOT: &str = "owner";
pub const PUBLIC_ROOT: &str = "public";
pub const HISTORY_NODE: &str = "heartRate";
pub const LATEST_NODE: &str = "latest";

const FORBIDDEN_SEGMENT_CHARS: &[char] = &['/', '.', '#', '$', '[', ']'];

/// Sink write failure; isolated to the sink that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    InvalidPathSegment { field: &'static str, value: String },
    Serialize(String),
    Backend(String),
}

impl Display for SinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPathSegment { field, value } => {
                write!(f, "{field} `{value}` is not a valid path segment")
            }
            Self::Serialize(message) => write!(f, "record serialization failed: {message}"),
            Self::Backend(message) => write!(f, "backend write failed: {message}"),
        }
    }
}

impl Error for SinkError {}

/// Storage backend keyed by slash-separated paths.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Writes or overwrites the document at `path`.
    async fn set_document(&self, path: &str, body: &Value) -> Result<(), SinkError>;
}

/// Write destination for canonical records.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable name used in logs and advisories.
    fn name(&self) -> &str;

    async fn accept(
        &self,
        record: &CanonicalRecord,
        identity: &ShareIdentity,
    ) -> Result<(), SinkError>;
}

/// Per-owner private log keyed by record end time.
pub struct PrivateLogSink {
    backend: Arc<dyn DocumentBackend>,
}

impl PrivateLogSink {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Sink for PrivateLogSink {
    fn name(&self) -> &str {
        "private_log"
    }

    async fn accept(
        &self,
        record: &CanonicalRecord,
        identity: &ShareIdentity,
    ) -> Result<(), SinkError> {
        let Some(owner_id) = identity.owner_id.as_deref() else {
            debug!("event=sink_write module=pipeline status=skip sink=private_log reason=no_owner_id");
            return Ok(());
        };
        let path = private_history_path(owner_id, &record.key())?;
        let body = payload(record)?;
        self.backend.set_document(&path, &body).await
    }
}

/// Public share-id addressed stream: a latest slot plus keyed history.
pub struct PublicStreamSink {
    backend: Arc<dyn DocumentBackend>,
}

impl PublicStreamSink {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Sink for PublicStreamSink {
    fn name(&self) -> &str {
        "public_stream"
    }

    async fn accept(
        &self,
        record: &CanonicalRecord,
        identity: &ShareIdentity,
    ) -> Result<(), SinkError> {
        let latest = public_latest_path(&identity.share_id)?;
        let history = public_history_path(&identity.share_id, &record.key())?;
        let body = payload(record)?;

        // Both locations are attempted; the first failure is reported.
        let latest_result = self.backend.set_document(&latest, &body).await;
        let history_result = self.backend.set_document(&history, &body).await;
        latest_result.and(history_result)
    }
}

/// Configured set of sinks a relay fans out to.
///
/// An empty set is the local-display-only configuration.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkSet {
    /// No remote writes; records only reach the observed notification.
    pub fn local_only() -> Self {
        Self::default()
    }

    /// Private log plus public stream over one backend.
    pub fn published(backend: Arc<dyn DocumentBackend>) -> Self {
        Self::local_only()
            .with_sink(Arc::new(PrivateLogSink::new(backend.clone())))
            .with_sink(Arc::new(PublicStreamSink::new(backend)))
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Sink>> {
        self.sinks.iter()
    }
}

pub fn private_history_parent(owner_id: &str) -> Result<String, SinkError> {
    validate_segment("owner id", owner_id)?;
    Ok(format!("{OWNER_ROOT}/{owner_id}/{HISTORY_NODE}"))
}

pub fn private_history_path(owner_id: &str, key: &str) -> Result<String, SinkError> {
    Ok(format!("{}/{key}", private_history_parent(owner_id)?))
}

pub fn public_latest_path(share_id: &str) -> Result<String, SinkError> {
    validate_segment("share id", share_id)?;
    Ok(format!("{PUBLIC_ROOT}/{share_id}/{LATEST_NODE}"))
}

pub fn public_history_parent(share_id: &str) -> Result<String, SinkError> {
    validate_segment("share id", share_id)?;
    Ok(format!("{PUBLIC_ROOT}/{share_id}/{HISTORY_NODE}"))
}

pub fn public_history_path(share_id: &str, key: &str) -> Result<String, SinkError> {
    Ok(format!("{}/{key}", public_history_parent(share_id)?))
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), SinkError> {
    if value.is_empty() || value.contains(FORBIDDEN_SEGMENT_CHARS) {
        return Err(SinkError::InvalidPathSegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn payload(record: &CanonicalRecord) -> Result<Value, SinkError> {
    record
        .to_payload()
        .map_err(|err| SinkError::Serialize(err.to_string()))
}
