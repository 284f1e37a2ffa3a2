//! Core of the heart-rate relay.
//!
//! Observes a heart-rate sample source through a resumable cursor and
//! republishes every new sample to a private per-owner log and a public,
//! share-id addressed stream.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod repo;
pub mod service;
pub mod source;

pub use config::{ConfigError, PipelineConfig};
pub use logging::{default_log_level, init_logging, init_logging_with, logging_status, LogSettings};
pub use model::identity::ShareIdentity;
pub use model::record::{timestamp_key, CanonicalRecord};
pub use model::sample::{RawSample, Sample, SampleError};
pub use pipeline::observer::{ObserveError, Observer, Subscription};
pub use pipeline::relay::{BatchHandler, RecordObserved, Relay, RelayError};
pub use pipeline::sink::{
    DocumentBackend, PrivateLogSink, PublicStreamSink, Sink, SinkError, SinkSet,
};
pub use pipeline::{advisory_channel, Advisory};
pub use repo::document_repo::{ChildListQuery, SqliteDocumentRepo};
pub use repo::state_repo::{CursorStore, IdentityProvider, SqliteStateRepo};
pub use repo::{RepoError, RepoResult};
pub use service::session_service::{
    MonitorSession, SessionError, SessionOptions, SessionState, SessionStatus,
};
pub use source::{
    AuthError, Cursor, HostSampleSource, JsonLinesSource, QueryBatch, QueryError, SampleSource,
    WakeReason, WakeReceiver,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
