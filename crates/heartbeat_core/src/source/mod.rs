//! Sample source adapter port.
//!
//! # Responsibility
//! - Define the contract a platform sensor integration implements:
//!   availability, authorization, anchored queries and wake-up registration.
//! - Define the opaque cursor and the error taxonomy of the source boundary.
//!
//! # Invariants
//! - A failed query never returns a partial batch or a new cursor.
//! - A cursor returned by a query fully supersedes the one it was anchored at.
//! - Wake events carry no data; the observer always re-queries.

use crate::model::sample::Sample;
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::mpsc;

pub mod file;
pub mod host;

pub use file::JsonLinesSource;
pub use host::HostSampleSource;

/// Opaque resumption token marking the "already delivered" boundary.
///
/// Only the source that issued a cursor interprets its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of one anchored query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBatch {
    /// New samples in the order the source returned them.
    pub samples: Vec<Sample>,
    /// Cursor covering everything in `samples` and before.
    pub cursor: Cursor,
}

/// Why the observer was asked to re-query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// First fetch right after subscribing.
    Initial,
    /// The platform signalled that new data may exist.
    Notified,
    /// Periodic poll.
    Periodic,
    /// Explicit request from the embedding host.
    Requested,
}

impl WakeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Notified => "notified",
            Self::Periodic => "periodic",
            Self::Requested => "requested",
        }
    }
}

/// Receiving end of a wake-up registration.
pub type WakeReceiver = mpsc::Receiver<WakeReason>;

/// Authorization failures; fatal to starting a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// The platform does not expose health data at all.
    Unavailable,
    /// The user or platform refused read access.
    Denied,
    /// Heart-rate data is not supported on this device.
    CapabilityUnavailable,
}

impl AuthError {
    pub fn code(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Denied => "denied",
            Self::CapabilityUnavailable => "capability_unavailable",
        }
    }
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "health data is not available on this device"),
            Self::Denied => write!(f, "permission to read heart rate data was denied"),
            Self::CapabilityUnavailable => write!(f, "heart rate data type is not available"),
        }
    }
}

impl Error for AuthError {}

/// Transient query failures. The cursor stays where it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The platform could not serve the query right now.
    Busy(String),
    /// The cursor was not issued by this source or is corrupt.
    InvalidCursor(String),
    Io(String),
    /// Source data could not be decoded into samples.
    Malformed(String),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy(message) => write!(f, "sample source busy: {message}"),
            Self::InvalidCursor(value) => write!(f, "invalid cursor `{value}`"),
            Self::Io(message) => write!(f, "sample source io error: {message}"),
            Self::Malformed(message) => write!(f, "malformed sample data: {message}"),
        }
    }
}

impl Error for QueryError {}

impl From<std::io::Error> for QueryError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Platform sensor integration consumed by the observer.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Stable identifier used in logs.
    fn source_id(&self) -> &str;

    /// Whether the platform exposes the sensor capability at all.
    fn is_available(&self) -> bool;

    /// Suspends until the user/platform grants or refuses read access.
    async fn request_authorization(&self) -> Result<(), AuthError>;

    /// Returns samples newer than `anchor` (full history when `None`) and a
    /// cursor covering them.
    async fn query_anchored(&self, anchor: Option<&Cursor>) -> Result<QueryBatch, QueryError>;

    /// Requests best-effort wake-ups when new data may exist.
    ///
    /// Returns `None` when the platform has no push mechanism; the observer
    /// then relies on periodic polling.
    fn register_wakeups(&self) -> Option<WakeReceiver>;

    /// Drops the wake-up registration. Safe to call when none exists.
    fn release_wakeups(&self);
}
