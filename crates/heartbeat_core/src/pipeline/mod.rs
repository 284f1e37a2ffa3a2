//! Anchored observation and fan-out publish pipeline.
//!
//! # Responsibility
//! - `observer`: own the cursor, turn wake events into anchored queries.
//! - `relay`: convert each sample to a canonical record and fan it out.
//! - `sink`: write records to their private/public destinations.
//!
//! # Invariants
//! - The cursor advances only after its batch was fully handed to the relay.
//! - Delivery order is dispatch order; nothing is re-sorted by event time.
//! - Errors past the relay boundary become [`Advisory`] values, never panics
//!   or propagated failures.

use tokio::sync::broadcast;

pub mod observer;
pub mod relay;
pub mod sink;

const ADVISORY_CAPACITY: usize = 32;

/// Non-fatal pipeline problem surfaced to the presentation layer.
///
/// The session keeps monitoring; these are transient advisories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    /// An anchored query failed; the next wake retries from the same cursor.
    QueryFailed { message: String },
    /// The relay refused a batch; the cursor was not advanced.
    DeliveryAborted { message: String },
    /// The source rejected the stored cursor; full history is replayed.
    CursorReset { message: String },
    /// The batch was delivered but the new cursor could not be persisted.
    CursorNotPersisted { message: String },
    /// One sink failed to write one record; other sinks are unaffected.
    SinkFailed {
        sink: String,
        key: String,
        message: String,
    },
}

impl Advisory {
    pub fn message(&self) -> &str {
        match self {
            Self::QueryFailed { message }
            | Self::DeliveryAborted { message }
            | Self::CursorReset { message }
            | Self::CursorNotPersisted { message }
            | Self::SinkFailed { message, .. } => message,
        }
    }
}

/// Creates the advisory broadcast channel. Slow listeners lose the oldest
/// advisories instead of growing a backlog.
pub fn advisory_channel() -> (broadcast::Sender<Advisory>, broadcast::Receiver<Advisory>) {
    broadcast::channel(ADVISORY_CAPACITY)
}

pub(crate) fn report(advisories: &broadcast::Sender<Advisory>, advisory: Advisory) {
    // No receivers is fine: advisories are best-effort.
    let _ = advisories.send(advisory);
}
