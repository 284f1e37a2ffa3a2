//! Source adapter fed by an embedding platform bridge.
//!
//! The host (e.g. a mobile shell that owns the real sensor API) pushes
//! samples in as the platform reports them; the observer reads them back with
//! anchored queries. Cursors have the form `host:<generation>:<offset>`.
//!
//! The history lives only as long as this value, so every instance draws a
//! fresh generation. A cursor persisted by an earlier process fails with
//! `InvalidCursor` instead of indexing into unrelated samples.

use crate::model::sample::Sample;
use crate::source::{
    AuthError, Cursor, QueryBatch, QueryError, SampleSource, WakeReason, WakeReceiver,
};
use async_trait::async_trait;
use log::debug;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

const CURSOR_PREFIX: &str = "host:";
const DEFAULT_BATCH_LIMIT: usize = 500;
const GENERATION_LEN: usize = 8;

/// In-process source whose history is appended by the host platform.
pub struct HostSampleSource {
    source_id: String,
    generation: String,
    available: bool,
    batch_limit: usize,
    authorization: Mutex<Result<(), AuthError>>,
    history: Mutex<Vec<Sample>>,
    wake_tx: Mutex<Option<mpsc::Sender<WakeReason>>>,
}

impl HostSampleSource {
    /// Creates an available, authorized source with an empty history.
    pub fn new(source_id: impl Into<String>) -> Self {
        let mut generation = Uuid::new_v4().simple().to_string();
        generation.truncate(GENERATION_LEN);
        Self {
            source_id: source_id.into(),
            generation,
            available: true,
            batch_limit: DEFAULT_BATCH_LIMIT,
            authorization: Mutex::new(Ok(())),
            history: Mutex::new(Vec::new()),
            wake_tx: Mutex::new(None),
        }
    }

    /// Caps the number of samples returned by one query (minimum 1).
    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    /// Marks the platform capability as missing.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Sets the outcome the next authorization request resolves with.
    pub fn set_authorization(&self, outcome: Result<(), AuthError>) {
        *lock(&self.authorization) = outcome;
    }

    /// Appends samples reported by the platform and signals a wake-up.
    ///
    /// Returns the history length after the append.
    pub fn push(&self, samples: impl IntoIterator<Item = Sample>) -> usize {
        let len = {
            let mut history = lock(&self.history);
            history.extend(samples);
            history.len()
        };
        self.notify(WakeReason::Notified);
        len
    }

    /// Cursor this instance issues after delivering `offset` samples.
    pub fn cursor_at(&self, offset: usize) -> Cursor {
        Cursor::new(format!("{CURSOR_PREFIX}{}:{offset}", self.generation))
    }

    fn parse_cursor(&self, cursor: &Cursor) -> Result<usize, QueryError> {
        cursor
            .as_str()
            .strip_prefix(CURSOR_PREFIX)
            .and_then(|rest| rest.split_once(':'))
            .filter(|(generation, _)| *generation == self.generation)
            .and_then(|(_, offset)| offset.parse::<usize>().ok())
            .ok_or_else(|| QueryError::InvalidCursor(cursor.to_string()))
    }

    /// Signals that new data may exist without appending anything.
    pub fn notify(&self, reason: WakeReason) {
        let mut wake_tx = lock(&self.wake_tx);
        let Some(sender) = wake_tx.as_ref() else {
            return;
        };
        match sender.try_send(reason) {
            Ok(()) => {}
            // A wake is already queued; the pending query will see the data.
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => {
                debug!(
                    "event=wake_notify module=source status=skip source={} reason=receiver_closed",
                    self.source_id
                );
                *wake_tx = None;
            }
        }
    }
}

#[async_trait]
impl SampleSource for HostSampleSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn request_authorization(&self) -> Result<(), AuthError> {
        if !self.available {
            return Err(AuthError::Unavailable);
        }
        *lock(&self.authorization)
    }

    async fn query_anchored(&self, anchor: Option<&Cursor>) -> Result<QueryBatch, QueryError> {
        let offset = match anchor {
            Some(cursor) => self.parse_cursor(cursor)?,
            None => 0,
        };

        let (samples, end, remaining) = {
            let history = lock(&self.history);
            if offset > history.len() {
                return Err(QueryError::InvalidCursor(format!(
                    "offset {offset} is past the end of history ({})",
                    history.len()
                )));
            }
            let end = history.len().min(offset + self.batch_limit);
            (history[offset..end].to_vec(), end, history.len() - end)
        };

        if remaining > 0 {
            self.notify(WakeReason::Notified);
        }

        Ok(QueryBatch {
            samples,
            cursor: self.cursor_at(end),
        })
    }

    fn register_wakeups(&self) -> Option<WakeReceiver> {
        let (tx, rx) = mpsc::channel(1);
        *lock(&self.wake_tx) = Some(tx);
        Some(rx)
    }

    fn release_wakeups(&self) {
        lock(&self.wake_tx).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Guarded values stay consistent even if a holder panicked.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::HostSampleSource;
    use crate::model::sample::Sample;
    use crate::source::{AuthError, Cursor, QueryError, SampleSource, WakeReason};
    use chrono::{TimeZone, Utc};

    fn sample(bpm: f64, end_ms: i64) -> Sample {
        Sample::instant(bpm, Utc.timestamp_millis_opt(end_ms).unwrap(), "Watch").unwrap()
    }

    #[tokio::test]
    async fn queries_resume_from_cursor() {
        let source = HostSampleSource::new("host");
        source.push([sample(60.0, 1_000), sample(61.0, 2_000)]);

        let first = source.query_anchored(None).await.unwrap();
        assert_eq!(first.samples.len(), 2);
        assert_eq!(first.cursor, source.cursor_at(2));

        source.push([sample(62.0, 3_000)]);
        let second = source.query_anchored(Some(&first.cursor)).await.unwrap();
        assert_eq!(second.samples, vec![sample(62.0, 3_000)]);

        let empty = source.query_anchored(Some(&second.cursor)).await.unwrap();
        assert!(empty.samples.is_empty());
        assert_eq!(empty.cursor, second.cursor);
    }

    #[tokio::test]
    async fn bounded_query_signals_remaining_data() {
        let source = HostSampleSource::new("host").with_batch_limit(2);
        let mut wakes = source.register_wakeups().unwrap();
        source.push((0..5).map(|i| sample(60.0 + f64::from(i), 1_000 * i64::from(i + 1))));
        assert_eq!(wakes.recv().await, Some(WakeReason::Notified));

        let batch = source.query_anchored(None).await.unwrap();
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(batch.cursor, source.cursor_at(2));
        assert_eq!(wakes.recv().await, Some(WakeReason::Notified));
    }

    #[tokio::test]
    async fn rejects_foreign_or_future_cursor() {
        let source = HostSampleSource::new("host");
        let foreign = source
            .query_anchored(Some(&Cursor::new("offset:4")))
            .await
            .unwrap_err();
        assert!(matches!(foreign, QueryError::InvalidCursor(_)));

        let future = source
            .query_anchored(Some(&source.cursor_at(9)))
            .await
            .unwrap_err();
        assert!(matches!(future, QueryError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn cursor_from_previous_instance_is_rejected() {
        let before_restart = HostSampleSource::new("host");
        before_restart.push([sample(60.0, 1_000), sample(61.0, 2_000)]);
        let stale = before_restart.query_anchored(None).await.unwrap().cursor;

        let after_restart = HostSampleSource::new("host");
        after_restart.push((0..3).map(|i| sample(70.0 + f64::from(i), 5_000 + i64::from(i))));
        let err = after_restart
            .query_anchored(Some(&stale))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn authorization_reflects_host_outcome() {
        let source = HostSampleSource::new("host");
        assert_eq!(source.request_authorization().await, Ok(()));
        source.set_authorization(Err(AuthError::Denied));
        assert_eq!(source.request_authorization().await, Err(AuthError::Denied));

        let missing = HostSampleSource::new("host").unavailable();
        assert!(!missing.is_available());
        assert_eq!(
            missing.request_authorization().await,
            Err(AuthError::Unavailable)
        );
    }

    #[test]
    fn release_is_idempotent_and_push_without_registration_is_silent() {
        let source = HostSampleSource::new("host");
        source.release_wakeups();
        source.release_wakeups();
        assert_eq!(source.push([sample(70.0, 1_000)]), 1);
    }
}
