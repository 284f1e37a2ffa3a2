//! Cursor-anchored observer and its wake-loop subscription.
//!
//! # Responsibility
//! - Own the single cursor; re-query the source from it on every wake.
//! - Hand each batch to the relay, then advance and persist the cursor.
//! - Run the wake loop (initial, notified, periodic) until cancelled.
//!
//! # Invariants
//! - Cursor read-modify-write is serialized by one async mutex held for the
//!   whole query/deliver/commit cycle.
//! - On query or delivery failure the cursor is left untouched, so the next
//!   wake re-queries from the same anchor (at-least-once).
//! - A cursor the source rejects as invalid is dropped, and the same wake
//!   re-queries full history. Skipping undelivered samples is never an option.
//! - A crash between delivery and cursor persistence re-delivers that batch
//!   on the next launch.

use crate::pipeline::relay::{BatchHandler, RelayError};
use crate::pipeline::{report, Advisory};
use crate::repo::state_repo::CursorStore;
use crate::repo::RepoResult;
use crate::source::{Cursor, QueryError, SampleSource, WakeReason, WakeReceiver};
use log::{debug, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

/// Failure of one wake cycle. Already logged and reported when returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveError {
    Query(QueryError),
    Relay(RelayError),
}

impl Display for ObserveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query(err) => write!(f, "{err}"),
            Self::Relay(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ObserveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Query(err) => Some(err),
            Self::Relay(err) => Some(err),
        }
    }
}

/// Observer state machine around one cursor.
pub struct Observer {
    source: Arc<dyn SampleSource>,
    handler: Arc<dyn BatchHandler>,
    cursor_store: Arc<dyn CursorStore>,
    advisories: broadcast::Sender<Advisory>,
    cursor: Mutex<Option<Cursor>>,
}

impl Observer {
    /// Creates an observer resuming from the persisted cursor, if any.
    pub fn resume(
        source: Arc<dyn SampleSource>,
        handler: Arc<dyn BatchHandler>,
        cursor_store: Arc<dyn CursorStore>,
        advisories: broadcast::Sender<Advisory>,
    ) -> RepoResult<Self> {
        let cursor = cursor_store.load_cursor(source.source_id())?;
        info!(
            "event=observer_resume module=pipeline status=ok source={} has_cursor={}",
            source.source_id(),
            cursor.is_some()
        );
        Ok(Self {
            source,
            handler,
            cursor_store,
            advisories,
            cursor: Mutex::new(cursor),
        })
    }

    /// Cursor the next query will be anchored at.
    pub async fn cursor(&self) -> Option<Cursor> {
        self.cursor.lock().await.clone()
    }

    /// Runs one query/deliver/commit cycle.
    ///
    /// Returns the number of samples delivered.
    pub async fn on_wake(&self, reason: WakeReason) -> Result<usize, ObserveError> {
        let mut cursor = self.cursor.lock().await;
        let started_at = Instant::now();

        let mut result = self.source.query_anchored(cursor.as_ref()).await;
        let rejected = match (&result, cursor.as_ref()) {
            (Err(QueryError::InvalidCursor(_)), Some(stale)) => Some(stale.clone()),
            _ => None,
        };
        if let Some(stale) = rejected {
            self.reset_cursor(&stale);
            *cursor = None;
            result = self.source.query_anchored(None).await;
        }

        let batch = match result {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    "event=observer_wake module=pipeline status=error reason={} stage=query duration_ms={} error={}",
                    reason.as_str(),
                    started_at.elapsed().as_millis(),
                    err
                );
                report(
                    &self.advisories,
                    Advisory::QueryFailed {
                        message: err.to_string(),
                    },
                );
                return Err(ObserveError::Query(err));
            }
        };

        let delivered = match self.handler.deliver(&batch.samples).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    "event=observer_wake module=pipeline status=error reason={} stage=deliver batch={} error={}",
                    reason.as_str(),
                    batch.samples.len(),
                    err
                );
                report(
                    &self.advisories,
                    Advisory::DeliveryAborted {
                        message: err.to_string(),
                    },
                );
                return Err(ObserveError::Relay(err));
            }
        };

        if cursor.as_ref() != Some(&batch.cursor) {
            if let Err(err) = self
                .cursor_store
                .save_cursor(self.source.source_id(), &batch.cursor)
            {
                // In-memory cursor still advances; only a restart re-delivers.
                warn!(
                    "event=cursor_save module=pipeline status=error error={}",
                    err
                );
                report(
                    &self.advisories,
                    Advisory::CursorNotPersisted {
                        message: err.to_string(),
                    },
                );
            }
        }
        *cursor = Some(batch.cursor);

        if delivered > 0 {
            info!(
                "event=observer_wake module=pipeline status=ok reason={} delivered={} duration_ms={}",
                reason.as_str(),
                delivered,
                started_at.elapsed().as_millis()
            );
        } else {
            debug!(
                "event=observer_wake module=pipeline status=ok reason={} delivered=0",
                reason.as_str()
            );
        }
        Ok(delivered)
    }

    fn reset_cursor(&self, stale: &Cursor) {
        warn!(
            "event=cursor_reset module=pipeline status=start source={} stale_cursor={} reason=rejected_by_source",
            self.source.source_id(),
            stale
        );
        report(
            &self.advisories,
            Advisory::CursorReset {
                message: format!(
                    "cursor `{stale}` was rejected by {}; replaying full history",
                    self.source.source_id()
                ),
            },
        );
        if let Err(err) = self.cursor_store.clear_cursor(self.source.source_id()) {
            warn!(
                "event=cursor_reset module=pipeline status=error error={}",
                err
            );
        }
    }
}

/// Active wake loop for one observer; the handle returned by subscribing.
///
/// Dropping the subscription cancels it.
pub struct Subscription {
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Spawns the wake loop. It performs the initial fetch immediately.
    ///
    /// `wakes` are platform notifications; `periodic` adds a poll interval.
    pub fn spawn(
        observer: Arc<Observer>,
        wakes: Option<WakeReceiver>,
        periodic: Option<Duration>,
    ) -> Self {
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(run_wake_loop(observer, wakes, periodic, cancelled));
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Prevents any further wake from starting a query. Idempotent.
    ///
    /// A cycle already in flight runs to completion.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Cancels and waits for the loop to exit, including a cycle in flight.
    pub async fn join(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_wake_loop(
    observer: Arc<Observer>,
    mut wakes: Option<WakeReceiver>,
    periodic: Option<Duration>,
    mut cancelled: watch::Receiver<bool>,
) {
    if *cancelled.borrow() {
        return;
    }
    // Failures are logged and reported inside `on_wake`.
    let _ = observer.on_wake(WakeReason::Initial).await;

    let mut ticker = periodic.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let reason = tokio::select! {
            biased;
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    break;
                }
                continue;
            }
            wake = next_wake(&mut wakes) => match wake {
                Some(reason) => reason,
                None => {
                    debug!("event=wake_channel module=pipeline status=skip reason=closed");
                    wakes = None;
                    continue;
                }
            },
            () = next_tick(&mut ticker) => WakeReason::Periodic,
        };

        if *cancelled.borrow() {
            break;
        }
        let _ = observer.on_wake(reason).await;
    }
    debug!("event=wake_loop module=pipeline status=ok stage=exit");
}

async fn next_wake(wakes: &mut Option<WakeReceiver>) -> Option<WakeReason> {
    match wakes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
