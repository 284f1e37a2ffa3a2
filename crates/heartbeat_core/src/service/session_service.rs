//! Observation session lifecycle.
//!
//! # Responsibility
//! - `start()`: check availability, authorize, resolve identity, subscribe.
//! - `stop()`: halt the relay, release wake-ups, wait for the wake loop to
//!   exit and drain queued sink writes.
//! - Publish [`SessionStatus`], [`RecordObserved`] and [`Advisory`] updates.
//!
//! # Invariants
//! - `Failed` is entered only on an authorization error.
//! - Query and sink errors keep the session `Monitoring`.
//! - `start()` while monitoring and `stop()` while idle are no-ops.
//! - Start/stop are serialized; neither interleaves with the other.

use crate::pipeline::observer::{ObserveError, Observer, Subscription};
use crate::pipeline::relay::{BatchHandler, RecordObserved, Relay};
use crate::pipeline::sink::SinkSet;
use crate::pipeline::{advisory_channel, Advisory};
use crate::repo::state_repo::{CursorStore, IdentityProvider};
use crate::repo::RepoError;
use crate::source::{AuthError, SampleSource, WakeReason};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};

/// Observation session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Authorizing,
    Monitoring,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Authorizing => "authorizing",
            Self::Monitoring => "monitoring",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// State plus the authorization error that caused `Failed`, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub error: Option<AuthError>,
}

impl SessionStatus {
    fn new(state: SessionState, error: Option<AuthError>) -> Self {
        Self { state, error }
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// Authorization failed; the session is `Failed`.
    Auth(AuthError),
    /// Identity or cursor state could not be loaded.
    Storage(RepoError),
    /// The operation needs an active subscription.
    NotMonitoring,
    Observe(ObserveError),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "session storage error: {err}"),
            Self::NotMonitoring => write!(f, "session is not monitoring"),
            Self::Observe(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Auth(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::NotMonitoring => None,
            Self::Observe(err) => Some(err),
        }
    }
}

/// Tunables for one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Poll interval added to platform wake-ups; `None` disables polling.
    pub periodic_wake: Option<Duration>,
}

struct ActiveSession {
    observer: Arc<Observer>,
    relay: Arc<Relay>,
    subscription: Subscription,
}

/// One observation session over a source, a cursor store and a sink set.
pub struct MonitorSession {
    source: Arc<dyn SampleSource>,
    cursor_store: Arc<dyn CursorStore>,
    identity: Arc<dyn IdentityProvider>,
    sinks: SinkSet,
    options: SessionOptions,
    status: watch::Sender<SessionStatus>,
    observed: Arc<watch::Sender<Option<RecordObserved>>>,
    advisories: broadcast::Sender<Advisory>,
    active: Mutex<Option<ActiveSession>>,
}

impl MonitorSession {
    pub fn new(
        source: Arc<dyn SampleSource>,
        cursor_store: Arc<dyn CursorStore>,
        identity: Arc<dyn IdentityProvider>,
        sinks: SinkSet,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::new(SessionState::Idle, None));
        let (observed, _) = watch::channel(None);
        let (advisories, _) = advisory_channel();
        Self {
            source,
            cursor_store,
            identity,
            sinks,
            options: SessionOptions::default(),
            status,
            observed: Arc::new(observed),
            advisories,
            active: Mutex::new(None),
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Status updates for the presentation layer.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Most recently dispatched record; intermediate values may be skipped.
    pub fn subscribe_observed(&self) -> watch::Receiver<Option<RecordObserved>> {
        self.observed.subscribe()
    }

    /// Transient pipeline advisories (query and sink failures).
    pub fn subscribe_advisories(&self) -> broadcast::Receiver<Advisory> {
        self.advisories.subscribe()
    }

    /// Authorizes and subscribes.
    ///
    /// # Errors
    /// - `Auth` when the source is unavailable or access is refused; no query
    ///   is issued and the status becomes `Failed`.
    /// - `Storage` when identity or cursor state cannot be loaded.
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            info!("event=session_start module=service status=skip reason=already_monitoring");
            return Ok(());
        }

        info!(
            "event=session_start module=service status=start source={}",
            self.source.source_id()
        );
        self.publish(SessionState::Authorizing, None);

        if !self.source.is_available() {
            return Err(self.fail(AuthError::Unavailable));
        }
        if let Err(err) = self.source.request_authorization().await {
            return Err(self.fail(err));
        }

        let session = match self.subscribe() {
            Ok(session) => session,
            Err(err) => {
                error!(
                    "event=session_start module=service status=error error_code=storage error={}",
                    err
                );
                self.publish(SessionState::Idle, None);
                return Err(SessionError::Storage(err));
            }
        };
        *active = Some(session);
        self.publish(SessionState::Monitoring, None);
        info!(
            "event=session_start module=service status=ok sinks={}",
            self.sinks.len()
        );
        Ok(())
    }

    /// Tears the subscription down and drains queued sink writes.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(session) = active.take() else {
            self.source.release_wakeups();
            return;
        };

        session.relay.halt();
        self.source.release_wakeups();
        // A cycle already in flight finishes against the halted relay, so
        // its cursor stays where it was.
        session.subscription.join().await;
        session.relay.flush().await;
        self.publish(SessionState::Stopped, None);
        info!("event=session_stop module=service status=ok");
    }

    /// Runs one wake cycle inline, as an external notification would.
    pub async fn wake_now(&self) -> Result<usize, SessionError> {
        let observer = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(session) => session.observer.clone(),
                None => return Err(SessionError::NotMonitoring),
            }
        };
        observer
            .on_wake(WakeReason::Requested)
            .await
            .map_err(SessionError::Observe)
    }

    /// Waits until every sink write queued so far has been attempted.
    pub async fn flush(&self) {
        let relay = {
            let active = self.active.lock().await;
            active.as_ref().map(|session| session.relay.clone())
        };
        if let Some(relay) = relay {
            relay.flush().await;
        }
    }

    fn subscribe(&self) -> Result<ActiveSession, RepoError> {
        let share_id = self.identity.get_or_create_share_id()?;
        let relay = Arc::new(Relay::new(
            share_id,
            self.identity.clone(),
            &self.sinks,
            self.observed.clone(),
            self.advisories.clone(),
        ));
        let handler: Arc<dyn BatchHandler> = relay.clone();
        let observer = Arc::new(Observer::resume(
            self.source.clone(),
            handler,
            self.cursor_store.clone(),
            self.advisories.clone(),
        )?);

        let wakes = self.source.register_wakeups();
        if wakes.is_none() && self.options.periodic_wake.is_none() {
            warn!(
                "event=session_start module=service status=skip reason=no_wake_mechanism source={}",
                self.source.source_id()
            );
        }
        let subscription = Subscription::spawn(observer.clone(), wakes, self.options.periodic_wake);

        Ok(ActiveSession {
            observer,
            relay,
            subscription,
        })
    }

    fn fail(&self, err: AuthError) -> SessionError {
        error!(
            "event=session_start module=service status=error error_code={} error={}",
            err.code(),
            err
        );
        self.publish(SessionState::Failed, Some(err));
        SessionError::Auth(err)
    }

    fn publish(&self, state: SessionState, error: Option<AuthError>) {
        self.status.send_replace(SessionStatus::new(state, error));
    }
}
