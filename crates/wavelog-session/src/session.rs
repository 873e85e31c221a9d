//! Logging session state machine.

use std::sync::{
    Arc, Mutex, MutexGuard, Weak,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;
use wavelog_core::{
    BindEvent, ConnectionEvent, DataProvider, LoggerConfig, ProviderHandle, SampleStore,
    StreamBinding, StreamId, StreamType,
};
use wavelog_provider::ProviderConnection;

use crate::{
    ingest::{IngestPipeline, IngestStats},
    listener::StreamListener,
};

/// Identifies the listener a subscription registered.
pub type ListenerHandle = Uuid;

/// Session error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("A logging session is already active")]
    AlreadyActive,
    #[error("A logging session is already starting")]
    AlreadyStarting,
    #[error("The previous logging session is still stopping")]
    StopInProgress,
    #[error("None of the requested streams could be subscribed")]
    NoStreamsAvailable,
    #[error("No streams requested")]
    NoStreamsRequested,
    #[error("Failed to bind to provider: {0}")]
    BindFailed(String),
    #[error("Lost connection to provider")]
    LostConnection,
    #[error("Start cancelled by stop")]
    StartCancelled,
}

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Binding,
    Active,
    Stopping,
}

/// One stream the session is receiving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSubscription {
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub listener: ListenerHandle,
}

/// Outcome of a successful start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub active: Vec<StreamSubscription>,
    /// Requested streams that could not be subscribed.
    pub dropped: Vec<StreamId>,
}

/// Outcome of a stop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub unsubscribed: Vec<StreamId>,
    /// Streams whose unsubscribe request failed. The provider binding is
    /// released regardless.
    pub unsubscribe_failures: Vec<StreamId>,
    pub ingest: IngestStats,
}

type StartWaiter = oneshot::Sender<Result<StartReport, SessionError>>;

enum State {
    Idle,
    Binding {
        attempt: u64,
        requested: Vec<StreamId>,
        /// Taken by whoever resolves the pending start.
        waiter: Option<StartWaiter>,
        /// Set once the bind completes and subscribing begins.
        ingest: Option<IngestPipeline>,
        subscribed: Vec<StreamSubscription>,
    },
    Active {
        subscriptions: Vec<StreamSubscription>,
        ingest: IngestPipeline,
    },
    Stopping,
}

impl State {
    const fn status(&self) -> SessionStatus {
        match self {
            Self::Idle => SessionStatus::Idle,
            Self::Binding { .. } => SessionStatus::Binding,
            Self::Active { .. } => SessionStatus::Active,
            Self::Stopping => SessionStatus::Stopping,
        }
    }
}

/// Work left to do once the state lock is released.
enum Teardown {
    Nothing,
    AwaitOtherStop(watch::Receiver<SessionStatus>),
    CancelBind {
        waiter: Option<StartWaiter>,
        subscribed: Vec<StreamSubscription>,
        ingest: Option<IngestPipeline>,
    },
    Drain {
        subscriptions: Vec<StreamSubscription>,
        ingest: IngestPipeline,
    },
}

/// How a bind completion ended once subscriptions were attempted.
enum Outcome {
    Activated(Vec<StreamSubscription>),
    NoStreams(IngestPipeline),
    Cancelled,
}

/// A logging session.
///
/// Owns the provider connection, the active subscriptions and the ingest
/// pipeline. At most one session is active at a time; every transition goes
/// through a single state lock, and no lock is held across a provider call.
pub struct LoggingSession<S>
where
    S: SampleStore + 'static,
{
    api_key: String,
    registry: Vec<StreamBinding>,
    connection: ProviderConnection,
    store: Arc<S>,
    state: Mutex<State>,
    next_attempt: AtomicU64,
    status_tx: watch::Sender<SessionStatus>,
}

impl<S> LoggingSession<S>
where
    S: SampleStore + 'static,
{
    /// Create an idle session and start listening for provider
    /// notifications. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(config: &LoggerConfig, provider: Arc<dyn DataProvider>, store: Arc<S>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        let session = Arc::new(Self {
            api_key: config.api_key.clone(),
            registry: config.streams.clone(),
            connection: ProviderConnection::new(provider),
            store,
            state: Mutex::new(State::Idle),
            next_attempt: AtomicU64::new(1),
            status_tx,
        });
        Self::spawn_event_pump(&session);
        session
    }

    fn spawn_event_pump(session: &Arc<Self>) {
        let Some(mut events) = session.connection.take_events() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(session);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.handle_connection_event(event).await;
            }
            tracing::debug!("Provider event pump finished");
        });
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        let generation = event.generation;
        match self.connection.accept(event) {
            Some(BindEvent::Connected(handle)) => self.on_provider_connected(generation, handle).await,
            Some(BindEvent::Disconnected) => self.on_provider_disconnected().await,
            None => {}
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Replace the state and publish the new status. Call with the lock held.
    fn transition(&self, state: &mut State, next: State) {
        let status = next.status();
        *state = next;
        self.status_tx.send_replace(status);
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        matches!(&*self.state(), State::Binding { attempt: a, .. } if *a == attempt)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.state().status()
    }

    /// Stream of status changes, starting with the current status.
    #[must_use]
    pub fn status_stream(&self) -> WatchStream<SessionStatus> {
        WatchStream::new(self.status_tx.subscribe())
    }

    /// Whether the provider connection is bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.connection.is_bound()
    }

    /// Provider connection, for authorization queries while bound.
    #[must_use]
    pub const fn connection(&self) -> &ProviderConnection {
        &self.connection
    }

    /// Subscriptions of the active session, if any.
    #[must_use]
    pub fn active_streams(&self) -> Vec<StreamSubscription> {
        match &*self.state() {
            State::Active { subscriptions, .. } => subscriptions.clone(),
            _ => Vec::new(),
        }
    }

    /// Start logging `stream_ids`.
    ///
    /// Resolves once the provider has bound and every stream has been
    /// offered a subscription. Streams that cannot be subscribed are listed
    /// in [`StartReport::dropped`].
    ///
    /// # Errors
    /// - [`SessionError::AlreadyActive`], [`SessionError::AlreadyStarting`] or
    ///   [`SessionError::StopInProgress`] if the session is not idle; nothing
    ///   is changed
    /// - [`SessionError::NoStreamsRequested`] for an empty request
    /// - [`SessionError::BindFailed`] if the provider rejects the bind
    /// - [`SessionError::NoStreamsAvailable`] if no stream could be subscribed
    /// - [`SessionError::StartCancelled`] or [`SessionError::LostConnection`]
    ///   if a stop or provider loss ends the start
    pub async fn start<I, T>(&self, stream_ids: I) -> Result<StartReport, SessionError>
    where
        I: IntoIterator<Item = T>,
        T: Into<StreamId>,
    {
        let mut requested: Vec<StreamId> = Vec::new();
        for id in stream_ids {
            let id = id.into();
            if !requested.contains(&id) {
                requested.push(id);
            }
        }

        let (waiter, result) = oneshot::channel();
        let attempt = {
            let mut state = self.state();
            match &*state {
                State::Idle => {}
                State::Binding { .. } => return Err(SessionError::AlreadyStarting),
                State::Active { .. } => return Err(SessionError::AlreadyActive),
                State::Stopping => return Err(SessionError::StopInProgress),
            }
            if requested.is_empty() {
                return Err(SessionError::NoStreamsRequested);
            }
            let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
            self.transition(
                &mut state,
                State::Binding {
                    attempt,
                    requested,
                    waiter: Some(waiter),
                    ingest: None,
                    subscribed: Vec::new(),
                },
            );
            attempt
        };
        tracing::info!(attempt, "Starting logging session");

        if let Err(e) = self.connection.connect().await {
            let ours = {
                let mut state = self.state();
                let ours = matches!(&*state, State::Binding { attempt: a, .. } if *a == attempt);
                if ours {
                    self.transition(&mut state, State::Idle);
                }
                ours
            };
            if ours {
                return Err(SessionError::BindFailed(e.to_string()));
            }
        }

        result.await.unwrap_or(Err(SessionError::StartCancelled))
    }

    /// Handle completion of bind attempt `generation`: subscribe the
    /// requested streams.
    ///
    /// Driven by the provider event pump.
    pub async fn on_provider_connected(&self, generation: u64, handle: Arc<dyn ProviderHandle>) {
        if !self.connection.adopt(generation, handle) {
            tracing::debug!(generation, "Provider connected with no bind in flight");
            return;
        }

        let pending = {
            let mut state = self.state();
            match &mut *state {
                State::Binding {
                    attempt,
                    requested,
                    waiter,
                    ingest,
                    ..
                } => waiter.take().map(|w| {
                    let pipeline = IngestPipeline::spawn(Arc::clone(&self.store));
                    let sender = pipeline.sender();
                    *ingest = Some(pipeline);
                    (*attempt, requested.clone(), w, sender)
                }),
                _ => None,
            }
        };
        let Some((attempt, requested, waiter, sender)) = pending else {
            tracing::debug!("Provider connected but no start is waiting");
            return;
        };

        let mut dropped = Vec::new();
        for stream_id in requested {
            if !self.is_current_attempt(attempt) {
                break;
            }
            let Some(stream_type) = self.stream_type_of(&stream_id) else {
                tracing::warn!(%stream_id, "No table registered for stream");
                dropped.push(stream_id);
                continue;
            };
            let listener = Arc::new(StreamListener::new(stream_type, stream_id.clone(), sender.clone()));
            match self.connection.subscribe(&self.api_key, &stream_id, listener).await {
                Ok(true) => {
                    let subscription = StreamSubscription {
                        stream_id: stream_id.clone(),
                        stream_type,
                        listener: Uuid::new_v4(),
                    };
                    if !self.record_subscription(attempt, subscription) {
                        self.release_late_subscription(&stream_id).await;
                        break;
                    }
                    tracing::info!(%stream_id, %stream_type, "Subscribed to stream");
                }
                Ok(false) => {
                    tracing::warn!(%stream_id, "Provider refused stream subscription");
                    dropped.push(stream_id);
                }
                Err(e) => {
                    tracing::warn!(%stream_id, error = %e, "Error requesting data for stream");
                    dropped.push(stream_id);
                }
            }
        }

        let outcome = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, State::Stopping) {
                State::Binding {
                    attempt: a,
                    subscribed,
                    ingest: Some(ingest),
                    ..
                } if a == attempt => {
                    if subscribed.is_empty() {
                        self.status_tx.send_replace(SessionStatus::Stopping);
                        Outcome::NoStreams(ingest)
                    } else {
                        self.transition(
                            &mut state,
                            State::Active {
                                subscriptions: subscribed.clone(),
                                ingest,
                            },
                        );
                        Outcome::Activated(subscribed)
                    }
                }
                other => {
                    *state = other;
                    Outcome::Cancelled
                }
            }
        };

        match outcome {
            Outcome::Activated(active) => {
                tracing::info!(
                    active = active.len(),
                    dropped = dropped.len(),
                    "Logging session active"
                );
                let _ = waiter.send(Ok(StartReport { active, dropped }));
            }
            Outcome::NoStreams(ingest) => {
                ingest.shutdown().await;
                self.connection.disconnect().await;
                self.finish_stop();
                tracing::warn!(requested = dropped.len(), "No streams available, session not started");
                let _ = waiter.send(Err(SessionError::NoStreamsAvailable));
            }
            Outcome::Cancelled => {
                // Whoever cancelled owns the pipeline and the subscriptions
                // recorded so far.
                tracing::info!("Start cancelled during subscription");
                let _ = waiter.send(Err(SessionError::StartCancelled));
            }
        }
    }

    /// Add `subscription` to the pending start. Returns `false` if the start
    /// has been cancelled in the meantime.
    fn record_subscription(&self, attempt: u64, subscription: StreamSubscription) -> bool {
        let mut state = self.state();
        match &mut *state {
            State::Binding {
                attempt: a,
                subscribed,
                ..
            } if *a == attempt => {
                subscribed.push(subscription);
                true
            }
            _ => false,
        }
    }

    async fn release_late_subscription(&self, stream_id: &str) {
        tracing::info!(%stream_id, "Subscription completed after start was cancelled");
        if let Err(e) = self.connection.unsubscribe(&self.api_key, stream_id).await {
            tracing::debug!(%stream_id, error = %e, "Could not release late subscription");
        }
    }

    /// Handle provider loss: flush what was received and return to idle.
    ///
    /// Driven by the provider event pump.
    pub async fn on_provider_disconnected(&self) {
        self.connection.mark_lost();

        let teardown = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, State::Stopping) {
                idle @ State::Idle => {
                    *state = idle;
                    Teardown::Nothing
                }
                State::Stopping => Teardown::Nothing,
                State::Binding {
                    waiter,
                    subscribed,
                    ingest,
                    ..
                } => {
                    self.status_tx.send_replace(SessionStatus::Stopping);
                    Teardown::CancelBind {
                        waiter,
                        subscribed,
                        ingest,
                    }
                }
                State::Active {
                    subscriptions,
                    ingest,
                } => {
                    self.status_tx.send_replace(SessionStatus::Stopping);
                    Teardown::Drain {
                        subscriptions,
                        ingest,
                    }
                }
            }
        };

        match teardown {
            Teardown::Nothing | Teardown::AwaitOtherStop(_) => {}
            Teardown::CancelBind { waiter, ingest, .. } => {
                if let Some(ingest) = ingest {
                    ingest.shutdown().await;
                }
                self.connection.disconnect().await;
                self.finish_stop();
                tracing::warn!("Lost connection to provider while binding");
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(SessionError::LostConnection));
                }
            }
            Teardown::Drain {
                subscriptions,
                ingest,
            } => {
                let stats = ingest.shutdown().await;
                self.connection.disconnect().await;
                self.finish_stop();
                tracing::warn!(
                    streams = subscriptions.len(),
                    inserted = stats.inserted,
                    "Lost connection to provider, logging stopped"
                );
            }
        }
    }

    /// Stop logging.
    ///
    /// Idempotent: stopping an idle session does nothing, and a stop issued
    /// while another is in progress waits for that one to finish. A pending
    /// start is cancelled. Every subscription is released even if some
    /// unsubscribe requests fail, and samples already received are flushed
    /// to the store before this returns.
    pub async fn stop(&self) -> StopReport {
        let teardown = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, State::Stopping) {
                idle @ State::Idle => {
                    *state = idle;
                    Teardown::Nothing
                }
                State::Stopping => Teardown::AwaitOtherStop(self.status_tx.subscribe()),
                State::Binding {
                    waiter,
                    subscribed,
                    ingest,
                    ..
                } => {
                    self.status_tx.send_replace(SessionStatus::Stopping);
                    Teardown::CancelBind {
                        waiter,
                        subscribed,
                        ingest,
                    }
                }
                State::Active {
                    subscriptions,
                    ingest,
                } => {
                    self.status_tx.send_replace(SessionStatus::Stopping);
                    Teardown::Drain {
                        subscriptions,
                        ingest,
                    }
                }
            }
        };

        match teardown {
            Teardown::Nothing => StopReport::default(),
            Teardown::AwaitOtherStop(mut rx) => {
                // Stopping only ever leads to Idle.
                let _ = rx.changed().await;
                StopReport::default()
            }
            Teardown::CancelBind {
                waiter,
                subscribed,
                ingest,
            } => {
                // Streams subscribed before the stop are released and their
                // samples flushed like an active session's.
                let report = match ingest {
                    Some(ingest) => self.drain(subscribed, ingest).await,
                    None => {
                        self.connection.disconnect().await;
                        self.finish_stop();
                        StopReport::default()
                    }
                };
                tracing::info!("Pending start cancelled");
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(SessionError::StartCancelled));
                }
                report
            }
            Teardown::Drain {
                subscriptions,
                ingest,
            } => self.drain(subscriptions, ingest).await,
        }
    }

    async fn drain(&self, subscriptions: Vec<StreamSubscription>, ingest: IngestPipeline) -> StopReport {
        let mut report = StopReport::default();
        for subscription in subscriptions {
            let stream_id = subscription.stream_id;
            match self.connection.unsubscribe(&self.api_key, &stream_id).await {
                Ok(found) => {
                    if !found {
                        tracing::debug!(%stream_id, "Provider had no listener for stream");
                    }
                    report.unsubscribed.push(stream_id);
                }
                Err(e) => {
                    tracing::warn!(%stream_id, error = %e, "Failed to unsubscribe from stream");
                    report.unsubscribe_failures.push(stream_id);
                }
            }
        }

        report.ingest = ingest.shutdown().await;
        self.connection.disconnect().await;
        self.finish_stop();

        tracing::info!(
            unsubscribed = report.unsubscribed.len(),
            failures = report.unsubscribe_failures.len(),
            inserted = report.ingest.inserted,
            failed = report.ingest.failed,
            dropped = report.ingest.dropped,
            "Logging session stopped"
        );
        report
    }

    fn finish_stop(&self) {
        let mut state = self.state();
        self.transition(&mut state, State::Idle);
    }

    /// Stop logging and close the store. The session cannot log again
    /// afterwards.
    pub async fn teardown(&self) -> StopReport {
        let report = self.stop().await;
        self.store.close().await;
        tracing::info!("Sample store closed");
        report
    }

    fn stream_type_of(&self, stream_id: &str) -> Option<StreamType> {
        self.registry
            .iter()
            .find(|b| b.id == stream_id)
            .map(|b| b.stream_type)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::{StreamExt, TryStreamExt, stream::BoxStream};
    use tokio_test::{assert_err, assert_ok};
    use wavelog_core::{ProviderSample, Sample, StoreError, StoreRecord};
    use wavelog_provider::LoopbackProvider;
    use wavelog_store::MemoryStore;

    use super::*;

    fn accel_sample(sampled_at_ms: i64) -> ProviderSample {
        ProviderSample::new(sampled_at_ms)
            .with_value("x", 0.1)
            .with_value("y", 0.2)
            .with_value("z", 9.8)
    }

    fn session_with(provider: &LoopbackProvider) -> (Arc<LoggingSession<MemoryStore>>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let session = LoggingSession::new(
            &LoggerConfig::default(),
            Arc::new(provider.clone()),
            Arc::clone(&store),
        );
        (session, store)
    }

    async fn wait_for_status(session: &LoggingSession<MemoryStore>, status: SessionStatus) {
        let mut rx = session.status_tx.subscribe();
        let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
            .await
            .is_ok_and(|r| r.is_ok());
        assert!(reached, "Timed out waiting for {status:?}");
    }

    #[tokio::test]
    async fn test_start_log_stop() {
        let provider = LoopbackProvider::new().authorize("accel");
        let (session, store) = session_with(&provider);

        let report = assert_ok!(session.start(["accel"]).await);
        assert_eq!(report.active.len(), 1);
        assert_eq!(report.active[0].stream_type, StreamType::Accel);
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(session.is_bound());

        for i in 0..10 {
            assert!(provider.push("accel", accel_sample(i)));
        }

        let report = session.stop().await;
        assert_eq!(report.unsubscribed, vec!["accel".to_string()]);
        assert_eq!(report.ingest.inserted, 10);
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(!provider.is_bound());
        assert_eq!(provider.subscription_count(), 0);

        let records: Vec<StoreRecord> = store.scan_all(StreamType::Accel).try_collect().await.unwrap();
        let times: Vec<_> = records.iter().map(|r| r.sample.sampled_at_ms()).collect();
        assert_eq!(times, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_no_streams_available() {
        let provider = LoopbackProvider::new().authorize("accel").refuse("accel");
        let (session, store) = session_with(&provider);

        let err = assert_err!(session.start(["accel"]).await);
        assert_eq!(err, SessionError::NoStreamsAvailable);
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(!provider.is_bound());
        assert!(!provider.push("accel", accel_sample(1)));
        assert_eq!(store.count(StreamType::Accel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_partial_subscription() {
        let provider = LoopbackProvider::new().authorize("accel");
        let (session, _store) = session_with(&provider);

        let report = assert_ok!(session.start(["accel", "location", "gyro"]).await);
        assert_eq!(report.active.len(), 1);
        assert_eq!(report.dropped, vec!["location".to_string(), "gyro".to_string()]);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let provider = LoopbackProvider::new().authorize("accel").authorize("location");
        let (session, _store) = session_with(&provider);

        assert_ok!(session.start(["accel"]).await);
        let before = session.active_streams();

        let err = assert_err!(session.start(["location"]).await);
        assert_eq!(err, SessionError::AlreadyActive);
        assert_eq!(session.active_streams(), before);
        assert!(!provider.is_subscribed("location"));
        assert_eq!(provider.bind_count(), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_empty_request() {
        let (session, _store) = session_with(&LoopbackProvider::new());
        let err = assert_err!(session.start(Vec::<String>::new()).await);
        assert_eq!(err, SessionError::NoStreamsRequested);
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let provider = LoopbackProvider::new().fail_bind();
        let (session, _store) = session_with(&provider);
        let err = assert_err!(session.start(["accel"]).await);
        assert!(matches!(err, SessionError::BindFailed(_)));
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_start_while_binding_then_cancel() {
        let provider = LoopbackProvider::new().authorize("accel").manual_connect();
        let (session, _store) = session_with(&provider);

        let starter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start(["accel"]).await })
        };
        wait_for_status(&session, SessionStatus::Binding).await;

        let err = assert_err!(session.start(["accel"]).await);
        assert_eq!(err, SessionError::AlreadyStarting);

        let report = session.stop().await;
        assert_eq!(report, StopReport::default());
        assert_eq!(assert_err!(starter.await.unwrap()), SessionError::StartCancelled);
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(!provider.is_bound());
    }

    #[tokio::test]
    async fn test_late_connect_after_cancel_is_ignored() {
        let provider = LoopbackProvider::new().authorize("accel").manual_connect();
        let (session, _store) = session_with(&provider);

        let starter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start(["accel"]).await })
        };
        wait_for_status(&session, SessionStatus::Binding).await;
        let stale = provider.notifier().unwrap();
        session.stop().await;
        assert_err!(starter.await.unwrap());

        stale.connected(provider.handle());
        tokio::task::yield_now().await;
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(!session.is_bound());
        assert_eq!(provider.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let provider = LoopbackProvider::new().authorize("accel");
        let (session, _store) = session_with(&provider);

        assert_eq!(session.stop().await, StopReport::default());
        assert_ok!(session.start(["accel"]).await);
        let first = session.stop().await;
        let second = session.stop().await;
        assert_eq!(first.unsubscribed.len(), 1);
        assert_eq!(second, StopReport::default());
        assert_eq!(provider.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_start_during_stop() {
        let provider = LoopbackProvider::new().authorize("accel").gate_unsubscribe();
        let (session, _store) = session_with(&provider);
        assert_ok!(session.start(["accel"]).await);

        let stopper = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.stop().await })
        };
        wait_for_status(&session, SessionStatus::Stopping).await;

        let err = assert_err!(session.start(["accel"]).await);
        assert_eq!(err, SessionError::StopInProgress);

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.stop().await })
        };
        provider.release_unsubscribe();

        let report = stopper.await.unwrap();
        assert_eq!(report.unsubscribed, vec!["accel".to_string()]);
        assert_eq!(waiter.await.unwrap(), StopReport::default());
        assert_eq!(session.status(), SessionStatus::Idle);

        assert_ok!(session.start(["accel"]).await);
        assert_eq!(provider.bind_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stops_while_streaming() {
        let provider = LoopbackProvider::new().authorize("accel");
        let (session, store) = session_with(&provider);
        assert_ok!(session.start(["accel"]).await);

        let producer = {
            let provider = provider.clone();
            std::thread::spawn(move || {
                let mut pushed = 0_i64;
                while provider.push("accel", accel_sample(pushed)) {
                    pushed += 1;
                }
                pushed
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stops: Vec<_> = (0..4)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.stop().await })
            })
            .collect();
        let mut reports = Vec::new();
        for stop in stops {
            reports.push(stop.await.unwrap());
        }
        let pushed = producer.join().unwrap();

        let draining: Vec<_> = reports.iter().filter(|r| !r.unsubscribed.is_empty()).collect();
        assert_eq!(draining.len(), 1);
        let stats = draining[0].ingest;
        assert!(stats.inserted > 0);
        assert!(stats.received <= u64::try_from(pushed).unwrap());

        let records: Vec<StoreRecord> = store.scan_all(StreamType::Accel).try_collect().await.unwrap();
        assert_eq!(records.len() as u64, stats.inserted);
        let mut times: Vec<_> = records.iter().map(|r| r.sample.sampled_at_ms()).collect();
        times.sort_unstable();
        times.dedup();
        assert_eq!(times.len(), records.len());
    }

    #[tokio::test]
    async fn test_late_listener_calls_are_dropped() {
        let provider = LoopbackProvider::new().authorize("accel");
        let (session, store) = session_with(&provider);
        assert_ok!(session.start(["accel"]).await);
        let listener = provider.listener("accel").unwrap();

        session.stop().await;
        listener.receive(accel_sample(99));
        assert_eq!(store.count(StreamType::Accel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_while_subscribing_flushes_and_releases() {
        let provider = LoopbackProvider::new()
            .authorize("accel")
            .authorize("location")
            .gate_subscribe("location");
        let (session, store) = session_with(&provider);

        let starter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start(["accel", "location"]).await })
        };
        let subscribed = tokio::time::timeout(Duration::from_secs(5), async {
            while !provider.is_subscribed("accel") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(subscribed.is_ok(), "accel was never subscribed");
        assert!(provider.push("accel", accel_sample(1)));
        let listener = provider.listener("accel").unwrap();

        let report = session.stop().await;
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(report.unsubscribed, vec!["accel".to_string()]);
        assert_eq!(report.ingest.inserted, 1);
        assert_eq!(store.count(StreamType::Accel).await.unwrap(), 1);

        listener.receive(accel_sample(2));
        provider.release_subscribe();
        assert_eq!(assert_err!(starter.await.unwrap()), SessionError::StartCancelled);

        assert_eq!(store.count(StreamType::Accel).await.unwrap(), 1);
        assert_eq!(provider.subscription_count(), 0);
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_unsubscribe_failure_still_releases() {
        let provider = LoopbackProvider::new()
            .authorize("accel")
            .authorize("location")
            .fail_unsubscribe("accel");
        let (session, _store) = session_with(&provider);
        assert_ok!(session.start(["accel", "location"]).await);

        let report = session.stop().await;
        assert_eq!(report.unsubscribe_failures, vec!["accel".to_string()]);
        assert_eq!(report.unsubscribed, vec!["location".to_string()]);
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(!provider.is_bound());
    }

    #[tokio::test]
    async fn test_provider_loss_returns_to_idle() {
        let provider = LoopbackProvider::new().authorize("accel");
        let (session, store) = session_with(&provider);
        assert_ok!(session.start(["accel"]).await);
        for i in 0..5 {
            assert!(provider.push("accel", accel_sample(i)));
        }

        provider.drop_connection();
        wait_for_status(&session, SessionStatus::Idle).await;
        assert!(!session.is_bound());
        assert_eq!(store.count(StreamType::Accel).await.unwrap(), 5);

        // Can log again once the provider is back.
        assert_ok!(session.start(["accel"]).await);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_provider_loss_while_binding() {
        let provider = LoopbackProvider::new().authorize("accel").manual_connect();
        let (session, _store) = session_with(&provider);

        let starter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start(["accel"]).await })
        };
        wait_for_status(&session, SessionStatus::Binding).await;
        provider.drop_connection();

        assert_eq!(assert_err!(starter.await.unwrap()), SessionError::LostConnection);
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    struct RejectingStore;

    #[async_trait]
    impl SampleStore for RejectingStore {
        async fn insert(&self, _stream_type: StreamType, _sample: &Sample) -> bool {
            false
        }

        fn scan_all(&self, _stream_type: StreamType) -> BoxStream<'static, Result<StoreRecord, StoreError>> {
            futures::stream::empty().boxed()
        }

        async fn count(&self, _stream_type: StreamType) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn purge(&self) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_store_failures_keep_session_active() {
        let provider = LoopbackProvider::new().authorize("accel");
        let session = LoggingSession::new(
            &LoggerConfig::default(),
            Arc::new(provider.clone()),
            Arc::new(RejectingStore),
        );
        assert_ok!(session.start(["accel"]).await);
        assert!(provider.push("accel", accel_sample(1)));
        assert!(provider.push("accel", accel_sample(2)));
        assert_eq!(session.status(), SessionStatus::Active);

        let report = session.stop().await;
        assert_eq!(report.ingest.failed, 2);
        assert_eq!(report.ingest.inserted, 0);
    }

    #[tokio::test]
    async fn test_teardown_closes_store() {
        let provider = LoopbackProvider::new().authorize("accel");
        let (session, store) = session_with(&provider);
        assert_ok!(session.start(["accel"]).await);

        session.teardown().await;
        assert!(store.is_closed());
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_status_stream() {
        let provider = LoopbackProvider::new().authorize("accel");
        let (session, _store) = session_with(&provider);
        let mut statuses = session.status_stream();
        assert_eq!(statuses.next().await, Some(SessionStatus::Idle));

        assert_ok!(session.start(["accel"]).await);
        assert_eq!(statuses.next().await, Some(SessionStatus::Active));
    }
}
