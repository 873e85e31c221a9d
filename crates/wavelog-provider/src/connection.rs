//! Bind/unbind lifecycle over an external data provider.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;
use wavelog_core::{
    AuthorizationInfo, BindEvent, BindNotifier, ConnectionEvent, DataProvider, ProviderError,
    ProviderHandle, SampleListener,
};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No bind requested, or the provider went away.
    Unbound,
    /// Bind requested; waiting for the provider to report completion.
    Binding,
    /// Provider handle available.
    Bound,
}

enum Slot {
    Unbound,
    Binding {
        generation: u64,
    },
    Bound {
        generation: u64,
        handle: Arc<dyn ProviderHandle>,
    },
}

impl Slot {
    const fn state(&self) -> ConnectionState {
        match self {
            Self::Unbound => ConnectionState::Unbound,
            Self::Binding { .. } => ConnectionState::Binding,
            Self::Bound { .. } => ConnectionState::Bound,
        }
    }

    const fn generation(&self) -> Option<u64> {
        match self {
            Self::Unbound => None,
            Self::Binding { generation } | Self::Bound { generation, .. } => Some(*generation),
        }
    }
}

/// Connection to one external provider.
///
/// Binding is asynchronous: [`ProviderConnection::connect`] only starts it,
/// and the provider reports completion as a [`ConnectionEvent`] on the
/// channel returned by [`ProviderConnection::take_events`]. Each bind attempt
/// gets a fresh generation so notifications from an abandoned attempt are
/// recognized and dropped.
pub struct ProviderConnection {
    provider: Arc<dyn DataProvider>,
    slot: Mutex<Slot>,
    next_generation: AtomicU64,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl ProviderConnection {
    /// Create an unbound connection.
    #[must_use]
    pub fn new(provider: Arc<dyn DataProvider>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            provider,
            slot: Mutex::new(Slot::Unbound),
            next_generation: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Take the receiver for bind notifications. Only the first call
    /// returns it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.slot().state()
    }

    /// Whether a provider handle is available.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.state() == ConnectionState::Bound
    }

    /// Start binding to the provider.
    ///
    /// A no-op returning `Ok` when already binding or bound.
    ///
    /// # Errors
    /// Returns [`ProviderError::BindFailed`] if the provider rejects the
    /// request outright; the connection stays unbound.
    pub async fn connect(&self) -> Result<(), ProviderError> {
        let generation = {
            let mut slot = self.slot();
            match *slot {
                Slot::Binding { .. } | Slot::Bound { .. } => {
                    tracing::debug!(state = ?slot.state(), "Connect ignored, bind already requested");
                    return Ok(());
                }
                Slot::Unbound => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    *slot = Slot::Binding { generation };
                    generation
                }
            }
        };

        let notifier = BindNotifier::new(generation, self.events_tx.clone());
        if let Err(e) = self.provider.bind(notifier).await {
            {
                let mut slot = self.slot();
                if slot.generation() == Some(generation) {
                    *slot = Slot::Unbound;
                }
            }
            tracing::warn!(generation, error = %e, "Could not bind to provider");
            return Err(match e {
                ProviderError::BindFailed(_) => e,
                other => ProviderError::BindFailed(other.to_string()),
            });
        }

        tracing::debug!(generation, "Bind requested");
        Ok(())
    }

    /// Check that `event` belongs to the current bind attempt.
    ///
    /// Returns the event to act on, or `None` if it is stale (the attempt
    /// it belongs to was abandoned, or the provider reconnected after the
    /// connection was already released).
    pub fn accept(&self, event: ConnectionEvent) -> Option<BindEvent> {
        let current = self.slot().generation();
        if current == Some(event.generation) {
            Some(event.event)
        } else {
            match event.event {
                BindEvent::Connected(_) => tracing::info!(
                    generation = event.generation,
                    "Ignoring provider reconnect for a released binding"
                ),
                BindEvent::Disconnected => tracing::debug!(
                    generation = event.generation,
                    "Ignoring stale disconnect notification"
                ),
            }
            None
        }
    }

    /// Record that bind attempt `generation` completed with `handle`.
    ///
    /// Returns `false` (and keeps the handle out) unless `generation` is
    /// still the current attempt.
    pub fn adopt(&self, generation: u64, handle: Arc<dyn ProviderHandle>) -> bool {
        let mut slot = self.slot();
        if slot.generation() != Some(generation) {
            tracing::debug!(generation, "Not adopting handle from a released binding");
            return false;
        }
        let replaced = matches!(*slot, Slot::Bound { .. });
        *slot = Slot::Bound { generation, handle };
        if replaced {
            tracing::info!(generation, "Provider handle replaced");
        } else {
            tracing::info!(generation, "Connected to provider");
        }
        true
    }

    /// Record that the provider went away. Returns `false` if already unbound.
    pub fn mark_lost(&self) -> bool {
        let mut slot = self.slot();
        let was_connected = !matches!(*slot, Slot::Unbound);
        *slot = Slot::Unbound;
        was_connected
    }

    /// Release the binding. Idempotent and safe when never connected.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.slot(), Slot::Unbound);
        self.provider.unbind().await;
        if let Some(generation) = previous.generation() {
            tracing::info!(generation, "Disconnected from provider");
        }
    }

    fn handle(&self) -> Result<Arc<dyn ProviderHandle>, ProviderError> {
        match &*self.slot() {
            Slot::Bound { handle, .. } => Ok(Arc::clone(handle)),
            Slot::Unbound | Slot::Binding { .. } => Err(ProviderError::LostConnection),
        }
    }

    /// Whether `api_key` may read `stream_id`.
    ///
    /// # Errors
    /// Returns [`ProviderError::LostConnection`] if not bound.
    pub async fn is_authorized(&self, api_key: &str, stream_id: &str) -> Result<bool, ProviderError> {
        self.handle()?.is_authorized(api_key, stream_id).await
    }

    /// Limits granted for `stream_id`, if authorized.
    ///
    /// # Errors
    /// Returns [`ProviderError::LostConnection`] if not bound.
    pub async fn authorization_info(
        &self,
        api_key: &str,
        stream_id: &str,
    ) -> Result<Option<AuthorizationInfo>, ProviderError> {
        self.handle()?.authorization_info(api_key, stream_id).await
    }

    /// Register `listener` for `stream_id`.
    ///
    /// # Errors
    /// Returns [`ProviderError::LostConnection`] if not bound.
    pub async fn subscribe(
        &self,
        api_key: &str,
        stream_id: &str,
        listener: Arc<dyn SampleListener>,
    ) -> Result<bool, ProviderError> {
        self.handle()?.subscribe(api_key, stream_id, listener).await
    }

    /// Remove the listener for `stream_id`.
    ///
    /// # Errors
    /// Returns [`ProviderError::LostConnection`] if not bound.
    pub async fn unsubscribe(&self, api_key: &str, stream_id: &str) -> Result<bool, ProviderError> {
        self.handle()?.unsubscribe(api_key, stream_id).await
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};
    use wavelog_core::ProviderSample;

    use super::*;
    use crate::loopback::LoopbackProvider;

    struct NullListener;

    impl SampleListener for NullListener {
        fn receive(&self, _sample: ProviderSample) {}
    }

    async fn bind(connection: &ProviderConnection, events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) {
        assert_ok!(connection.connect().await);
        let event = events.recv().await.unwrap();
        let generation = event.generation;
        let Some(BindEvent::Connected(handle)) = connection.accept(event) else {
            panic!("Expected connected event");
        };
        assert!(connection.adopt(generation, handle));
    }

    #[tokio::test]
    async fn test_connect_lifecycle() {
        let provider = LoopbackProvider::new().authorize("accel");
        let connection = ProviderConnection::new(Arc::new(provider.clone()));
        let mut events = connection.take_events().unwrap();
        assert!(connection.take_events().is_none());

        assert_eq!(connection.state(), ConnectionState::Unbound);
        bind(&connection, &mut events).await;
        assert!(connection.is_bound());

        assert!(assert_ok!(connection.is_authorized("key", "accel").await));
        assert!(!assert_ok!(connection.is_authorized("key", "location").await));

        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Unbound);
        assert!(!provider.is_bound());
    }

    #[tokio::test]
    async fn test_connect_while_bound_is_noop() {
        let provider = LoopbackProvider::new();
        let connection = ProviderConnection::new(Arc::new(provider.clone()));
        let mut events = connection.take_events().unwrap();
        bind(&connection, &mut events).await;

        assert_ok!(connection.connect().await);
        assert!(connection.is_bound());
        assert_eq!(provider.bind_count(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_calls_fail_while_unbound() {
        let connection = ProviderConnection::new(Arc::new(LoopbackProvider::new().manual_connect()));
        assert_eq!(
            connection.is_authorized("key", "accel").await,
            Err(ProviderError::LostConnection)
        );

        assert_ok!(connection.connect().await);
        assert_eq!(connection.state(), ConnectionState::Binding);
        assert_eq!(
            connection
                .subscribe("key", "accel", Arc::new(NullListener))
                .await,
            Err(ProviderError::LostConnection)
        );
        assert_eq!(
            connection.unsubscribe("key", "accel").await,
            Err(ProviderError::LostConnection)
        );
    }

    #[tokio::test]
    async fn test_bind_failure_stays_unbound() {
        let connection = ProviderConnection::new(Arc::new(LoopbackProvider::new().fail_bind()));
        let err = assert_err!(connection.connect().await);
        assert!(matches!(err, ProviderError::BindFailed(_)));
        assert_eq!(connection.state(), ConnectionState::Unbound);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let provider = LoopbackProvider::new();
        let connection = ProviderConnection::new(Arc::new(provider));
        connection.disconnect().await;
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Unbound);
    }

    #[tokio::test]
    async fn test_stale_connect_is_ignored() {
        let provider = LoopbackProvider::new().manual_connect();
        let connection = ProviderConnection::new(Arc::new(provider.clone()));
        let mut events = connection.take_events().unwrap();

        // First attempt abandoned before the provider answers.
        assert_ok!(connection.connect().await);
        let stale = provider.notifier().unwrap();
        connection.disconnect().await;

        assert_ok!(connection.connect().await);
        stale.connected(provider.handle());
        let event = events.recv().await.unwrap();
        assert!(connection.accept(event).is_none());
        assert_eq!(connection.state(), ConnectionState::Binding);

        assert!(provider.complete_bind());
        let event = events.recv().await.unwrap();
        assert!(matches!(connection.accept(event), Some(BindEvent::Connected(_))));
    }

    #[tokio::test]
    async fn test_provider_loss() {
        let provider = LoopbackProvider::new();
        let connection = ProviderConnection::new(Arc::new(provider.clone()));
        let mut events = connection.take_events().unwrap();
        bind(&connection, &mut events).await;

        provider.drop_connection();
        let event = events.recv().await.unwrap();
        assert!(matches!(connection.accept(event), Some(BindEvent::Disconnected)));
        assert!(connection.mark_lost());
        assert!(!connection.mark_lost());
        assert_eq!(
            connection.is_authorized("key", "accel").await,
            Err(ProviderError::LostConnection)
        );
    }

    #[tokio::test]
    async fn test_adopt_rejects_handle_from_replaced_bind() {
        let provider = LoopbackProvider::new().manual_connect();
        let connection = ProviderConnection::new(Arc::new(provider.clone()));
        let mut events = connection.take_events().unwrap();

        assert_ok!(connection.connect().await);
        assert!(provider.complete_bind());
        let event = events.recv().await.unwrap();
        let generation = event.generation;
        let Some(BindEvent::Connected(handle)) = connection.accept(event) else {
            panic!("Expected connected event");
        };

        // Released and rebound before the accepted handle is adopted.
        connection.disconnect().await;
        assert_ok!(connection.connect().await);

        assert!(!connection.adopt(generation, handle));
        assert_eq!(connection.state(), ConnectionState::Binding);
    }
}
