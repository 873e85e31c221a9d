//! In-process provider for tests and demos.
//!
//! Behaves like a provider living in another process: bind completion and
//! loss are reported through the [`BindNotifier`], and samples are pushed to
//! registered listeners from whichever task calls [`LoopbackProvider::push`].

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::Notify;
use wavelog_core::{
    AuthorizationInfo, BindNotifier, DataProvider, ProviderError, ProviderHandle, ProviderSample,
    SampleListener,
};

const DEFAULT_AUTHORIZATION: AuthorizationInfo = AuthorizationInfo {
    max_rate_hz: 50.0,
    max_precision: 0.001,
};

#[derive(Default)]
struct State {
    authorized: HashMap<String, AuthorizationInfo>,
    refused: HashSet<String>,
    failing_unsubscribe: HashSet<String>,
    manual_connect: bool,
    fail_bind: bool,
    unsubscribe_gate: Option<Arc<Notify>>,
    subscribe_gate: Option<(String, Arc<Notify>)>,
    notifier: Option<BindNotifier>,
    connected: bool,
    listeners: HashMap<String, Arc<dyn SampleListener>>,
    bind_count: usize,
    unsubscribe_count: usize,
}

/// In-process [`DataProvider`].
///
/// Cloning shares the same provider; keep a clone to drive it from a test.
#[derive(Clone, Default)]
pub struct LoopbackProvider {
    state: Arc<Mutex<State>>,
}

impl LoopbackProvider {
    /// Provider that completes binds immediately and authorizes nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Authorize `stream_id` with default limits.
    #[must_use]
    pub fn authorize(self, stream_id: &str) -> Self {
        self.authorize_with(stream_id, DEFAULT_AUTHORIZATION)
    }

    /// Authorize `stream_id` with the given limits.
    #[must_use]
    pub fn authorize_with(self, stream_id: &str, info: AuthorizationInfo) -> Self {
        self.state().authorized.insert(stream_id.to_string(), info);
        self
    }

    /// Refuse subscriptions to `stream_id` even if authorized.
    #[must_use]
    pub fn refuse(self, stream_id: &str) -> Self {
        self.state().refused.insert(stream_id.to_string());
        self
    }

    /// Fail unsubscribe requests for `stream_id` with a remote error.
    #[must_use]
    pub fn fail_unsubscribe(self, stream_id: &str) -> Self {
        self.state().failing_unsubscribe.insert(stream_id.to_string());
        self
    }

    /// Park every unsubscribe request until [`LoopbackProvider::release_unsubscribe`].
    #[must_use]
    pub fn gate_unsubscribe(self) -> Self {
        self.state().unsubscribe_gate = Some(Arc::new(Notify::new()));
        self
    }

    /// Let one parked (or the next) unsubscribe request proceed.
    pub fn release_unsubscribe(&self) {
        if let Some(gate) = self.state().unsubscribe_gate.clone() {
            gate.notify_one();
        }
    }

    /// Park subscribe requests for `stream_id` until
    /// [`LoopbackProvider::release_subscribe`].
    #[must_use]
    pub fn gate_subscribe(self, stream_id: &str) -> Self {
        self.state().subscribe_gate = Some((stream_id.to_string(), Arc::new(Notify::new())));
        self
    }

    /// Let one parked (or the next) gated subscribe request proceed.
    pub fn release_subscribe(&self) {
        if let Some((_, gate)) = self.state().subscribe_gate.clone() {
            gate.notify_one();
        }
    }

    /// Leave binds pending until [`LoopbackProvider::complete_bind`].
    #[must_use]
    pub fn manual_connect(self) -> Self {
        self.state().manual_connect = true;
        self
    }

    /// Reject every bind request.
    #[must_use]
    pub fn fail_bind(self) -> Self {
        self.state().fail_bind = true;
        self
    }

    /// Remote handle for this provider.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn ProviderHandle> {
        Arc::new(self.clone())
    }

    /// Notifier of the current bind, if any.
    #[must_use]
    pub fn notifier(&self) -> Option<BindNotifier> {
        self.state().notifier.clone()
    }

    /// Report completion of a pending bind. Returns `false` if none is pending.
    pub fn complete_bind(&self) -> bool {
        let notifier = {
            let mut state = self.state();
            let Some(notifier) = state.notifier.clone() else {
                return false;
            };
            state.connected = true;
            notifier
        };
        notifier.connected(self.handle());
        true
    }

    /// Simulate the provider process dying.
    pub fn drop_connection(&self) {
        let notifier = {
            let mut state = self.state();
            state.connected = false;
            state.listeners.clear();
            state.notifier.clone()
        };
        if let Some(notifier) = notifier {
            notifier.disconnected();
        }
    }

    /// Deliver `sample` to the listener registered for `stream_id`.
    ///
    /// Returns `false` if nobody is listening.
    pub fn push(&self, stream_id: &str, sample: ProviderSample) -> bool {
        let listener = self.state().listeners.get(stream_id).cloned();
        match listener {
            Some(listener) => {
                listener.receive(sample);
                true
            }
            None => false,
        }
    }

    /// Listener currently registered for `stream_id`.
    #[must_use]
    pub fn listener(&self, stream_id: &str) -> Option<Arc<dyn SampleListener>> {
        self.state().listeners.get(stream_id).cloned()
    }

    #[must_use]
    pub fn is_subscribed(&self, stream_id: &str) -> bool {
        self.state().listeners.contains_key(stream_id)
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state().listeners.len()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.state().notifier.is_some()
    }

    #[must_use]
    pub fn bind_count(&self) -> usize {
        self.state().bind_count
    }

    #[must_use]
    pub fn unsubscribe_count(&self) -> usize {
        self.state().unsubscribe_count
    }

    fn ensure_connected(state: &State) -> Result<(), ProviderError> {
        if state.connected {
            Ok(())
        } else {
            Err(ProviderError::LostConnection)
        }
    }
}

#[async_trait]
impl DataProvider for LoopbackProvider {
    async fn bind(&self, notifier: BindNotifier) -> Result<(), ProviderError> {
        let auto_connect = {
            let mut state = self.state();
            if state.fail_bind {
                return Err(ProviderError::BindFailed("loopback provider refused bind".into()));
            }
            state.bind_count += 1;
            state.notifier = Some(notifier.clone());
            if !state.manual_connect {
                state.connected = true;
            }
            !state.manual_connect
        };
        if auto_connect {
            notifier.connected(self.handle());
        }
        Ok(())
    }

    async fn unbind(&self) {
        let mut state = self.state();
        state.notifier = None;
        state.connected = false;
        state.listeners.clear();
    }
}

#[async_trait]
impl ProviderHandle for LoopbackProvider {
    async fn is_authorized(&self, _api_key: &str, stream_id: &str) -> Result<bool, ProviderError> {
        let state = self.state();
        Self::ensure_connected(&state)?;
        Ok(state.authorized.contains_key(stream_id))
    }

    async fn authorization_info(
        &self,
        _api_key: &str,
        stream_id: &str,
    ) -> Result<Option<AuthorizationInfo>, ProviderError> {
        let state = self.state();
        Self::ensure_connected(&state)?;
        Ok(state.authorized.get(stream_id).copied())
    }

    async fn subscribe(
        &self,
        _api_key: &str,
        stream_id: &str,
        listener: Arc<dyn SampleListener>,
    ) -> Result<bool, ProviderError> {
        let gate = self
            .state()
            .subscribe_gate
            .clone()
            .filter(|(gated, _)| gated == stream_id);
        if let Some((_, gate)) = gate {
            gate.notified().await;
        }

        let mut state = self.state();
        Self::ensure_connected(&state)?;
        if state.refused.contains(stream_id) || !state.authorized.contains_key(stream_id) {
            return Ok(false);
        }
        state.listeners.insert(stream_id.to_string(), listener);
        Ok(true)
    }

    async fn unsubscribe(&self, _api_key: &str, stream_id: &str) -> Result<bool, ProviderError> {
        let gate = self.state().unsubscribe_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state();
        Self::ensure_connected(&state)?;
        state.unsubscribe_count += 1;
        if state.failing_unsubscribe.contains(stream_id) {
            return Err(ProviderError::Remote(format!("unsubscribe {stream_id} failed")));
        }
        Ok(state.listeners.remove(stream_id).is_some())
    }
}
