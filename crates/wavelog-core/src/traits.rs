//! Capability traits for storage and the external data provider.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sample::{ProviderSample, Sample, StoreRecord, StreamType};

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Store is closed")]
    Closed,
    #[error("Storage query failed: {0}")]
    Query(String),
    #[error("Corrupt {stream_type} row {row_id}: {reason}")]
    Decode {
        stream_type: StreamType,
        row_id: i64,
        reason: String,
    },
}

/// Trait for sample storage backends.
///
/// Tables are append-only; rows leave only through [`SampleStore::purge`].
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Append one sample to the table for `stream_type`.
    ///
    /// Returns `false` on any storage-level failure (including a closed
    /// store or a sample of another stream type). Never panics or raises.
    async fn insert(&self, stream_type: StreamType, sample: &Sample) -> bool;

    /// Lazy scan of one table in row-id order.
    ///
    /// The sequence is bounded by the rows present when it is first polled,
    /// and each call starts a fresh scan.
    fn scan_all(&self, stream_type: StreamType) -> BoxStream<'static, Result<StoreRecord, StoreError>>;

    /// Number of rows currently stored for `stream_type`.
    async fn count(&self, stream_type: StreamType) -> Result<u64, StoreError>;

    /// Delete every row in every table, returning the number deleted.
    ///
    /// Each table is purged independently; a failing table is logged and
    /// skipped.
    async fn purge(&self) -> Result<u64, StoreError>;

    /// Release the underlying storage. Idempotent.
    async fn close(&self);

    /// Whether [`SampleStore::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// Provider error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Bind failed: {0}")]
    BindFailed(String),
    #[error("Lost connection to provider")]
    LostConnection,
    #[error("Provider error: {0}")]
    Remote(String),
}

/// Receives samples pushed by the provider for one subscribed stream.
pub trait SampleListener: Send + Sync {
    /// Called from the provider's delivery context, possibly concurrently
    /// with session control calls. Must not block.
    fn receive(&self, sample: ProviderSample);
}

/// Limits the provider granted for an authorized stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationInfo {
    pub max_rate_hz: f64,
    pub max_precision: f64,
}

/// Remote interface obtained once a bind completes.
#[async_trait]
pub trait ProviderHandle: Send + Sync {
    /// Whether `api_key` may read `stream_id`.
    async fn is_authorized(&self, api_key: &str, stream_id: &str) -> Result<bool, ProviderError>;

    /// Granted limits, if authorized.
    async fn authorization_info(
        &self,
        api_key: &str,
        stream_id: &str,
    ) -> Result<Option<AuthorizationInfo>, ProviderError>;

    /// Register `listener` for `stream_id`. `Ok(false)` means refused.
    async fn subscribe(
        &self,
        api_key: &str,
        stream_id: &str,
        listener: Arc<dyn SampleListener>,
    ) -> Result<bool, ProviderError>;

    /// Remove the listener for `stream_id`. `Ok(false)` means nothing was registered.
    async fn unsubscribe(&self, api_key: &str, stream_id: &str) -> Result<bool, ProviderError>;
}

/// Bind lifecycle notification.
#[derive(Clone)]
pub enum BindEvent {
    Connected(Arc<dyn ProviderHandle>),
    Disconnected,
}

impl std::fmt::Debug for BindEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(_) => f.write_str("Connected"),
            Self::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Bind notification tagged with the bind attempt it belongs to.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub generation: u64,
    pub event: BindEvent,
}

/// Handed to [`DataProvider::bind`]; the provider reports bind completion
/// and later loss through it.
#[derive(Debug, Clone)]
pub struct BindNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl BindNotifier {
    #[must_use]
    pub const fn new(generation: u64, tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self { generation, tx }
    }

    /// Bind attempt this notifier belongs to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the bind completed.
    pub fn connected(&self, handle: Arc<dyn ProviderHandle>) {
        self.send(BindEvent::Connected(handle));
    }

    /// Report that the provider went away.
    pub fn disconnected(&self) {
        self.send(BindEvent::Disconnected);
    }

    fn send(&self, event: BindEvent) {
        if self
            .tx
            .send(ConnectionEvent {
                generation: self.generation,
                event,
            })
            .is_err()
        {
            tracing::debug!(generation = self.generation, "Bind event after connection dropped");
        }
    }
}

/// Trait for the external data provider process.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Start binding. Completion is always reported through `notifier`,
    /// never by the return value.
    async fn bind(&self, notifier: BindNotifier) -> Result<(), ProviderError>;

    /// Release the binding. Safe to call when not bound.
    async fn unbind(&self);
}
