//! Provider binding lifecycle for wavelog.
//!
//! Provides:
//! - `ProviderConnection` - Bind/unbind state machine over a `DataProvider`
//! - Authorization checks for registered streams
//! - `LoopbackProvider` - In-process provider (feature: loopback)

pub mod authorization;
pub mod connection;

#[cfg(any(test, feature = "loopback"))]
pub mod loopback;

pub use authorization::{StreamAuthorization, authorized_streams, check_authorizations};
pub use connection::{ConnectionState, ProviderConnection};

#[cfg(any(test, feature = "loopback"))]
pub use loopback::LoopbackProvider;
