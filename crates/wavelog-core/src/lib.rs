//! Core abstractions for the wavelog sample logger.
//!
//! This crate provides the fundamental building blocks:
//! - `Sample` / `StoreRecord` - Typed samples and their persisted form
//! - `SampleStore` - Storage backend trait
//! - `DataProvider` / `ProviderHandle` - External provider capabilities
//! - `LoggerConfig` - TOML configuration

pub mod config;
pub mod sample;
pub mod traits;

pub use config::{LoggerConfig, StreamBinding};
pub use sample::{
    AccelReading, LocationReading, ProviderSample, Reading, Sample, SampleError, StoreRecord,
    StreamId, StreamType,
};
pub use traits::{
    AuthorizationInfo, BindEvent, BindNotifier, ConnectionEvent, DataProvider, ProviderError,
    ProviderHandle, SampleListener, SampleStore, StoreError,
};
