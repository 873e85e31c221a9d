//! Logging sessions for wavelog.
//!
//! Provides:
//! - [`LoggingSession`]: the Start/Stop state machine that binds to a
//!   provider, subscribes to streams and routes samples into a store
//! - The ingest pipeline that decouples provider callbacks from store writes

mod ingest;
mod listener;
mod session;

pub use ingest::IngestStats;
pub use session::{
    ListenerHandle, LoggingSession, SessionError, SessionStatus, StartReport, StopReport,
    StreamSubscription,
};
