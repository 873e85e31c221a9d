//! Sample storage backends.
//!
//! Provides:
//! - `SqliteStore` - Durable, versioned store (feature: sqlite)
//! - `MemoryStore` - In-process store for tests and dry runs (feature: memory)

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Default number of rows read per scan page.
pub const DEFAULT_PAGE_SIZE: u32 = 256;
