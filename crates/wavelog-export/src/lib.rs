//! Export bundles for wavelog.
//!
//! Provides:
//! - [`ExportCoordinator`]: snapshots every stream type's table into a bundle
//! - [`ExportSink`] / [`ExportBundle`]: where bundles are written
//! - [`DirectorySink`]: one directory per bundle on the local filesystem
//!
//! A bundle holds one CSV unit per stream type plus a `manifest.json`.

mod coordinator;
mod csv;
mod sink;

pub use coordinator::{
    BundleManifest, ExportCoordinator, ExportError, ExportResult, MANIFEST_NAME, UnitManifest,
};
pub use csv::{header_line, row_line, unit_name};
pub use sink::{DirectorySink, ExportBundle, ExportSink, UnitWriter};
