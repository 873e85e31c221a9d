//! Export destinations.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, BufWriter};

use crate::coordinator::ExportError;

/// Writer for one export unit. Callers flush and shut it down when done.
pub type UnitWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bundles to try after the requested id is taken.
const MAX_SUFFIX: u32 = 100;

/// Somewhere bundles can be created.
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Create a new, empty bundle. The sink may adjust `bundle_id` to keep
    /// it unique; [`ExportBundle::id`] reports the final value.
    ///
    /// # Errors
    /// Returns [`ExportError::SinkUnavailable`] if no bundle can be created.
    async fn create_bundle(&self, bundle_id: &str) -> Result<Box<dyn ExportBundle>, ExportError>;
}

/// One bundle being written.
#[async_trait]
pub trait ExportBundle: Send + Sync {
    /// Final bundle id.
    fn id(&self) -> &str;

    /// Human-readable location, for reporting.
    fn location(&self) -> String;

    /// Open a new unit named `name` inside the bundle.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    async fn create_unit(&self, name: &str) -> std::io::Result<UnitWriter>;
}

/// Sink writing each bundle to a fresh directory under `root`.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ExportSink for DirectorySink {
    async fn create_bundle(&self, bundle_id: &str) -> Result<Box<dyn ExportBundle>, ExportError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            ExportError::SinkUnavailable(format!("{}: {e}", self.root.display()))
        })?;

        for suffix in 0..MAX_SUFFIX {
            let id = if suffix == 0 {
                bundle_id.to_string()
            } else {
                format!("{bundle_id}-{suffix}")
            };
            let path = self.root.join(&id);
            match tokio::fs::create_dir(&path).await {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Created export bundle directory");
                    return Ok(Box::new(DirectoryBundle { id, path }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(ExportError::SinkUnavailable(format!("{}: {e}", path.display())));
                }
            }
        }
        Err(ExportError::SinkUnavailable(format!(
            "too many bundles named {bundle_id} in {}",
            self.root.display()
        )))
    }
}

struct DirectoryBundle {
    id: String,
    path: PathBuf,
}

#[async_trait]
impl ExportBundle for DirectoryBundle {
    fn id(&self) -> &str {
        &self.id
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn create_unit(&self, name: &str) -> std::io::Result<UnitWriter> {
        let file = tokio::fs::File::create(self.path.join(name)).await?;
        Ok(Box::new(BufWriter::new(file)))
    }
}
