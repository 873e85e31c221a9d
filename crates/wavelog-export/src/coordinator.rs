//! Bundle export of a sample store.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Local};
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use wavelog_core::{SampleStore, StoreError, StreamType};

use crate::{
    csv::{header_line, row_line, unit_name},
    sink::{ExportBundle, ExportSink},
};

/// Name of the manifest unit in every bundle.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Export error.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Export sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("Export {bundle_id} incomplete, failed units: {failed:?}")]
    PartialExportFailure {
        bundle_id: String,
        failed: Vec<StreamType>,
    },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Outcome of one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportResult {
    pub bundle_id: String,
    /// Where the bundle was written.
    pub location: String,
    pub succeeded: Vec<StreamType>,
    pub failed: Vec<StreamType>,
    /// Rows written per successful unit.
    pub rows: BTreeMap<StreamType, u64>,
    /// Set if the manifest could not be written.
    pub manifest_error: Option<String>,
}

impl ExportResult {
    /// Whether every unit and the manifest were written.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.manifest_error.is_none()
    }

    /// Convert to an error if anything failed.
    ///
    /// # Errors
    /// Returns [`ExportError::PartialExportFailure`] naming the failed units.
    pub fn into_result(self) -> Result<Self, ExportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ExportError::PartialExportFailure {
                bundle_id: self.bundle_id,
                failed: self.failed,
            })
        }
    }

    /// Total rows exported.
    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.rows.values().sum()
    }
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, Serialize)]
pub struct BundleManifest {
    pub bundle_id: String,
    pub created_at: DateTime<Local>,
    pub units: Vec<UnitManifest>,
}

/// One unit's entry in the manifest.
#[derive(Debug, Clone, Serialize)]
pub struct UnitManifest {
    pub stream_type: StreamType,
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Exports a store's contents without taking it offline.
///
/// Each unit reads its table through [`SampleStore::scan_all`], so rows
/// inserted while the export runs are left for the next export.
pub struct ExportCoordinator<S>
where
    S: SampleStore + ?Sized,
{
    store: Arc<S>,
}

impl<S> ExportCoordinator<S>
where
    S: SampleStore + ?Sized,
{
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Write a new bundle to `sink`.
    ///
    /// A unit that fails is recorded in [`ExportResult::failed`] and the
    /// remaining units are still attempted.
    ///
    /// # Errors
    /// Returns [`ExportError::SinkUnavailable`] if the bundle cannot be
    /// created. Unit failures are reported in the result, not as errors.
    pub async fn export(&self, sink: &dyn ExportSink) -> Result<ExportResult, ExportError> {
        let created_at = Local::now();
        let bundle = sink.create_bundle(&bundle_id(created_at)).await?;
        let bundle_id = bundle.id().to_string();
        tracing::info!(%bundle_id, location = %bundle.location(), "Exporting sample store");

        let mut result = ExportResult {
            bundle_id: bundle_id.clone(),
            location: bundle.location(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            rows: BTreeMap::new(),
            manifest_error: None,
        };
        let mut units = Vec::with_capacity(StreamType::ALL.len());

        for stream_type in StreamType::ALL {
            let file = unit_name(stream_type);
            match self.export_unit(bundle.as_ref(), stream_type, &file).await {
                Ok(rows) => {
                    tracing::info!(%stream_type, rows, "Exported stream");
                    result.succeeded.push(stream_type);
                    result.rows.insert(stream_type, rows);
                    units.push(UnitManifest {
                        stream_type,
                        file,
                        rows: Some(rows),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(%stream_type, error = %e, "Failed to export stream");
                    result.failed.push(stream_type);
                    units.push(UnitManifest {
                        stream_type,
                        file,
                        rows: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let manifest = BundleManifest {
            bundle_id,
            created_at,
            units,
        };
        if let Err(e) = write_manifest(bundle.as_ref(), &manifest).await {
            tracing::warn!(error = %e, "Failed to write export manifest");
            result.manifest_error = Some(e.to_string());
        }

        if result.is_success() {
            tracing::info!(bundle_id = %result.bundle_id, rows = result.total_rows(), "Export complete");
        }
        Ok(result)
    }

    async fn export_unit(
        &self,
        bundle: &dyn ExportBundle,
        stream_type: StreamType,
        file: &str,
    ) -> Result<u64, ExportError> {
        let mut writer = bundle.create_unit(file).await?;
        writer.write_all(header_line(stream_type).as_bytes()).await?;

        let mut records = self.store.scan_all(stream_type);
        let mut rows = 0;
        while let Some(record) = records.next().await {
            let record = record?;
            writer.write_all(row_line(&record.sample).as_bytes()).await?;
            rows += 1;
        }

        writer.flush().await?;
        writer.shutdown().await?;
        Ok(rows)
    }
}

async fn write_manifest(bundle: &dyn ExportBundle, manifest: &BundleManifest) -> Result<(), ExportError> {
    let json = serde_json::to_vec_pretty(manifest)?;
    let mut writer = bundle.create_unit(MANIFEST_NAME).await?;
    writer.write_all(&json).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Sortable local date-time token, down to milliseconds.
fn bundle_id(at: DateTime<Local>) -> String {
    format!("wavelog-{}", at.format("%Y-%m-%d_%H-%M-%S-%3f"))
}
