//! SQLite sample storage (feature-gated).

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use tokio::sync::Mutex;
use wavelog_core::{
    Sample, SampleStore, StoreError, StoreRecord, StreamType, config::StoreConfig,
};

use crate::{DEFAULT_PAGE_SIZE, schema};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite storage implementation.
///
/// Runs in WAL mode so scans read a consistent snapshot per page while
/// inserts proceed. Writers are serialized through `write_lock`.
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    closed: Arc<AtomicBool>,
    page_size: u32,
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn query_failed(e: impl std::fmt::Display) -> StoreError {
    StoreError::Query(e.to_string())
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// If the stored schema version differs from `schema_version`, every
    /// table is dropped and recreated. Logged data does not survive a
    /// schema change.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] if the database cannot be opened
    /// or initialized.
    pub async fn open(path: impl AsRef<Path>, schema_version: u32) -> Result<Self, StoreError> {
        Self::open_with_page_size(path, schema_version, DEFAULT_PAGE_SIZE).await
    }

    /// Open using the `[store]` config section.
    ///
    /// # Errors
    /// See [`SqliteStore::open`].
    pub async fn open_with_config(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_page_size(&config.path, config.schema_version, config.scan_page_size).await
    }

    /// Open with an explicit scan page size.
    ///
    /// # Errors
    /// See [`SqliteStore::open`].
    pub async fn open_with_page_size(
        path: impl AsRef<Path>,
        schema_version: u32,
        page_size: u32,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(unavailable)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(unavailable)?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
            closed: Arc::new(AtomicBool::new(false)),
            page_size: page_size.max(1),
        };
        store.prepare_schema(schema_version).await?;

        tracing::info!(path = %path.display(), schema_version, "Opened sample store");
        Ok(store)
    }

    /// Schema version recorded in the database header.
    ///
    /// # Errors
    /// Returns error if the store is closed or the pragma cannot be read.
    pub async fn schema_version(&self) -> Result<u32, StoreError> {
        self.ensure_open()?;
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed)?;
        u32::try_from(version).map_err(query_failed)
    }

    async fn prepare_schema(&self, expected: u32) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let stored: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *tx)
            .await
            .map_err(unavailable)?;

        if stored != 0 && stored != i64::from(expected) {
            tracing::warn!(
                from = stored,
                to = expected,
                "Upgrading sample store schema, which will destroy all old data"
            );
            for stream_type in StreamType::ALL {
                sqlx::query(&schema::drop_table_sql(stream_type))
                    .execute(&mut *tx)
                    .await
                    .map_err(unavailable)?;
            }
        }

        for stream_type in StreamType::ALL {
            sqlx::query(&schema::create_table_sql(stream_type))
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }

        // PRAGMA arguments cannot be bound.
        sqlx::query(&format!("PRAGMA user_version = {expected}"))
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SampleStore for SqliteStore {
    async fn insert(&self, stream_type: StreamType, sample: &Sample) -> bool {
        if sample.stream_type() != stream_type {
            tracing::warn!(
                %stream_type,
                sample_type = %sample.stream_type(),
                "Refusing to store sample in another stream's table"
            );
            return false;
        }
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(%stream_type, "Insert into closed store");
            return false;
        }

        let sql = schema::insert_sql(stream_type);
        let mut query = sqlx::query(&sql)
            .bind(sample.received_at().timestamp_micros())
            .bind(sample.sampled_at_ms());
        for value in sample.reading().values() {
            query = query.bind(value);
        }

        let _guard = self.write_lock.lock().await;
        match query.execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%stream_type, error = %e, "Failed to store sample");
                false
            }
        }
    }

    fn scan_all(&self, stream_type: StreamType) -> BoxStream<'static, Result<StoreRecord, StoreError>> {
        let state = ScanState {
            pool: self.pool.clone(),
            closed: Arc::clone(&self.closed),
            stream_type,
            page_size: self.page_size,
            after: 0,
            upper: None,
            page: VecDeque::new(),
            failed: None,
            finished: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            match state.next_record().await {
                Ok(Some(record)) => Some((Ok(record), state)),
                Ok(None) => None,
                Err(e) => {
                    state.finished = true;
                    state.page.clear();
                    Some((Err(e), state))
                }
            }
        })
        .boxed()
    }

    async fn count(&self, stream_type: StreamType) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let count: i64 = sqlx::query_scalar(&schema::count_sql(stream_type))
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed)?;
        u64::try_from(count).map_err(query_failed)
    }

    async fn purge(&self) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;

        let mut deleted = 0;
        for stream_type in StreamType::ALL {
            match sqlx::query(&schema::delete_all_sql(stream_type))
                .execute(&self.pool)
                .await
            {
                Ok(result) => {
                    tracing::debug!(%stream_type, rows = result.rows_affected(), "Purged table");
                    deleted += result.rows_affected();
                }
                Err(e) => {
                    tracing::warn!(%stream_type, error = %e, "Failed to purge table");
                }
            }
        }

        tracing::info!(rows = deleted, "Purged sample store");
        Ok(deleted)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wait for an in-flight insert before closing the pool.
        let _guard = self.write_lock.lock().await;
        self.pool.close().await;
        tracing::info!("Closed sample store");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Cursor for a paged scan over one table.
struct ScanState {
    pool: SqlitePool,
    closed: Arc<AtomicBool>,
    stream_type: StreamType,
    page_size: u32,
    /// Last row id handed out.
    after: i64,
    /// Highest row id at the time the scan started.
    upper: Option<i64>,
    page: VecDeque<StoreRecord>,
    /// Decode failure to report once the rows before it are handed out.
    failed: Option<StoreError>,
    finished: bool,
}

impl ScanState {
    async fn next_record(&mut self) -> Result<Option<StoreRecord>, StoreError> {
        if let Some(record) = self.page.pop_front() {
            return Ok(Some(record));
        }
        if let Some(e) = self.failed.take() {
            return Err(e);
        }
        if self.finished {
            return Ok(None);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        let upper = match self.upper {
            Some(upper) => upper,
            None => {
                let max: Option<i64> = sqlx::query_scalar(&schema::max_id_sql(self.stream_type))
                    .fetch_one(&self.pool)
                    .await
                    .map_err(query_failed)?;
                let upper = max.unwrap_or(0);
                self.upper = Some(upper);
                upper
            }
        };

        let rows = sqlx::query(&schema::select_page_sql(self.stream_type))
            .bind(self.after)
            .bind(upper)
            .bind(i64::from(self.page_size))
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)?;

        if rows.len() < self.page_size as usize {
            self.finished = true;
        }
        for row in &rows {
            match decode_row(self.stream_type, row) {
                Ok(record) => {
                    self.after = record.row_id;
                    self.page.push_back(record);
                }
                Err(e) => {
                    self.failed = Some(e);
                    self.finished = true;
                    break;
                }
            }
        }

        match self.page.pop_front() {
            Some(record) => Ok(Some(record)),
            None => self.failed.take().map_or(Ok(None), Err),
        }
    }
}

fn decode_row(stream_type: StreamType, row: &SqliteRow) -> Result<StoreRecord, StoreError> {
    let row_id: i64 = row.try_get(0).map_err(query_failed)?;
    let decode_err = |reason: String| StoreError::Decode {
        stream_type,
        row_id,
        reason,
    };

    let rcvd_time: i64 = row.try_get(1).map_err(|e| decode_err(e.to_string()))?;
    let sample_time: i64 = row.try_get(2).map_err(|e| decode_err(e.to_string()))?;
    let values = (0..stream_type.field_names().len())
        .map(|i| row.try_get::<Option<f64>, _>(3 + i))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| decode_err(e.to_string()))?;

    let sample = schema::decode_sample(stream_type, rcvd_time, sample_time, &values).map_err(decode_err)?;
    Ok(StoreRecord { row_id, sample })
}
