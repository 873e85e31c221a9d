//! In-memory sample storage.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use wavelog_core::{Sample, SampleStore, StoreError, StoreRecord, StreamType};

use crate::DEFAULT_PAGE_SIZE;

#[derive(Default)]
struct Table {
    rows: Vec<StoreRecord>,
    last_id: i64,
}

/// In-memory storage implementation.
///
/// Useful for tests and dry runs.
/// Data is lost on restart.
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<StreamType, Table>>>,
    closed: Arc<AtomicBool>,
    page_size: usize,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE as usize)
    }

    /// Create a store whose scans read `page_size` rows per lock.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        let tables = StreamType::ALL
            .into_iter()
            .map(|t| (t, Table::default()))
            .collect();
        Self {
            tables: Arc::new(RwLock::new(tables)),
            closed: Arc::new(AtomicBool::new(false)),
            page_size: page_size.max(1),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
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

        let Ok(mut tables) = self.tables.write() else {
            tracing::warn!(%stream_type, "Sample table lock poisoned");
            return false;
        };
        let table = tables.entry(stream_type).or_default();
        table.last_id += 1;
        let row_id = table.last_id;
        table.rows.push(StoreRecord {
            row_id,
            sample: sample.clone(),
        });
        true
    }

    fn scan_all(&self, stream_type: StreamType) -> BoxStream<'static, Result<StoreRecord, StoreError>> {
        let tables = Arc::clone(&self.tables);
        let closed = Arc::clone(&self.closed);
        let page_size = self.page_size;

        // (last row id handed out, upper bound fixed on first poll, buffered page, finished)
        let state = (0_i64, None::<i64>, VecDeque::<StoreRecord>::new(), false);

        futures::stream::unfold(state, move |(mut after, mut upper, mut page, mut finished)| {
            let tables = Arc::clone(&tables);
            let closed = Arc::clone(&closed);
            async move {
                if page.is_empty() && !finished {
                    if closed.load(Ordering::Acquire) {
                        return Some((Err(StoreError::Closed), (after, upper, page, true)));
                    }
                    let Ok(guard) = tables.read() else {
                        let err = StoreError::Query("sample table lock poisoned".into());
                        return Some((Err(err), (after, upper, page, true)));
                    };
                    let rows = guard.get(&stream_type).map_or(&[][..], |t| t.rows.as_slice());
                    let bound = *upper.get_or_insert_with(|| rows.last().map_or(0, |r| r.row_id));

                    let start = rows.partition_point(|r| r.row_id <= after);
                    page.extend(
                        rows[start..]
                            .iter()
                            .take_while(|r| r.row_id <= bound)
                            .take(page_size)
                            .cloned(),
                    );
                    drop(guard);

                    if page.len() < page_size {
                        finished = true;
                    }
                    if let Some(last) = page.back() {
                        after = last.row_id;
                    }
                }

                let record = page.pop_front()?;
                Some((Ok(record), (after, upper, page, finished)))
            }
        })
        .boxed()
    }

    async fn count(&self, stream_type: StreamType) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let tables = self
            .tables
            .read()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(tables.get(&stream_type).map_or(0, |t| t.rows.len() as u64))
    }

    async fn purge(&self) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut tables = self
            .tables
            .write()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut deleted = 0;
        for table in tables.values_mut() {
            deleted += table.rows.len() as u64;
            table.rows.clear();
        }
        Ok(deleted)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use wavelog_core::{AccelReading, LocationReading, Reading};

    use super::*;

    fn accel(sampled_at_ms: i64) -> Sample {
        Sample::received_now(
            sampled_at_ms,
            Reading::Accel(AccelReading {
                x: 1.0,
                y: 2.0,
                z: 3.0,
            }),
        )
    }

    #[tokio::test]
    async fn test_scan_in_insertion_order() {
        let store = MemoryStore::with_page_size(2);
        for i in [5, 3, 9, 1, 7] {
            assert!(store.insert(StreamType::Accel, &accel(i)).await);
        }

        let records: Vec<_> = store.scan_all(StreamType::Accel).try_collect().await.unwrap();
        let times: Vec<_> = records.iter().map(|r| r.sample.sampled_at_ms()).collect();
        assert_eq!(times, vec![5, 3, 9, 1, 7]);
        assert_eq!(
            records.iter().map(|r| r.row_id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[tokio::test]
    async fn test_scan_ignores_rows_written_after_start() {
        let store = MemoryStore::with_page_size(1);
        assert!(store.insert(StreamType::Accel, &accel(1)).await);
        assert!(store.insert(StreamType::Accel, &accel(2)).await);

        let mut scan = store.scan_all(StreamType::Accel);
        assert!(scan.next().await.is_some());
        assert!(store.insert(StreamType::Accel, &accel(3)).await);
        assert_eq!(scan.count().await, 1);
    }

    #[tokio::test]
    async fn test_purge_then_ids_keep_increasing() {
        let store = MemoryStore::new();
        assert!(store.insert(StreamType::Accel, &accel(1)).await);
        let location = Sample::received_now(1, Reading::Location(LocationReading::new(1.0, 2.0, 3.0)));
        assert!(store.insert(StreamType::Location, &location).await);

        assert_eq!(store.purge().await.unwrap(), 2);
        assert_eq!(store.scan_all(StreamType::Accel).count().await, 0);

        assert!(store.insert(StreamType::Accel, &accel(2)).await);
        let records: Vec<_> = store.scan_all(StreamType::Accel).try_collect().await.unwrap();
        assert_eq!(records[0].row_id, 2);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_everything() {
        let store = MemoryStore::new();
        store.close().await;
        assert!(!store.insert(StreamType::Accel, &accel(1)).await);
        assert!(matches!(store.purge().await, Err(StoreError::Closed)));
        let first = store.scan_all(StreamType::Accel).next().await;
        assert!(matches!(first, Some(Err(StoreError::Closed))));
    }
}
