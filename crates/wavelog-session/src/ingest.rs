//! Background writer between provider callbacks and the store.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use wavelog_core::{Sample, SampleStore};

/// Sample counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Samples handed over by listeners, including dropped ones.
    pub received: u64,
    /// Samples the store accepted.
    pub inserted: u64,
    /// Samples the store rejected.
    pub failed: u64,
    /// Samples discarded before reaching the store.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    inserted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Acquire),
            inserted: self.inserted.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
        }
    }
}

/// Cloneable producer side, handed to every stream listener.
#[derive(Clone)]
pub(crate) struct IngestSender {
    tx: mpsc::UnboundedSender<Sample>,
    counters: Arc<Counters>,
}

impl IngestSender {
    /// Queue `sample` for insertion. Returns `false` once the pipeline has
    /// been shut down; the sample is counted as dropped.
    pub(crate) fn send(&self, sample: Sample) -> bool {
        self.counters.received.fetch_add(1, Ordering::AcqRel);
        let stream_type = sample.stream_type();
        if self.tx.send(sample).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(%stream_type, "Dropping sample delivered after stop");
            return false;
        }
        true
    }

    /// Count a sample that never made it into the queue.
    pub(crate) fn record_dropped(&self) {
        self.counters.received.fetch_add(1, Ordering::AcqRel);
        self.counters.dropped.fetch_add(1, Ordering::AcqRel);
    }
}

/// Queue plus the task draining it into a [`SampleStore`].
///
/// Listeners run on provider threads and must not block, so they only push
/// onto an unbounded channel; the writer task performs the inserts in
/// arrival order.
pub(crate) struct IngestPipeline {
    sender: IngestSender,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl IngestPipeline {
    /// Spawn the writer task. Must be called within a Tokio runtime.
    pub(crate) fn spawn<S>(store: Arc<S>) -> Self
    where
        S: SampleStore + ?Sized + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Sample>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let counters = Arc::new(Counters::default());
        let task_counters = Arc::clone(&counters);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    Some(sample) = rx.recv() => write(store.as_ref(), &task_counters, sample).await,
                    _ = &mut shutdown_rx => break,
                }
            }

            // Refuse new samples, then flush whatever is already queued.
            rx.close();
            while let Some(sample) = rx.recv().await {
                write(store.as_ref(), &task_counters, sample).await;
            }
        });

        Self {
            sender: IngestSender { tx, counters },
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    pub(crate) fn sender(&self) -> IngestSender {
        self.sender.clone()
    }

    /// Stop accepting samples, flush the queue and return the final counters.
    pub(crate) async fn shutdown(mut self) -> IngestStats {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "Ingest task ended abnormally");
        }
        self.sender.counters.snapshot()
    }
}

async fn write<S>(store: &S, counters: &Counters, sample: Sample)
where
    S: SampleStore + ?Sized,
{
    let stream_type = sample.stream_type();
    if store.insert(stream_type, &sample).await {
        counters.inserted.fetch_add(1, Ordering::AcqRel);
    } else {
        counters.failed.fetch_add(1, Ordering::AcqRel);
        tracing::warn!(
            %stream_type,
            sampled_at_ms = sample.sampled_at_ms(),
            "Sample was not persisted"
        );
    }
}
