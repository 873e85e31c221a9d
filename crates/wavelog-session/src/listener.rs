//! Provider-facing listeners, one per subscribed stream.

use wavelog_core::{ProviderSample, Reading, Sample, SampleListener, StreamId, StreamType};

use crate::ingest::IngestSender;

/// Listener registered for one stream.
///
/// The variant fixes which table the stream's samples are routed to, so a
/// listener can never write into another stream type's table.
pub(crate) enum StreamListener {
    Accel(Route),
    Location(Route),
}

pub(crate) struct Route {
    stream_id: StreamId,
    ingest: IngestSender,
}

impl StreamListener {
    pub(crate) fn new(stream_type: StreamType, stream_id: StreamId, ingest: IngestSender) -> Self {
        let route = Route { stream_id, ingest };
        match stream_type {
            StreamType::Accel => Self::Accel(route),
            StreamType::Location => Self::Location(route),
        }
    }

    const fn parts(&self) -> (StreamType, &Route) {
        match self {
            Self::Accel(route) => (StreamType::Accel, route),
            Self::Location(route) => (StreamType::Location, route),
        }
    }
}

impl SampleListener for StreamListener {
    fn receive(&self, output: ProviderSample) {
        let (stream_type, route) = self.parts();
        match Reading::from_provider(stream_type, &output) {
            Ok(reading) => {
                route
                    .ingest
                    .send(Sample::received_now(output.sampled_at_ms, reading));
            }
            Err(e) => {
                route.ingest.record_dropped();
                tracing::warn!(stream_id = %route.stream_id, error = %e, "Dropping malformed sample");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::TryStreamExt;
    use wavelog_core::{LocationReading, SampleStore};
    use wavelog_store::MemoryStore;

    use super::*;
    use crate::ingest::IngestPipeline;

    #[tokio::test]
    async fn test_routes_by_variant() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::spawn(Arc::clone(&store));
        let listener = StreamListener::new(StreamType::Location, "gps".into(), pipeline.sender());

        listener.receive(
            ProviderSample::new(42)
                .with_value("latitude", 37.87)
                .with_value("longitude", -122.26)
                .with_value("altitude", 52.0),
        );
        // Accelerometer-shaped payload on a location stream.
        listener.receive(ProviderSample::new(43).with_value("x", 1.0));

        let stats = pipeline.shutdown().await;
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.dropped, 1);

        let records: Vec<_> = store
            .scan_all(StreamType::Location)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sample.sampled_at_ms(), 42);
        assert_eq!(
            records[0].sample.reading(),
            &Reading::Location(LocationReading::new(37.87, -122.26, 52.0))
        );
        assert_eq!(store.count(StreamType::Accel).await.unwrap(), 0);
    }
}
