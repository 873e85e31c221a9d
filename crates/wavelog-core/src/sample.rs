//! Timestamped samples and their persisted form.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider-assigned stream identifier.
pub type StreamId = String;

/// Kind of stream a sample belongs to. Selects the table it is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    /// Three-axis accelerometer.
    Accel,
    /// Geographic position fix.
    Location,
}

impl StreamType {
    /// Every known stream type, in export order.
    pub const ALL: [Self; 2] = [Self::Accel, Self::Location];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accel => "accel",
            Self::Location => "location",
        }
    }

    /// Value field names, in column order.
    #[must_use]
    pub const fn field_names(self) -> &'static [&'static str] {
        match self {
            Self::Accel => &["x", "y", "z"],
            Self::Location => &[
                "latitude",
                "longitude",
                "altitude",
                "accuracy",
                "bearing",
                "speed",
            ],
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = SampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accel" | "accelerometer" => Ok(Self::Accel),
            "location" | "loc" => Ok(Self::Location),
            other => Err(SampleError::UnknownStreamType(other.to_string())),
        }
    }
}

/// Sample construction error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SampleError {
    #[error("Unknown stream type: {0}")]
    UnknownStreamType(String),
    #[error("{stream_type} sample is missing field '{field}'")]
    MissingField {
        stream_type: StreamType,
        field: &'static str,
    },
}

/// Accelerometer reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelReading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Location reading. Only the position is mandatory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationReading {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: Option<f64>,
    pub bearing: Option<f64>,
    pub speed: Option<f64>,
}

impl LocationReading {
    /// Position-only reading.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
            accuracy: None,
            bearing: None,
            speed: None,
        }
    }
}

/// Typed payload of a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Accel(AccelReading),
    Location(LocationReading),
}

impl Reading {
    /// Stream type implied by the variant.
    #[must_use]
    pub const fn stream_type(&self) -> StreamType {
        match self {
            Self::Accel(_) => StreamType::Accel,
            Self::Location(_) => StreamType::Location,
        }
    }

    /// Field values in [`StreamType::field_names`] order.
    #[must_use]
    pub fn values(&self) -> Vec<Option<f64>> {
        match self {
            Self::Accel(a) => vec![Some(a.x), Some(a.y), Some(a.z)],
            Self::Location(l) => vec![
                Some(l.latitude),
                Some(l.longitude),
                Some(l.altitude),
                l.accuracy,
                l.bearing,
                l.speed,
            ],
        }
    }

    /// Convert a raw provider payload into a typed reading.
    ///
    /// # Errors
    /// Returns [`SampleError::MissingField`] if a mandatory field is absent.
    pub fn from_provider(
        stream_type: StreamType,
        output: &ProviderSample,
    ) -> Result<Self, SampleError> {
        let required = |field: &'static str| {
            output
                .value(field)
                .ok_or(SampleError::MissingField { stream_type, field })
        };

        match stream_type {
            StreamType::Accel => Ok(Self::Accel(AccelReading {
                x: required("x")?,
                y: required("y")?,
                z: required("z")?,
            })),
            StreamType::Location => Ok(Self::Location(LocationReading {
                latitude: required("latitude")?,
                longitude: required("longitude")?,
                altitude: required("altitude")?,
                accuracy: output.value("accuracy"),
                bearing: output.value("bearing"),
                speed: output.value("speed"),
            })),
        }
    }
}

/// One timestamped sample.
///
/// `received_at` is host wall time at ingestion, kept at microsecond
/// precision; `sampled_at_ms` is the producer's timestamp (milliseconds
/// since the Unix epoch) and is kept verbatim. The stream type is fixed by
/// the reading variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    received_at: DateTime<Utc>,
    sampled_at_ms: i64,
    reading: Reading,
}

impl Sample {
    /// Create a sample.
    #[must_use]
    pub fn new(received_at: DateTime<Utc>, sampled_at_ms: i64, reading: Reading) -> Self {
        Self {
            received_at: received_at.trunc_subsecs(6),
            sampled_at_ms,
            reading,
        }
    }

    /// Create a sample received now.
    #[must_use]
    pub fn received_now(sampled_at_ms: i64, reading: Reading) -> Self {
        Self::new(Utc::now(), sampled_at_ms, reading)
    }

    #[must_use]
    pub const fn stream_type(&self) -> StreamType {
        self.reading.stream_type()
    }

    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    #[must_use]
    pub const fn sampled_at_ms(&self) -> i64 {
        self.sampled_at_ms
    }

    #[must_use]
    pub const fn reading(&self) -> &Reading {
        &self.reading
    }
}

/// Persisted sample with its row identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    /// Monotonic per-table row id, assigned on insert.
    pub row_id: i64,
    pub sample: Sample,
}

/// Raw payload pushed by the provider: producer time plus named values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderSample {
    pub sampled_at_ms: i64,
    pub values: HashMap<String, f64>,
}

impl ProviderSample {
    #[must_use]
    pub fn new(sampled_at_ms: i64) -> Self {
        Self {
            sampled_at_ms,
            values: HashMap::new(),
        }
    }

    /// Add a named value.
    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}
