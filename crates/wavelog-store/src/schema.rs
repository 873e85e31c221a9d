//! Table layout for the SQLite store.
//!
//! One table per stream type. Every table starts with the same three
//! columns (`id`, `rcvd_time`, `sample_time`) followed by the stream
//! type's value fields in [`StreamType::field_names`] order.

use chrono::{DateTime, Utc};
use wavelog_core::{AccelReading, LocationReading, Reading, Sample, StreamType};

/// Table holding samples of `stream_type`.
#[must_use]
pub const fn table_name(stream_type: StreamType) -> &'static str {
    match stream_type {
        StreamType::Accel => "accel_data",
        StreamType::Location => "location_data",
    }
}

/// Value columns that may hold NULL.
fn is_nullable(stream_type: StreamType, field: &str) -> bool {
    stream_type == StreamType::Location && matches!(field, "accuracy" | "bearing" | "speed")
}

/// `CREATE TABLE` statement for `stream_type`.
#[must_use]
pub fn create_table_sql(stream_type: StreamType) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         id INTEGER PRIMARY KEY AUTOINCREMENT, \
         rcvd_time INTEGER NOT NULL, \
         sample_time INTEGER NOT NULL",
        table_name(stream_type)
    );
    for field in stream_type.field_names() {
        sql.push_str(", ");
        sql.push_str(field);
        sql.push_str(" REAL");
        if !is_nullable(stream_type, field) {
            sql.push_str(" NOT NULL");
        }
    }
    sql.push(')');
    sql
}

/// `DROP TABLE` statement for `stream_type`.
#[must_use]
pub fn drop_table_sql(stream_type: StreamType) -> String {
    format!("DROP TABLE IF EXISTS {}", table_name(stream_type))
}

/// Parameterized insert; binds `rcvd_time`, `sample_time`, then the values.
#[must_use]
pub fn insert_sql(stream_type: StreamType) -> String {
    let fields = stream_type.field_names();
    let placeholders = vec!["?"; fields.len() + 2].join(", ");
    format!(
        "INSERT INTO {} (rcvd_time, sample_time, {}) VALUES ({placeholders})",
        table_name(stream_type),
        fields.join(", ")
    )
}

/// One page of rows with `after < id <= upper`, binds `after`, `upper`, `limit`.
#[must_use]
pub fn select_page_sql(stream_type: StreamType) -> String {
    format!(
        "SELECT id, rcvd_time, sample_time, {} FROM {} \
         WHERE id > ? AND id <= ? ORDER BY id ASC LIMIT ?",
        stream_type.field_names().join(", "),
        table_name(stream_type)
    )
}

/// Highest row id currently in the table.
#[must_use]
pub fn max_id_sql(stream_type: StreamType) -> String {
    format!("SELECT MAX(id) FROM {}", table_name(stream_type))
}

#[must_use]
pub fn count_sql(stream_type: StreamType) -> String {
    format!("SELECT COUNT(*) FROM {}", table_name(stream_type))
}

#[must_use]
pub fn delete_all_sql(stream_type: StreamType) -> String {
    format!("DELETE FROM {}", table_name(stream_type))
}

/// Rebuild a sample from stored columns.
///
/// # Errors
/// Returns a description of the problem if a mandatory value is NULL,
/// the value count is wrong, or the timestamp is out of range.
pub fn decode_sample(
    stream_type: StreamType,
    rcvd_time_us: i64,
    sample_time_ms: i64,
    values: &[Option<f64>],
) -> Result<Sample, String> {
    let fields = stream_type.field_names();
    if values.len() != fields.len() {
        return Err(format!(
            "expected {} values, found {}",
            fields.len(),
            values.len()
        ));
    }
    let required = |i: usize| values[i].ok_or_else(|| format!("NULL in column {}", fields[i]));

    let reading = match stream_type {
        StreamType::Accel => Reading::Accel(AccelReading {
            x: required(0)?,
            y: required(1)?,
            z: required(2)?,
        }),
        StreamType::Location => Reading::Location(LocationReading {
            latitude: required(0)?,
            longitude: required(1)?,
            altitude: required(2)?,
            accuracy: values[3],
            bearing: values[4],
            speed: values[5],
        }),
    };

    let received_at = DateTime::<Utc>::from_timestamp_micros(rcvd_time_us)
        .ok_or_else(|| format!("rcvd_time {rcvd_time_us} out of range"))?;

    Ok(Sample::new(received_at, sample_time_ms, reading))
}
