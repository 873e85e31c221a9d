//! CSV layout of export units.

use std::fmt::Write as _;

use chrono::SecondsFormat;
use wavelog_core::{Sample, StreamType};

/// File name of the unit holding `stream_type`'s rows.
#[must_use]
pub fn unit_name(stream_type: StreamType) -> String {
    format!("{stream_type}.csv")
}

/// Header line, including the trailing newline.
#[must_use]
pub fn header_line(stream_type: StreamType) -> String {
    let mut line = String::from("received_time,sample_time");
    for field in stream_type.field_names() {
        line.push(',');
        line.push_str(field);
    }
    line.push('\n');
    line
}

/// Data line for `sample`, including the trailing newline.
///
/// Received time is RFC 3339 UTC with milliseconds, sample time is the
/// producer's epoch milliseconds, values use six decimals and absent
/// optional values are left empty.
#[must_use]
pub fn row_line(sample: &Sample) -> String {
    let mut line = format!(
        "{},{}",
        sample.received_at().to_rfc3339_opts(SecondsFormat::Millis, true),
        sample.sampled_at_ms()
    );
    for value in sample.reading().values() {
        line.push(',');
        if let Some(value) = value {
            let _ = write!(line, "{value:.6}");
        }
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use wavelog_core::{AccelReading, LocationReading, Reading};

    use super::*;

    #[test]
    fn test_headers() {
        assert_eq!(header_line(StreamType::Accel), "received_time,sample_time,x,y,z\n");
        assert_eq!(
            header_line(StreamType::Location),
            "received_time,sample_time,latitude,longitude,altitude,accuracy,bearing,speed\n"
        );
        assert_eq!(unit_name(StreamType::Location), "location.csv");
    }

    #[test]
    fn test_accel_row() {
        let received = Utc.with_ymd_and_hms(2011, 3, 14, 15, 9, 26).unwrap();
        let sample = Sample::new(
            received,
            1_300_115_366_000,
            Reading::Accel(AccelReading {
                x: 1.0,
                y: -0.25,
                z: 9.806_65,
            }),
        );
        assert_eq!(
            row_line(&sample),
            "2011-03-14T15:09:26.000Z,1300115366000,1.000000,-0.250000,9.806650\n"
        );
    }

    #[test]
    fn test_location_row_leaves_missing_values_empty() {
        let received = Utc.with_ymd_and_hms(2011, 3, 14, 15, 9, 26).unwrap();
        let mut reading = LocationReading::new(37.875, -122.25, 52.0);
        reading.bearing = Some(90.0);
        let sample = Sample::new(received, 7, Reading::Location(reading));
        assert_eq!(
            row_line(&sample),
            "2011-03-14T15:09:26.000Z,7,37.875000,-122.250000,52.000000,,90.000000,\n"
        );
    }
}
