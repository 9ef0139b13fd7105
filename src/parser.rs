//! Turns one reassembled text line into a `Record`.

use crate::error::{MalformedReason, MalformedRecord};
use crate::record::{Axes, Record};
use std::str::FromStr;

const FIELD_NAMES: [&str; 9] = [
    "millis", "ax", "ay", "az", "gx", "gy", "gz", "tempC", "audioRMS",
];

/// Parse `millis,ax,ay,az,gx,gy,gz,tempC,audioRMS`.
///
/// Whitespace around commas is ignored. Exactly 9 fields are required; the
/// first must be a non-negative integer, the rest floating point.
pub fn parse_record(line: &str) -> Result<Record, MalformedRecord> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() != FIELD_NAMES.len() {
        return Err(MalformedRecord {
            line: line.to_string(),
            reason: MalformedReason::FieldCount(parts.len()),
        });
    }

    let invalid = |index: usize| MalformedRecord {
        line: line.to_string(),
        reason: MalformedReason::InvalidField {
            index,
            name: FIELD_NAMES[index],
            value: parts[index].to_string(),
        },
    };

    let millis = parts[0].parse::<u64>().map_err(|_| invalid(0))?;

    let mut values = [0.0f64; 8];
    for (i, slot) in values.iter_mut().enumerate() {
        *slot = parts[i + 1].parse::<f64>().map_err(|_| invalid(i + 1))?;
    }

    Ok(Record::from_fields(
        millis,
        Axes::new(values[0], values[1], values[2]),
        Axes::new(values[3], values[4], values[5]),
        values[6],
        values[7],
    ))
}

impl FromStr for Record {
    type Err = MalformedRecord;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_record(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_line() {
        let r = parse_record("1000, 0.1, -0.2, 9.8, 1.0, 2.0, 3.0, 25.25, 512.5").unwrap();
        assert_eq!(r.timestamp_millis(), 1000);
        assert_eq!(r.accel(), Axes::new(0.1, -0.2, 9.8));
        assert_eq!(r.gyro(), Axes::new(1.0, 2.0, 3.0));
        assert_eq!(r.temperature_c(), 25.25);
        assert_eq!(r.audio_rms(), 512.5);
    }

    #[test]
    fn test_round_trip_through_display() {
        let lines = [
            "0,0,0,0,0,0,0,0,-1",
            "4294967296,0.123456789,-1e-7,9.80665,-250.5,0.000001,1000,-40.125,-1",
            "77,1.7976931348623157e308,-0.5,0.3333333333333333,2,3,4,36.6,0.001",
        ];
        for line in lines {
            let record: Record = line.parse().unwrap();
            let again: Record = record.to_string().parse().unwrap();
            assert_eq!(record, again, "round trip failed for {}", line);
        }
    }

    #[test]
    fn test_wrong_field_count() {
        let err = parse_record("1,2,3,4,5,6,7,8").unwrap_err();
        assert_eq!(err.reason, MalformedReason::FieldCount(8));

        let err = parse_record("1,2,3,4,5,6,7,8,9,10").unwrap_err();
        assert_eq!(err.reason, MalformedReason::FieldCount(10));
    }

    #[test]
    fn test_non_numeric_field() {
        let err = parse_record("1,2,3,abc,5,6,7,8,9").unwrap_err();
        match err.reason {
            MalformedReason::InvalidField { index, name, value } => {
                assert_eq!(index, 3);
                assert_eq!(name, "az");
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected reason {:?}", other),
        }
    }

    #[test]
    fn test_millis_must_be_integer() {
        assert!(parse_record("1.5,2,3,4,5,6,7,8,9").is_err());
        assert!(parse_record("-1,2,3,4,5,6,7,8,9").is_err());
    }

    #[test]
    fn test_empty_field_is_malformed() {
        assert!(parse_record("1,2,,4,5,6,7,8,9").is_err());
    }
}
