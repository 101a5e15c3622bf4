//! Trace buffer decoding and record formatting.
//!
//! The buffer is fetched as one comma-separated string with five elements per
//! point, cycling through reading, timestamp, source current, average voltage
//! and reading number.

use crate::error::{AppResult, DaqError};
use crate::measurement::mode::{MeasurementMode, ReadingUnit};
use serde::Serialize;

/// Elements per buffered point.
pub const FIELDS_PER_POINT: usize = 5;

const READING: usize = 0;
const TIMESTAMP: usize = 1;
const SOURCE_CURRENT: usize = 2;
const AVG_VOLTAGE: usize = 3;
const READING_NUMBER: usize = 4;

/// One decoded point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Record {
    pub reading: f64,
    pub timestamp_seconds: f64,
    pub source_current_amps: f64,
    pub avg_voltage_volts: f64,
    pub reading_number: u32,
}

/// Channels of a buffer, one vector per element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channels {
    pub readings: Vec<f64>,
    pub timestamps: Vec<f64>,
    pub source_currents: Vec<f64>,
    pub avg_voltages: Vec<f64>,
    pub reading_numbers: Vec<u32>,
}

/// A decoded buffer.
///
/// Keeps the device's tokens so persisted lines carry the values exactly as
/// reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBuffer {
    tokens: Vec<String>,
    records: Vec<Record>,
}

impl ParsedBuffer {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Every fifth token starting at `offset`.
    pub fn channel(&self, offset: usize) -> impl Iterator<Item = &str> {
        self.tokens
            .iter()
            .skip(offset)
            .step_by(FIELDS_PER_POINT)
            .map(String::as_str)
    }

    pub fn channels(&self) -> Channels {
        Channels {
            readings: self.records.iter().map(|r| r.reading).collect(),
            timestamps: self.records.iter().map(|r| r.timestamp_seconds).collect(),
            source_currents: self.records.iter().map(|r| r.source_current_amps).collect(),
            avg_voltages: self.records.iter().map(|r| r.avg_voltage_volts).collect(),
            reading_numbers: self.records.iter().map(|r| r.reading_number).collect(),
        }
    }

    /// Persisted lines, one per point, tokens tab-separated as reported.
    pub fn lines(&self) -> Vec<String> {
        self.tokens
            .chunks_exact(FIELDS_PER_POINT)
            .map(|chunk| chunk.join("\t"))
            .collect()
    }
}

fn number(token: &str, position: usize) -> AppResult<f64> {
    token.parse::<f64>().map_err(|_| {
        DaqError::MalformedBuffer(format!("token {position} ('{token}') is not a number"))
    })
}

fn reading_number(token: &str, position: usize) -> AppResult<u32> {
    if let Ok(n) = token.parse::<u32>() {
        return Ok(n);
    }
    let value = number(token, position)?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= f64::from(u32::MAX) {
        Ok(value as u32)
    } else {
        Err(DaqError::MalformedBuffer(format!(
            "token {position} ('{token}') is not a reading number"
        )))
    }
}

/// Decode a raw buffer response.
///
/// # Errors
/// `MalformedBuffer` when the token count is not a positive multiple of five
/// or a token is not numeric.
pub fn parse_buffer(raw: &str) -> AppResult<ParsedBuffer> {
    let tokens: Vec<String> = raw
        .trim()
        .split(',')
        .map(|token| token.trim().to_string())
        .collect();
    if raw.trim().is_empty() || tokens.len() % FIELDS_PER_POINT != 0 {
        return Err(DaqError::MalformedBuffer(format!(
            "{} tokens is not a positive multiple of {FIELDS_PER_POINT}",
            if raw.trim().is_empty() { 0 } else { tokens.len() }
        )));
    }

    let records = tokens
        .chunks_exact(FIELDS_PER_POINT)
        .enumerate()
        .map(|(i, chunk)| {
            let base = i * FIELDS_PER_POINT;
            Ok(Record {
                reading: number(&chunk[READING], base + READING)?,
                timestamp_seconds: number(&chunk[TIMESTAMP], base + TIMESTAMP)?,
                source_current_amps: number(&chunk[SOURCE_CURRENT], base + SOURCE_CURRENT)?,
                avg_voltage_volts: number(&chunk[AVG_VOLTAGE], base + AVG_VOLTAGE)?,
                reading_number: reading_number(&chunk[READING_NUMBER], base + READING_NUMBER)?,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok(ParsedBuffer { tokens, records })
}

/// Header line naming the mode and the reading unit.
pub fn header_line(mode: MeasurementMode, unit: ReadingUnit) -> String {
    format!(
        "{} {}\ttimestamp (s)\tCurrent (A)\tAvg. Voltage (V)\tReading Number",
        mode.title(),
        unit.reading_label()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_POINTS: &str = "1.0E-3,0.0,1.0E-5,2.0E-3,0,\
                              1.1E-3,0.1,-1.0E-5,2.1E-3,1\n";

    #[test]
    fn decodes_records_in_device_order() {
        let parsed = parse_buffer(TWO_POINTS).unwrap();
        assert_eq!(parsed.len(), 2);
        let second = parsed.records()[1];
        assert_eq!(second.reading, 1.1e-3);
        assert_eq!(second.timestamp_seconds, 0.1);
        assert_eq!(second.reading_number, 1);
        assert_eq!(second.source_current_amps, -1e-5);
        assert_eq!(second.avg_voltage_volts, 2.1e-3);
    }

    #[test]
    fn channels_split_every_fifth_token() {
        let channels = parse_buffer(TWO_POINTS).unwrap().channels();
        assert_eq!(channels.readings, vec![1.0e-3, 1.1e-3]);
        assert_eq!(channels.reading_numbers, vec![0, 1]);
        assert_eq!(channels.source_currents, vec![1e-5, -1e-5]);
    }

    #[test]
    fn lines_keep_device_tokens() {
        let lines = parse_buffer(TWO_POINTS).unwrap().lines();
        assert_eq!(lines[0], "1.0E-3\t0.0\t1.0E-5\t2.0E-3\t0");
        assert_eq!(lines[1], "1.1E-3\t0.1\t-1.0E-5\t2.1E-3\t1");
    }

    #[test]
    fn rejects_partial_records() {
        assert!(matches!(
            parse_buffer("1,2,3,4,5,6"),
            Err(DaqError::MalformedBuffer(_))
        ));
        assert!(matches!(parse_buffer(""), Err(DaqError::MalformedBuffer(_))));
    }

    #[test]
    fn rejects_non_numeric_tokens() {
        assert!(matches!(
            parse_buffer("1,2,3,4,volts"),
            Err(DaqError::MalformedBuffer(_))
        ));
    }

    #[test]
    fn accepts_float_reading_numbers() {
        let parsed = parse_buffer("1,2,3,4,+5.000000E+00").unwrap();
        assert_eq!(parsed.records()[0].reading_number, 5);
        assert_eq!(parsed.channel(4).collect::<Vec<_>>(), vec!["+5.000000E+00"]);
    }

    #[test]
    fn header_names_mode_and_unit() {
        assert_eq!(
            header_line(MeasurementMode::Delta, ReadingUnit::Volts),
            "Delta Reading (V)\ttimestamp (s)\tCurrent (A)\tAvg. Voltage (V)\tReading Number"
        );
    }
}
