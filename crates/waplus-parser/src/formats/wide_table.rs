use std::collections::HashSet;

use bytes::Bytes;
use csv::StringRecord;

use crate::errors::{ParseError, RowError};
use crate::model::{Capability, DecodedFile, RawObservation};
use crate::registry::SourceDecoder;

use super::common::{
    field, open_reader, parse_value, read_headers, require_column, required_key,
    required_timestamp, row_error_from_csv, HeaderColumn, RowContext,
};

const BASIN: &[&str] = &["basin", "basin_id", "basin_code", "basin_key"];
const TIMESTAMP: &[&str] = &["timestamp", "date", "time", "datetime"];

/// `basin, timestamp, <indicator>[<unit>], ...` with one observation per
/// indicator cell. Indicator columns keep their original spelling since
/// catalog keys match exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct WideTableDecoder;

impl WideTableDecoder {
    const NAME: &'static str = "csv_wide";

    fn indicator_columns(
        headers: &[HeaderColumn],
        basin: usize,
        timestamp: usize,
    ) -> Result<Vec<IndicatorColumn>, ParseError> {
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            if index == basin || index == timestamp {
                continue;
            }
            let (indicator, unit) = split_unit(&header.raw);
            if indicator.is_empty() {
                return Err(ParseError::InvalidHeader {
                    decoder: Self::NAME,
                    byte_offset: 0,
                    message: format!("column {} has no indicator name", index + 1),
                });
            }
            if !seen.insert(indicator.clone()) {
                return Err(ParseError::InvalidHeader {
                    decoder: Self::NAME,
                    byte_offset: 0,
                    message: format!("indicator `{indicator}` appears in more than one column"),
                });
            }
            columns.push(IndicatorColumn {
                index,
                indicator,
                unit,
            });
        }

        if columns.is_empty() {
            return Err(ParseError::InvalidHeader {
                decoder: Self::NAME,
                byte_offset: 0,
                message: "no indicator columns".to_string(),
            });
        }
        Ok(columns)
    }
}

#[derive(Debug, Clone)]
struct IndicatorColumn {
    index: usize,
    indicator: String,
    unit: Option<String>,
}

/// `precip_mm[mm]` and `precip_mm (mm)` both carry a unit suffix.
fn split_unit(raw: &str) -> (String, Option<String>) {
    for (open, close) in [('[', ']'), ('(', ')')] {
        if let Some(stripped) = raw.strip_suffix(close) {
            if let Some(start) = stripped.rfind(open) {
                let unit = stripped[start + 1..].trim();
                let name = stripped[..start].trim();
                let unit = (!unit.is_empty()).then(|| unit.to_string());
                return (name.to_string(), unit);
            }
        }
    }
    (raw.trim().to_string(), None)
}

struct WideLayout {
    basin: usize,
    timestamp: usize,
    indicators: Vec<IndicatorColumn>,
}

impl WideLayout {
    fn observations(&self, row: u64, record: &StringRecord) -> Vec<Result<RawObservation, RowError>> {
        let ctx = RowContext::of(row, record);
        let keys = required_key(&ctx, record, self.basin, "basin")
            .and_then(|basin| Ok((basin, required_timestamp(&ctx, record, self.timestamp)?)));
        let (basin_key, timestamp) = match keys {
            Ok(keys) => keys,
            Err(err) => return vec![Err(err)],
        };

        self.indicators
            .iter()
            .map(|column| {
                let value = parse_value(field(record, column.index))
                    .map_err(|message| ctx.error(format!("{}: {message}", column.indicator)))?;
                Ok(RawObservation {
                    row: ctx.row,
                    line: ctx.line,
                    byte_offset: ctx.byte_offset,
                    basin_key: basin_key.clone(),
                    indicator_key: column.indicator.clone(),
                    timestamp,
                    value,
                    unit: column.unit.clone(),
                    quality_flag: None,
                    comment: None,
                })
            })
            .collect()
    }
}

impl SourceDecoder for WideTableDecoder {
    fn format(&self) -> &'static str {
        Self::NAME
    }

    fn capability(&self) -> Capability {
        Capability::TabularTimeseries
    }

    fn decode(&self, content: Bytes) -> Result<DecodedFile, ParseError> {
        let mut reader = open_reader(content, b',');
        let headers = read_headers(&mut reader, Self::NAME)?;
        let basin = require_column(&headers, BASIN, Self::NAME)?;
        let timestamp = require_column(&headers, TIMESTAMP, Self::NAME)?;
        let layout = WideLayout {
            basin,
            timestamp,
            indicators: Self::indicator_columns(&headers, basin, timestamp)?,
        };

        let stream = reader
            .into_records()
            .enumerate()
            .flat_map(move |(index, result)| {
                let row = index as u64 + 1;
                match result {
                    Ok(record) => layout.observations(row, &record),
                    Err(err) => vec![Err(row_error_from_csv(row, &err))],
                }
            });

        Ok(DecodedFile::Timeseries(Box::new(stream)))
    }
}
