use bytes::Bytes;
use csv::StringRecord;

use crate::errors::{ParseError, RowError};
use crate::model::{Capability, DecodedFile, RawObservation};
use crate::registry::SourceDecoder;

use super::common::{
    field, find_column, open_reader, optional_text, parse_value, read_headers, require_column,
    required_key, required_timestamp, row_error_from_csv, RowContext,
};

const BASIN: &[&str] = &["basin", "basin_id", "basin_code", "basin_key"];
const INDICATOR: &[&str] = &["indicator", "indicator_id", "indicator_code"];
const TIMESTAMP: &[&str] = &["timestamp", "date", "time", "datetime"];
const VALUE: &[&str] = &["value", "value_numeric"];
const UNIT: &[&str] = &["unit", "units", "unit_of_measurement"];
const QUALITY_FLAG: &[&str] = &["quality_flag", "flag", "quality"];
const COMMENT: &[&str] = &["comment", "comments", "note", "notes"];

/// One observation per row: `basin, indicator, timestamp, value, unit` plus
/// optional `quality_flag` and `comment` columns.
#[derive(Debug, Clone, Copy)]
pub struct LongTableDecoder {
    format: &'static str,
    delimiter: u8,
}

impl LongTableDecoder {
    pub const fn csv() -> Self {
        Self::with_delimiter("csv_long", b',')
    }

    pub const fn tsv() -> Self {
        Self::with_delimiter("tsv_long", b'\t')
    }

    pub const fn with_delimiter(format: &'static str, delimiter: u8) -> Self {
        Self { format, delimiter }
    }
}

#[derive(Debug, Clone, Copy)]
struct LongColumns {
    basin: usize,
    indicator: usize,
    timestamp: usize,
    value: usize,
    unit: usize,
    quality_flag: Option<usize>,
    comment: Option<usize>,
}

impl LongColumns {
    fn observation(&self, row: u64, record: &StringRecord) -> Result<RawObservation, RowError> {
        let ctx = RowContext::of(row, record);
        let basin_key = required_key(&ctx, record, self.basin, "basin")?;
        let indicator_key = required_key(&ctx, record, self.indicator, "indicator")?;
        let timestamp = required_timestamp(&ctx, record, self.timestamp)?;
        let value = parse_value(field(record, self.value)).map_err(|message| ctx.error(message))?;

        Ok(RawObservation {
            row: ctx.row,
            line: ctx.line,
            byte_offset: ctx.byte_offset,
            basin_key,
            indicator_key,
            timestamp,
            value,
            unit: optional_text(field(record, self.unit)),
            quality_flag: self
                .quality_flag
                .and_then(|index| optional_text(field(record, index))),
            comment: self
                .comment
                .and_then(|index| optional_text(field(record, index))),
        })
    }
}

impl SourceDecoder for LongTableDecoder {
    fn format(&self) -> &'static str {
        self.format
    }

    fn capability(&self) -> Capability {
        Capability::TabularTimeseries
    }

    fn decode(&self, content: Bytes) -> Result<DecodedFile, ParseError> {
        let decoder = self.format;
        let mut reader = open_reader(content, self.delimiter);
        let headers = read_headers(&mut reader, decoder)?;

        let columns = LongColumns {
            basin: require_column(&headers, BASIN, decoder)?,
            indicator: require_column(&headers, INDICATOR, decoder)?,
            timestamp: require_column(&headers, TIMESTAMP, decoder)?,
            value: require_column(&headers, VALUE, decoder)?,
            unit: require_column(&headers, UNIT, decoder)?,
            quality_flag: find_column(&headers, QUALITY_FLAG),
            comment: find_column(&headers, COMMENT),
        };

        let stream = reader
            .into_records()
            .enumerate()
            .map(move |(index, result)| {
                let row = index as u64 + 1;
                let record = result.map_err(|err| row_error_from_csv(row, &err))?;
                columns.observation(row, &record)
            });

        Ok(DecodedFile::Timeseries(Box::new(stream)))
    }
}
