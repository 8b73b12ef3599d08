use std::io::Cursor;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use csv::{Reader, ReaderBuilder, StringRecord};

use crate::errors::{ParseError, RowError};

const MISSING_TOKENS: [&str; 3] = ["NA", "N/A", "NULL"];

pub(crate) fn open_reader(content: Bytes, delimiter: u8) -> Reader<Cursor<Bytes>> {
    ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(Cursor::new(content))
}

/// Reads and normalizes the header row. The raw (trimmed, BOM-stripped) names
/// are returned alongside the normalized ones for decoders that need the
/// original spelling.
pub(crate) fn read_headers(
    reader: &mut Reader<Cursor<Bytes>>,
    decoder: &'static str,
) -> Result<Vec<HeaderColumn>, ParseError> {
    let headers = reader
        .headers()
        .map_err(|err| header_error(decoder, &err))?
        .clone();

    if headers.iter().all(|column| strip_bom(column).trim().is_empty()) {
        return Err(ParseError::Empty { decoder });
    }

    Ok(headers
        .iter()
        .map(|column| {
            let raw = strip_bom(column).trim().to_string();
            HeaderColumn {
                normalized: normalize_header(&raw),
                raw,
            }
        })
        .collect())
}

#[derive(Debug, Clone)]
pub(crate) struct HeaderColumn {
    pub raw: String,
    pub normalized: String,
}

pub(crate) fn find_column(
    headers: &[HeaderColumn],
    aliases: &[&str],
) -> Option<usize> {
    headers
        .iter()
        .position(|column| aliases.contains(&column.normalized.as_str()))
}

pub(crate) fn require_column(
    headers: &[HeaderColumn],
    aliases: &[&str],
    decoder: &'static str,
) -> Result<usize, ParseError> {
    find_column(headers, aliases).ok_or_else(|| ParseError::InvalidHeader {
        decoder,
        byte_offset: 0,
        message: format!("missing required column `{}`", aliases[0]),
    })
}

fn header_error(decoder: &'static str, err: &csv::Error) -> ParseError {
    let byte_offset = err.position().map(|pos| pos.byte()).unwrap_or(0);
    match err.kind() {
        csv::ErrorKind::Utf8 { .. } => ParseError::Encoding {
            decoder,
            byte_offset,
        },
        _ => ParseError::InvalidHeader {
            decoder,
            byte_offset,
            message: err.to_string(),
        },
    }
}

fn strip_bom(value: &str) -> &str {
    value.trim_start_matches('\u{feff}')
}

pub(crate) fn normalize_header(value: &str) -> String {
    strip_bom(value)
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

pub(crate) fn is_missing(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || MISSING_TOKENS
            .iter()
            .any(|token| trimmed.eq_ignore_ascii_case(token))
}

pub(crate) fn optional_text(value: &str) -> Option<String> {
    if is_missing(value) {
        None
    } else {
        Some(value.trim().to_string())
    }
}

pub(crate) fn parse_value(value: &str) -> Result<Option<f64>, String> {
    if is_missing(value) {
        return Ok(None);
    }
    let trimmed = value.trim();
    match trimmed.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Ok(Some(parsed)),
        Ok(_) => Err(format!("non-finite numeric value `{trimmed}`")),
        Err(_) => Err(format!("invalid numeric value `{trimmed}`")),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]` and
/// bare dates. Naive values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, pattern) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Position of a data record in the source file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RowContext {
    pub row: u64,
    pub line: u64,
    pub byte_offset: u64,
}

impl RowContext {
    pub fn of(row: u64, record: &StringRecord) -> Self {
        let (line, byte_offset) = record
            .position()
            .map(|pos| (pos.line(), pos.byte()))
            .unwrap_or((0, 0));
        Self {
            row,
            line,
            byte_offset,
        }
    }

    pub fn error(&self, message: impl Into<String>) -> RowError {
        RowError::new(self.row, self.line, self.byte_offset, message)
    }
}

pub(crate) fn row_error_from_csv(row: u64, err: &csv::Error) -> RowError {
    let (line, byte_offset) = err
        .position()
        .map(|pos| (pos.line(), pos.byte()))
        .unwrap_or((0, 0));
    RowError::new(row, line, byte_offset, err.to_string())
}

pub(crate) fn field<'r>(record: &'r StringRecord, index: usize) -> &'r str {
    record.get(index).map(str::trim).unwrap_or("")
}

pub(crate) fn required_key(
    ctx: &RowContext,
    record: &StringRecord,
    index: usize,
    what: &str,
) -> Result<String, RowError> {
    let value = field(record, index);
    if is_missing(value) {
        Err(ctx.error(format!("missing {what} key")))
    } else {
        Ok(value.to_string())
    }
}

pub(crate) fn required_timestamp(
    ctx: &RowContext,
    record: &StringRecord,
    index: usize,
) -> Result<DateTime<Utc>, RowError> {
    let value = field(record, index);
    parse_timestamp(value).ok_or_else(|| ctx.error(format!("unrecognized timestamp `{value}`")))
}

pub(crate) fn utf8_text<'a>(content: &'a [u8], decoder: &'static str) -> Result<&'a str, ParseError> {
    std::str::from_utf8(content).map_err(|err| ParseError::Encoding {
        decoder,
        byte_offset: err.valid_up_to() as u64,
    })
}
