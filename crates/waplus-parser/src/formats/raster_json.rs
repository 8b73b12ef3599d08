use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::error::Category;

use crate::errors::ParseError;
use crate::model::{Capability, DecodedFile, RasterDescriptor};
use crate::registry::SourceDecoder;

use super::common::{parse_timestamp, utf8_text};

#[derive(Debug, Deserialize)]
struct RasterDocument {
    raster_id: String,
    coverage: Vec<String>,
    resolution: f64,
    acquisition_date: String,
    storage_path: String,
    #[serde(default)]
    indicator: Option<String>,
    #[serde(default)]
    crs: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RasterJsonDecoder;

impl RasterJsonDecoder {
    const NAME: &'static str = "raster_json";

    fn descriptor_error(byte_offset: u64, message: impl Into<String>) -> ParseError {
        ParseError::Descriptor {
            decoder: Self::NAME,
            byte_offset,
            message: message.into(),
        }
    }
}

/// serde_json reports 1-based line/column; convert to a byte offset.
fn offset_of(text: &str, line: usize, column: usize) -> u64 {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(text.len()) as u64
}

impl SourceDecoder for RasterJsonDecoder {
    fn format(&self) -> &'static str {
        Self::NAME
    }

    fn capability(&self) -> Capability {
        Capability::RasterMetadata
    }

    fn decode(&self, content: Bytes) -> Result<DecodedFile, ParseError> {
        let text = utf8_text(&content, Self::NAME)?;
        if text.trim().is_empty() {
            return Err(ParseError::Empty {
                decoder: Self::NAME,
            });
        }

        let document: RasterDocument = serde_json::from_str(text).map_err(|err| {
            let byte_offset = offset_of(text, err.line(), err.column());
            match err.classify() {
                Category::Eof => ParseError::Truncated {
                    decoder: Self::NAME,
                    byte_offset,
                    message: err.to_string(),
                },
                _ => Self::descriptor_error(byte_offset, err.to_string()),
            }
        })?;

        let locate = |needle: &str| text.find(needle).unwrap_or(0) as u64;

        if document.raster_id.trim().is_empty() {
            return Err(Self::descriptor_error(locate("raster_id"), "empty raster_id"));
        }
        if document.coverage.is_empty() {
            return Err(Self::descriptor_error(locate("coverage"), "coverage set is empty"));
        }
        if document.storage_path.trim().is_empty() {
            return Err(Self::descriptor_error(locate("storage_path"), "empty storage_path"));
        }
        let acquisition_date = parse_timestamp(&document.acquisition_date).ok_or_else(|| {
            Self::descriptor_error(
                locate(&document.acquisition_date),
                format!("unrecognized acquisition_date `{}`", document.acquisition_date),
            )
        })?;

        Ok(DecodedFile::Raster(RasterDescriptor {
            raster_id: document.raster_id.trim().to_string(),
            coverage: document
                .coverage
                .into_iter()
                .map(|basin| basin.trim().to_string())
                .collect(),
            resolution: document.resolution,
            acquisition_date,
            storage_path: document.storage_path,
            indicator: document.indicator,
            crs: document.crs,
            attributes: document.attributes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::offset_of;

    #[test]
    fn offsets_follow_lines() {
        let text = "{\n  \"a\": 1,\n  \"b\"";
        assert_eq!(offset_of(text, 1, 1), 0);
        assert_eq!(offset_of(text, 2, 3), 4);
        assert_eq!(offset_of(text, 9, 9), text.len() as u64);
    }
}
