use std::collections::BTreeMap;

use bytes::Bytes;

use crate::errors::ParseError;
use crate::model::{Capability, DecodedFile, RasterDescriptor};
use crate::registry::SourceDecoder;

use super::common::{parse_timestamp, utf8_text};

const MAGIC: &str = "RASTER";
const TERMINATOR: &str = "END";

/// Line-oriented raster header:
///
/// ```text
/// RASTER
/// raster_id = evap_2023_01
/// coverage = {B42, B43}
/// resolution = 250
/// acquisition_date = 2023-01-31
/// storage_path = rasters/evap_2023_01.tif
/// END
/// ```
///
/// A header that stops before `END` is truncated.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterHdrDecoder;

struct Tag {
    value: String,
    byte_offset: u64,
}

impl RasterHdrDecoder {
    const NAME: &'static str = "raster_hdr";

    fn descriptor_error(byte_offset: u64, message: impl Into<String>) -> ParseError {
        ParseError::Descriptor {
            decoder: Self::NAME,
            byte_offset,
            message: message.into(),
        }
    }

    fn take_required(
        tags: &mut BTreeMap<String, Tag>,
        key: &str,
        end_offset: u64,
    ) -> Result<Tag, ParseError> {
        tags.remove(key)
            .ok_or_else(|| Self::descriptor_error(end_offset, format!("missing required tag `{key}`")))
    }

    fn parse_coverage(tag: &Tag) -> Result<Vec<String>, ParseError> {
        let inner = tag
            .value
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| {
                Self::descriptor_error(tag.byte_offset, "coverage must be written as {B1, B2, ...}")
            })?;
        let basins: Vec<String> = inner
            .split(',')
            .map(str::trim)
            .filter(|basin| !basin.is_empty())
            .map(str::to_string)
            .collect();
        if basins.is_empty() {
            return Err(Self::descriptor_error(tag.byte_offset, "coverage set is empty"));
        }
        Ok(basins)
    }
}

impl SourceDecoder for RasterHdrDecoder {
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

        let mut offset = 0u64;
        let mut seen_magic = false;
        let mut end_offset = None;
        let mut tags: BTreeMap<String, Tag> = BTreeMap::new();

        for raw_line in text.split_inclusive('\n') {
            let line_offset = offset;
            offset += raw_line.len() as u64;
            let line = raw_line.trim();

            if let Some(end) = end_offset {
                if !line.is_empty() {
                    return Err(Self::descriptor_error(
                        line_offset,
                        format!("content after {TERMINATOR} (terminator at byte {end})"),
                    ));
                }
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !seen_magic {
                if line != MAGIC {
                    return Err(ParseError::InvalidHeader {
                        decoder: Self::NAME,
                        byte_offset: line_offset,
                        message: format!("expected `{MAGIC}` magic line"),
                    });
                }
                seen_magic = true;
                continue;
            }
            if line == TERMINATOR {
                end_offset = Some(line_offset);
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                Self::descriptor_error(line_offset, format!("expected `key = value`, got `{line}`"))
            })?;
            let key = key.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(Self::descriptor_error(line_offset, "empty tag name"));
            }
            let tag = Tag {
                value: value.trim().to_string(),
                byte_offset: line_offset,
            };
            if tags.insert(key.clone(), tag).is_some() {
                return Err(Self::descriptor_error(line_offset, format!("duplicate tag `{key}`")));
            }
        }

        let Some(end_offset) = end_offset else {
            return Err(ParseError::Truncated {
                decoder: Self::NAME,
                byte_offset: offset,
                message: format!("header ended before `{TERMINATOR}`"),
            });
        };

        let raster_id = Self::take_required(&mut tags, "raster_id", end_offset)?;
        let coverage = Self::take_required(&mut tags, "coverage", end_offset)?;
        let resolution = Self::take_required(&mut tags, "resolution", end_offset)?;
        let acquisition = Self::take_required(&mut tags, "acquisition_date", end_offset)?;
        let storage_path = Self::take_required(&mut tags, "storage_path", end_offset)?;

        let resolution_value = resolution.value.parse::<f64>().map_err(|_| {
            Self::descriptor_error(
                resolution.byte_offset,
                format!("invalid resolution `{}`", resolution.value),
            )
        })?;
        let acquisition_date = parse_timestamp(&acquisition.value).ok_or_else(|| {
            Self::descriptor_error(
                acquisition.byte_offset,
                format!("unrecognized acquisition_date `{}`", acquisition.value),
            )
        })?;

        Ok(DecodedFile::Raster(RasterDescriptor {
            raster_id: raster_id.value,
            coverage: Self::parse_coverage(&coverage)?,
            resolution: resolution_value,
            acquisition_date,
            storage_path: storage_path.value,
            indicator: tags.remove("indicator").map(|tag| tag.value),
            crs: tags.remove("crs").map(|tag| tag.value),
            attributes: tags
                .into_iter()
                .map(|(key, tag)| (key, tag.value))
                .collect(),
        }))
    }
}
