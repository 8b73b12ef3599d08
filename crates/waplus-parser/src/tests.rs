use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::errors::{ParseError, RowError};
use crate::model::{Capability, DecodedFile, RawObservation, RasterDescriptor};
use crate::registry::{ParserRegistry, SourceDecoder};

fn fixture(path: &str) -> Bytes {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let full_path = base.join("tests/data").join(path);
    let content = fs::read(&full_path)
        .unwrap_or_else(|err| panic!("failed to read fixture {}: {}", full_path.display(), err));
    Bytes::from(content)
}

fn decode_rows(format: &str, content: Bytes) -> Vec<Result<RawObservation, RowError>> {
    match ParserRegistry::standard()
        .decode(format, content)
        .expect("decode failed")
    {
        DecodedFile::Timeseries(stream) => stream.collect(),
        other => panic!("expected timeseries, got {other:?}"),
    }
}

fn decode_raster(format: &str, content: Bytes) -> Result<RasterDescriptor, ParseError> {
    match ParserRegistry::standard().decode(format, content)? {
        DecodedFile::Raster(descriptor) => Ok(descriptor),
        other => panic!("expected raster descriptor, got {other:?}"),
    }
}

#[test]
fn standard_registry_lists_builtin_formats() {
    let formats = ParserRegistry::standard().formats();
    let tags: Vec<&str> = formats.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(
        tags,
        vec!["csv_long", "csv_wide", "raster_hdr", "raster_json", "tsv_long"]
    );
    assert!(formats
        .iter()
        .any(|(tag, cap)| *tag == "raster_hdr" && *cap == Capability::RasterMetadata));
}

#[test]
fn parses_long_csv_scenario() {
    let rows = decode_rows("csv_long", fixture("basin42_2023.csv"));
    assert_eq!(rows.len(), 2);

    let first = rows[0].as_ref().expect("row 1 should decode");
    assert_eq!(first.row, 1);
    assert_eq!(first.line, 2);
    assert_eq!(first.basin_key, "B42");
    assert_eq!(first.indicator_key, "precip_mm");
    assert_eq!(first.value, Some(-5.0));
    assert_eq!(first.unit.as_deref(), Some("mm"));
    assert_eq!(first.timestamp.to_rfc3339(), "2023-01-01T00:00:00+00:00");

    let second = rows[1].as_ref().expect("row 2 should decode");
    assert_eq!(second.value, Some(12.0));
    assert!(second.byte_offset > first.byte_offset);
}

#[test]
fn malformed_rows_do_not_abort_siblings() {
    let rows = decode_rows("csv_long", fixture("long_mixed.csv"));
    assert_eq!(rows.len(), 5);

    let first = rows[0].as_ref().expect("aliased headers should resolve");
    assert_eq!(first.quality_flag.as_deref(), Some("ok"));
    assert_eq!(first.comment, None);

    let bad_timestamp = rows[1].as_ref().expect_err("row 2 has an invalid timestamp");
    assert_eq!(bad_timestamp.row, 2);
    assert_eq!(bad_timestamp.line, 3);
    assert!(bad_timestamp.message.contains("not-a-date"));

    let missing = rows[2].as_ref().expect("missing token is not a row error");
    assert_eq!(missing.value, None);
    assert_eq!(missing.comment.as_deref(), Some("sensor offline"));

    let converted = rows[3].as_ref().expect("row 4 should decode");
    assert_eq!(converted.unit.as_deref(), Some("cm"));
    assert_eq!(converted.quality_flag.as_deref(), Some("estimated"));

    let short_row = rows[4].as_ref().expect_err("row 5 has too few fields");
    assert_eq!(short_row.row, 5);
    assert_eq!(short_row.line, 6);
}

#[test]
fn tsv_long_uses_tab_delimiter() {
    let rows = decode_rows("tsv_long", fixture("runoff_2023_01.tsv"));
    let values: Vec<f64> = rows
        .iter()
        .map(|row| row.as_ref().expect("tsv row").value.expect("value"))
        .collect();
    assert_eq!(values, vec![1.25, 0.5]);
}

#[test]
fn wide_table_expands_indicator_columns() {
    let rows = decode_rows("csv_wide", fixture("wide_monthly.csv"));
    assert_eq!(rows.len(), 5);

    let first = rows[0].as_ref().expect("B42 precip");
    assert_eq!(first.indicator_key, "precip_mm");
    assert_eq!(first.unit.as_deref(), Some("mm"));
    assert_eq!(first.value, Some(41.0));
    let second = rows[1].as_ref().expect("B42 et");
    assert_eq!(second.indicator_key, "et_mm");
    assert_eq!(second.row, 1);

    assert_eq!(rows[2].as_ref().expect("B43 precip").value, None);
    assert_eq!(rows[3].as_ref().expect("B43 et").value, Some(18.0));

    let bad = rows[4].as_ref().expect_err("B44 row has a bad date");
    assert_eq!(bad.row, 3);
}

#[test]
fn missing_required_column_is_file_level() {
    let content = Bytes::from_static(b"basin,indicator,value,unit\nB42,precip_mm,1,mm\n");
    let err = ParserRegistry::standard()
        .decode("csv_long", content)
        .expect_err("timestamp column is required");
    match err {
        ParseError::InvalidHeader { message, .. } => assert!(message.contains("timestamp")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn empty_tabular_file_is_rejected() {
    let err = ParserRegistry::standard()
        .decode("csv_long", Bytes::new())
        .expect_err("empty input");
    assert!(matches!(err, ParseError::Empty { decoder: "csv_long" }));
}

#[test]
fn unknown_format_is_reported() {
    let err = ParserRegistry::standard()
        .decode("netcdf", Bytes::from_static(b"CDF"))
        .expect_err("no decoder");
    assert_eq!(
        err,
        ParseError::UnknownFormat {
            format: "netcdf".into()
        }
    );
    assert_eq!(err.byte_offset(), 0);
}

#[test]
fn parses_raster_json_descriptor() {
    let descriptor = decode_raster("raster_json", fixture("evap_2023_01.json")).expect("raster");
    assert_eq!(descriptor.raster_id, "evap_2023_01");
    assert_eq!(descriptor.coverage, vec!["B42", "B43"]);
    assert_eq!(descriptor.resolution, 250.0);
    assert_eq!(descriptor.indicator.as_deref(), Some("et_mm"));
    assert_eq!(descriptor.attributes.get("sensor").map(String::as_str), Some("MODIS"));
}

#[test]
fn truncated_raster_json_reports_offset() {
    let content = fixture("truncated.json");
    let len = content.len() as u64;
    let err = decode_raster("raster_json", content).expect_err("truncated");
    assert!(matches!(err, ParseError::Truncated { .. }), "got {err:?}");
    assert!(err.byte_offset() > 0 && err.byte_offset() <= len);
}

#[test]
fn parses_raster_header() {
    let descriptor = decode_raster("raster_hdr", fixture("evap_2023_01.hdr")).expect("raster");
    assert_eq!(descriptor.raster_id, "evap_2023_01");
    assert_eq!(descriptor.coverage, vec!["B42", "B43"]);
    assert_eq!(descriptor.storage_path, "rasters/evap_2023_01.tif");
    assert_eq!(descriptor.crs, None);
    assert_eq!(descriptor.attributes.get("sensor").map(String::as_str), Some("MODIS"));
}

#[test]
fn truncated_raster_header_is_file_level() {
    let content = fixture("truncated_header.hdr");
    let len = content.len() as u64;
    let err = decode_raster("raster_hdr", content).expect_err("truncated");
    assert!(matches!(err, ParseError::Truncated { .. }));
    assert_eq!(err.byte_offset(), len);
}

#[test]
fn raster_header_requires_every_tag() {
    let err = decode_raster("raster_hdr", fixture("missing_resolution.hdr")).expect_err("no resolution");
    match err {
        ParseError::Descriptor { message, .. } => assert!(message.contains("resolution")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn raster_header_requires_magic() {
    let err = decode_raster("raster_hdr", Bytes::from_static(b"\n\nIMAGE\nEND\n"))
        .expect_err("wrong magic");
    assert!(matches!(err, ParseError::InvalidHeader { byte_offset: 2, .. }));
}

#[test]
fn non_utf8_raster_is_encoding_error() {
    let err = decode_raster("raster_hdr", Bytes::from_static(b"RASTER\n\xff\xfe\n"))
        .expect_err("invalid utf-8");
    assert_eq!(
        err,
        ParseError::Encoding {
            decoder: "raster_hdr",
            byte_offset: 7
        }
    );
}

struct FixedDecoder;

impl SourceDecoder for FixedDecoder {
    fn format(&self) -> &'static str {
        "fixed_width"
    }

    fn capability(&self) -> Capability {
        Capability::TabularTimeseries
    }

    fn decode(&self, _content: Bytes) -> Result<DecodedFile, ParseError> {
        Ok(DecodedFile::Timeseries(Box::new(std::iter::empty())))
    }
}

#[test]
fn registering_a_format_leaves_existing_decoders_alone() {
    let mut registry = ParserRegistry::standard();
    assert!(registry.register(Arc::new(FixedDecoder)).is_none());
    assert_eq!(registry.formats().len(), 6);

    let decoded = registry
        .decode("fixed_width", Bytes::new())
        .expect("custom decoder");
    assert_eq!(decoded.capability(), Capability::TabularTimeseries);
    assert!(registry
        .decode("csv_long", fixture("basin42_2023.csv"))
        .is_ok());
}
