use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use waplus_parser::{DecodedFile, ObservationStream, RasterDescriptor, RawObservation};

use crate::catalog::{BasinCatalog, IndicatorCatalog, KeyMatch};
use crate::derived::DerivedValue;
use crate::types::{IndicatorDefinition, IndicatorRecord, RasterRecord, SourceFile};
use crate::units::{self, UnitError};

pub const DEFAULT_SAMPLE_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionRule {
    MalformedRow,
    UnknownBasin,
    AmbiguousBasin,
    UnknownIndicator,
    DerivedIndicatorSupplied,
    MissingValue,
    UnconvertibleUnit,
    OutOfRange,
    DuplicateKey,
    UndefinedDerivation,
    InvalidRaster,
    StoreConstraint,
}

impl RejectionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionRule::MalformedRow => "malformed_row",
            RejectionRule::UnknownBasin => "unknown_basin",
            RejectionRule::AmbiguousBasin => "ambiguous_basin",
            RejectionRule::UnknownIndicator => "unknown_indicator",
            RejectionRule::DerivedIndicatorSupplied => "derived_indicator_supplied",
            RejectionRule::MissingValue => "missing_value",
            RejectionRule::UnconvertibleUnit => "unconvertible_unit",
            RejectionRule::OutOfRange => "out_of_range",
            RejectionRule::DuplicateKey => "duplicate_key",
            RejectionRule::UndefinedDerivation => "undefined_derivation",
            RejectionRule::InvalidRaster => "invalid_raster",
            RejectionRule::StoreConstraint => "store_constraint",
        }
    }
}

impl fmt::Display for RejectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record rejected by a named rule. `row` is the 1-based data row of the
/// source file when the record came from one.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{rule} ({}): {message}", location(.row))]
pub struct ValidationError {
    pub rule: RejectionRule,
    pub row: Option<u64>,
    pub record: String,
    pub message: String,
}

fn location(row: &Option<u64>) -> String {
    match row {
        Some(row) => format!("row {row}"),
        None => "derived".to_string(),
    }
}

impl ValidationError {
    pub fn new(
        rule: RejectionRule,
        row: Option<u64>,
        record: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule,
            row,
            record: record.into(),
            message: message.into(),
        }
    }
}

/// Per-file rejection summary: every rejection is counted, the first
/// `sample_limit` are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionReport {
    pub total: u64,
    pub by_rule: BTreeMap<RejectionRule, u64>,
    pub samples: Vec<ValidationError>,
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
}

fn default_sample_limit() -> usize {
    DEFAULT_SAMPLE_LIMIT
}

impl Default for RejectionReport {
    fn default() -> Self {
        Self::with_sample_limit(DEFAULT_SAMPLE_LIMIT)
    }
}

impl RejectionReport {
    pub fn with_sample_limit(sample_limit: usize) -> Self {
        Self {
            total: 0,
            by_rule: BTreeMap::new(),
            samples: Vec::new(),
            sample_limit,
        }
    }

    pub fn record(&mut self, error: ValidationError) {
        self.total += 1;
        *self.by_rule.entry(error.rule).or_default() += 1;
        if self.samples.len() < self.sample_limit {
            self.samples.push(error);
        }
    }

    pub fn count(&self, rule: RejectionRule) -> u64 {
        self.by_rule.get(&rule).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransformOptions {
    pub sample_limit: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            sample_limit: DEFAULT_SAMPLE_LIMIT,
        }
    }
}

/// Normalized candidates for one source file. Nothing here has been written.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub timeseries: Vec<IndicatorRecord>,
    pub rasters: Vec<RasterRecord>,
    pub report: RejectionReport,
}

impl NormalizedBatch {
    pub fn candidate_count(&self) -> usize {
        self.timeseries.len() + self.rasters.len()
    }
}

pub struct Transformer<'a> {
    basins: &'a dyn BasinCatalog,
    indicators: &'a dyn IndicatorCatalog,
    options: TransformOptions,
}

impl<'a> Transformer<'a> {
    pub fn new(
        basins: &'a dyn BasinCatalog,
        indicators: &'a dyn IndicatorCatalog,
        options: TransformOptions,
    ) -> Self {
        Self {
            basins,
            indicators,
            options,
        }
    }

    pub fn transform(&self, source: &SourceFile, decoded: DecodedFile) -> NormalizedBatch {
        match decoded {
            DecodedFile::Timeseries(stream) => self.transform_timeseries(source, stream),
            DecodedFile::Raster(descriptor) => self.transform_raster(source, descriptor),
        }
    }

    fn transform_timeseries(&self, source: &SourceFile, stream: ObservationStream) -> NormalizedBatch {
        let mut report = RejectionReport::with_sample_limit(self.options.sample_limit);
        let mut records = Vec::new();
        let mut seen: HashSet<(String, String, DateTime<Utc>)> = HashSet::new();

        for item in stream {
            let observation = match item {
                Ok(observation) => observation,
                Err(row_error) => {
                    report.record(ValidationError::new(
                        RejectionRule::MalformedRow,
                        Some(row_error.row),
                        format!("line {}", row_error.line),
                        row_error.message,
                    ));
                    continue;
                }
            };

            match self.normalize(source, observation) {
                Ok(record) => {
                    let key = (
                        record.basin_id.clone(),
                        record.indicator_id.clone(),
                        record.timestamp,
                    );
                    if seen.insert(key) {
                        records.push(record);
                    } else {
                        report.record(ValidationError::new(
                            RejectionRule::DuplicateKey,
                            record.source_row,
                            describe_record(&record),
                            "basin, indicator and timestamp already supplied earlier in this file",
                        ));
                    }
                }
                Err(rejection) => report.record(rejection),
            }
        }

        let derived = self.derive(source, &records, &mut report);
        debug!(
            checksum = %source.checksum,
            base = records.len(),
            derived = derived.len(),
            rejected = report.total,
            "normalized timeseries"
        );
        records.extend(derived);

        NormalizedBatch {
            timeseries: records,
            rasters: Vec::new(),
            report,
        }
    }

    fn normalize(
        &self,
        source: &SourceFile,
        observation: RawObservation,
    ) -> Result<IndicatorRecord, ValidationError> {
        let row = Some(observation.row);
        let describe = || {
            format!(
                "{}/{}@{}",
                observation.basin_key,
                observation.indicator_key,
                observation.timestamp.to_rfc3339()
            )
        };

        let basin = match self.basins.basin_by_key(&observation.basin_key) {
            KeyMatch::Unique(basin) => basin,
            KeyMatch::Missing => {
                return Err(ValidationError::new(
                    RejectionRule::UnknownBasin,
                    row,
                    describe(),
                    format!("basin `{}` is not in the catalog", observation.basin_key),
                ))
            }
            KeyMatch::Ambiguous(count) => {
                return Err(ValidationError::new(
                    RejectionRule::AmbiguousBasin,
                    row,
                    describe(),
                    format!(
                        "basin key `{}` matches {count} catalog entries",
                        observation.basin_key
                    ),
                ))
            }
        };

        let indicator = match self.indicators.indicator_by_key(&observation.indicator_key) {
            KeyMatch::Unique(indicator) => indicator,
            KeyMatch::Missing | KeyMatch::Ambiguous(_) => {
                return Err(ValidationError::new(
                    RejectionRule::UnknownIndicator,
                    row,
                    describe(),
                    format!(
                        "indicator `{}` is not uniquely defined in the catalog",
                        observation.indicator_key
                    ),
                ))
            }
        };

        if indicator.is_derived() {
            return Err(ValidationError::new(
                RejectionRule::DerivedIndicatorSupplied,
                row,
                describe(),
                format!("`{}` is computed during ingestion", indicator.id),
            ));
        }

        let Some(raw_value) = observation.value else {
            return Err(ValidationError::new(
                RejectionRule::MissingValue,
                row,
                describe(),
                "value is missing",
            ));
        };

        // An absent unit means the value is already in the canonical unit.
        let source_unit = observation.unit.as_deref().unwrap_or(&indicator.unit);
        let value = units::convert(raw_value, source_unit, &indicator.unit).map_err(|err| {
            let message = match err {
                UnitError::Unknown(unit) => format!("unknown unit `{unit}`"),
                other => other.to_string(),
            };
            ValidationError::new(RejectionRule::UnconvertibleUnit, row, describe(), message)
        })?;

        check_range(indicator, value).map_err(|message| {
            ValidationError::new(RejectionRule::OutOfRange, row, describe(), message)
        })?;

        Ok(IndicatorRecord {
            basin_id: basin.id.clone(),
            indicator_id: indicator.id.clone(),
            timestamp: observation.timestamp,
            value,
            unit: indicator.unit.clone(),
            source_checksum: source.checksum.clone(),
            derived: false,
            quality_flag: observation.quality_flag,
            comment: observation.comment,
            source_row: Some(observation.row),
        })
    }

    /// Computes derived indicators per (basin, timestamp) over the whole set of
    /// accepted base records, so the result does not depend on row order.
    fn derive(
        &self,
        source: &SourceFile,
        base: &[IndicatorRecord],
        report: &mut RejectionReport,
    ) -> Vec<IndicatorRecord> {
        let plan = self.indicators.derivation_plan();
        if plan.is_empty() {
            return Vec::new();
        }

        let mut groups: BTreeMap<(&str, DateTime<Utc>), BTreeMap<String, f64>> = BTreeMap::new();
        for record in base {
            groups
                .entry((record.basin_id.as_str(), record.timestamp))
                .or_default()
                .insert(record.indicator_id.clone(), record.value);
        }

        let mut derived = Vec::new();
        for ((basin_id, timestamp), values) in groups {
            for (indicator_id, outcome) in plan.evaluate(&values) {
                let record_label = format!("{basin_id}/{indicator_id}@{}", timestamp.to_rfc3339());
                let definition = match self.indicators.indicator_by_key(&indicator_id) {
                    KeyMatch::Unique(definition) => definition,
                    KeyMatch::Missing => {
                        report.record(ValidationError::new(
                            RejectionRule::UnknownIndicator,
                            None,
                            record_label,
                            format!("derived indicator `{indicator_id}` is not in the catalog"),
                        ));
                        continue;
                    }
                    KeyMatch::Ambiguous(count) => {
                        report.record(ValidationError::new(
                            RejectionRule::UnknownIndicator,
                            None,
                            record_label,
                            format!("derived indicator `{indicator_id}` matches {count} catalog entries"),
                        ));
                        continue;
                    }
                };
                let value = match outcome {
                    DerivedValue::Value(value) => value,
                    DerivedValue::Undefined(message) => {
                        report.record(ValidationError::new(
                            RejectionRule::UndefinedDerivation,
                            None,
                            record_label,
                            message,
                        ));
                        continue;
                    }
                };
                if let Err(message) = check_range(definition, value) {
                    report.record(ValidationError::new(
                        RejectionRule::OutOfRange,
                        None,
                        record_label,
                        message,
                    ));
                    continue;
                }
                derived.push(IndicatorRecord {
                    basin_id: basin_id.to_string(),
                    indicator_id,
                    timestamp,
                    value,
                    unit: definition.unit.clone(),
                    source_checksum: source.checksum.clone(),
                    derived: true,
                    quality_flag: None,
                    comment: None,
                    source_row: None,
                });
            }
        }
        derived
    }

    fn transform_raster(&self, source: &SourceFile, descriptor: RasterDescriptor) -> NormalizedBatch {
        let mut report = RejectionReport::with_sample_limit(self.options.sample_limit);
        let label = descriptor.raster_id.clone();
        match self.validate_raster(source, descriptor) {
            Ok(record) => NormalizedBatch {
                timeseries: Vec::new(),
                rasters: vec![record],
                report,
            },
            Err((rule, message)) => {
                report.record(ValidationError::new(rule, None, label, message));
                NormalizedBatch {
                    timeseries: Vec::new(),
                    rasters: Vec::new(),
                    report,
                }
            }
        }
    }

    fn validate_raster(
        &self,
        source: &SourceFile,
        descriptor: RasterDescriptor,
    ) -> Result<RasterRecord, (RejectionRule, String)> {
        let mut coverage = BTreeSet::new();
        for key in &descriptor.coverage {
            match self.basins.basin_by_key(key) {
                KeyMatch::Unique(basin) => {
                    coverage.insert(basin.id.clone());
                }
                KeyMatch::Missing => {
                    return Err((
                        RejectionRule::UnknownBasin,
                        format!("coverage basin `{key}` is not in the catalog"),
                    ))
                }
                KeyMatch::Ambiguous(count) => {
                    return Err((
                        RejectionRule::AmbiguousBasin,
                        format!("coverage basin `{key}` matches {count} catalog entries"),
                    ))
                }
            }
        }

        let indicator_id = match descriptor.indicator.as_deref() {
            None => None,
            Some(key) => match self.indicators.indicator_by_key(key) {
                KeyMatch::Unique(indicator) => Some(indicator.id.clone()),
                _ => {
                    return Err((
                        RejectionRule::UnknownIndicator,
                        format!("indicator `{key}` is not uniquely defined in the catalog"),
                    ))
                }
            },
        };

        if !(descriptor.resolution.is_finite() && descriptor.resolution > 0.0) {
            return Err((
                RejectionRule::InvalidRaster,
                format!("resolution {} must be positive", descriptor.resolution),
            ));
        }

        Ok(RasterRecord {
            raster_id: descriptor.raster_id,
            coverage,
            indicator_id,
            resolution: descriptor.resolution,
            acquisition_date: descriptor.acquisition_date,
            storage_path: descriptor.storage_path,
            checksum: source.checksum.clone(),
            crs: descriptor.crs,
            attributes: descriptor.attributes,
        })
    }
}

fn check_range(indicator: &IndicatorDefinition, value: f64) -> Result<(), String> {
    if indicator.valid_range.contains(value) {
        Ok(())
    } else {
        Err(format!(
            "value {value} {} outside valid range {} for `{}`",
            indicator.unit, indicator.valid_range, indicator.id
        ))
    }
}

fn describe_record(record: &IndicatorRecord) -> String {
    format!(
        "{}/{}@{}",
        record.basin_id,
        record.indicator_id,
        record.timestamp.to_rfc3339()
    )
}
