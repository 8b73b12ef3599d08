// crates/waplus-core/src/types.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowercase hex BLAKE3 digest of a source file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    pub fn of(contents: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(contents);
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Wraps an already computed digest (e.g. one handed over by discovery).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub uri: String,
    pub format: String,
    pub checksum: Checksum,
    pub discovered_at: DateTime<Utc>,
}

impl SourceFile {
    pub fn new(uri: impl Into<String>, format: impl Into<String>, checksum: Checksum) -> Self {
        Self {
            uri: uri.into(),
            format: format.into(),
            checksum,
            discovered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basin {
    pub id: String,
    pub name: String,
    /// Extra exact-match keys (codes, legacy identifiers).
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub geometry: Option<geojson::Geometry>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Mean,
    Instantaneous,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Mean => "mean",
            Aggregation::Instantaneous => "instantaneous",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sum" => Some(Aggregation::Sum),
            "mean" => Some(Aggregation::Mean),
            "instantaneous" => Some(Aggregation::Instantaneous),
            _ => None,
        }
    }
}

/// Inclusive bounds, expressed in the indicator's canonical unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl fmt::Display for ValidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationOp {
    Sum,
    Difference,
    Product,
    Ratio,
}

impl DerivationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationOp::Sum => "sum",
            DerivationOp::Difference => "difference",
            DerivationOp::Product => "product",
            DerivationOp::Ratio => "ratio",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sum" => Some(DerivationOp::Sum),
            "difference" => Some(DerivationOp::Difference),
            "product" => Some(DerivationOp::Product),
            "ratio" => Some(DerivationOp::Ratio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Derivation {
    pub op: DerivationOp,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDefinition {
    pub id: String,
    pub name: String,
    /// Canonical unit every stored value is expressed in.
    pub unit: String,
    pub aggregation: Aggregation,
    pub valid_range: ValidRange,
    #[serde(default)]
    pub derivation: Option<Derivation>,
    #[serde(default)]
    pub temporal_resolution: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl IndicatorDefinition {
    pub fn is_derived(&self) -> bool {
        self.derivation.is_some()
    }
}

/// A (basin, indicator) pair; the unit of cache invalidation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BasinIndicator {
    pub basin_id: String,
    pub indicator_id: String,
}

impl BasinIndicator {
    pub fn new(basin_id: impl Into<String>, indicator_id: impl Into<String>) -> Self {
        Self {
            basin_id: basin_id.into(),
            indicator_id: indicator_id.into(),
        }
    }
}

impl fmt::Display for BasinIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.basin_id, self.indicator_id)
    }
}

/// Indicator id used in cache scopes for rasters that name no indicator.
pub const RASTER_LAYER_SCOPE: &str = "raster_layer";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalKey {
    pub basin_id: String,
    pub indicator_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_checksum: Checksum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub basin_id: String,
    pub indicator_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
    pub source_checksum: Checksum,
    pub derived: bool,
    #[serde(default)]
    pub quality_flag: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Data row in the source file; `None` for derived values.
    #[serde(default)]
    pub source_row: Option<u64>,
}

impl IndicatorRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            basin_id: self.basin_id.clone(),
            indicator_id: self.indicator_id.clone(),
            timestamp: self.timestamp,
            source_checksum: self.source_checksum.clone(),
        }
    }

    pub fn scope(&self) -> BasinIndicator {
        BasinIndicator::new(&self.basin_id, &self.indicator_id)
    }

    /// True when every non-key column matches, i.e. an upsert would be a no-op.
    pub fn same_content(&self, other: &IndicatorRecord) -> bool {
        self.value == other.value
            && self.unit == other.unit
            && self.derived == other.derived
            && self.quality_flag == other.quality_flag
            && self.comment == other.comment
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterRecord {
    pub raster_id: String,
    pub coverage: BTreeSet<String>,
    pub indicator_id: Option<String>,
    pub resolution: f64,
    pub acquisition_date: DateTime<Utc>,
    pub storage_path: String,
    pub checksum: Checksum,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl RasterRecord {
    pub fn scope(&self) -> BTreeSet<BasinIndicator> {
        let indicator = self.indicator_id.as_deref().unwrap_or(RASTER_LAYER_SCOPE);
        self.coverage
            .iter()
            .map(|basin| BasinIndicator::new(basin, indicator))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_hex() {
        let a = Checksum::of(b"basin,indicator\n");
        let b = Checksum::of(b"basin,indicator\n");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, Checksum::of(b"basin,indicator"));
        assert_eq!(Checksum::from_hex(a.as_str().to_ascii_uppercase()), a);
    }

    #[test]
    fn raster_scope_falls_back_to_layer_scope() {
        let raster = RasterRecord {
            raster_id: "r".into(),
            coverage: ["B1".to_string(), "B2".to_string()].into_iter().collect(),
            indicator_id: None,
            resolution: 30.0,
            acquisition_date: Utc::now(),
            storage_path: "r.tif".into(),
            checksum: Checksum::of(b"r"),
            crs: None,
            attributes: BTreeMap::new(),
        };
        let scope = raster.scope();
        assert!(scope.contains(&BasinIndicator::new("B1", RASTER_LAYER_SCOPE)));
        assert_eq!(scope.len(), 2);
    }
}
