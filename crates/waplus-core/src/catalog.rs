use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::derived::DerivationPlan;
use crate::error::CatalogError;
use crate::types::{Aggregation, Basin, Derivation, IndicatorDefinition, ValidRange};

/// Result of an exact-key lookup against reference data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyMatch<'a, T> {
    Unique(&'a T),
    Missing,
    /// More than one catalog entry answers to the key.
    Ambiguous(usize),
}

pub trait BasinCatalog: Send + Sync {
    fn basin_by_key(&self, key: &str) -> KeyMatch<'_, Basin>;
}

pub trait IndicatorCatalog: Send + Sync {
    fn indicator_by_key(&self, key: &str) -> KeyMatch<'_, IndicatorDefinition>;
    fn derivation_plan(&self) -> &DerivationPlan;
}

/// In-process catalog over basin and indicator reference data. Basins answer
/// to their id and each alias; a key claimed by two basins is ambiguous.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCatalog {
    basins: Vec<Basin>,
    indicators: Vec<IndicatorDefinition>,
    basin_keys: HashMap<String, Vec<usize>>,
    indicator_keys: HashMap<String, Vec<usize>>,
    plan: DerivationPlan,
}

impl ReferenceCatalog {
    pub fn new(
        basins: Vec<Basin>,
        indicators: Vec<IndicatorDefinition>,
    ) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for indicator in &indicators {
            if !seen.insert(indicator.id.as_str()) {
                return Err(CatalogError::DuplicateIndicator(indicator.id.clone()));
            }
        }
        for indicator in &indicators {
            let range = indicator.valid_range;
            if !(range.min.is_finite() && range.max.is_finite() && range.min <= range.max) {
                return Err(CatalogError::InvalidRange {
                    indicator: indicator.id.clone(),
                    min: range.min,
                    max: range.max,
                });
            }
        }
        let plan = DerivationPlan::build(&indicators)?;

        let mut basin_keys: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, basin) in basins.iter().enumerate() {
            let mut keys: Vec<&str> = std::iter::once(basin.id.as_str())
                .chain(basin.aliases.iter().map(String::as_str))
                .collect();
            keys.sort_unstable();
            keys.dedup();
            for key in keys {
                basin_keys.entry(key.to_string()).or_default().push(index);
            }
        }

        let mut indicator_keys: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, indicator) in indicators.iter().enumerate() {
            indicator_keys
                .entry(indicator.id.clone())
                .or_default()
                .push(index);
        }

        Ok(Self {
            basins,
            indicators,
            basin_keys,
            indicator_keys,
            plan,
        })
    }

    pub fn from_document(document: CatalogDocument) -> Result<Self, CatalogError> {
        let basins = document
            .basin
            .into_iter()
            .map(BasinEntry::into_basin)
            .collect::<Result<Vec<_>, _>>()?;
        let indicators = document
            .indicator
            .into_iter()
            .map(IndicatorEntry::into_definition)
            .collect();
        Self::new(basins, indicators)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CatalogError> {
        Self::from_document(toml::from_str(content)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn basins(&self) -> &[Basin] {
        &self.basins
    }

    pub fn indicators(&self) -> &[IndicatorDefinition] {
        &self.indicators
    }

    fn lookup<'a, T>(items: &'a [T], keys: &HashMap<String, Vec<usize>>, key: &str) -> KeyMatch<'a, T> {
        match keys.get(key).map(Vec::as_slice) {
            None | Some([]) => KeyMatch::Missing,
            Some([index]) => KeyMatch::Unique(&items[*index]),
            Some(many) => KeyMatch::Ambiguous(many.len()),
        }
    }
}

impl BasinCatalog for ReferenceCatalog {
    fn basin_by_key(&self, key: &str) -> KeyMatch<'_, Basin> {
        Self::lookup(&self.basins, &self.basin_keys, key)
    }
}

impl IndicatorCatalog for ReferenceCatalog {
    fn indicator_by_key(&self, key: &str) -> KeyMatch<'_, IndicatorDefinition> {
        Self::lookup(&self.indicators, &self.indicator_keys, key)
    }

    fn derivation_plan(&self) -> &DerivationPlan {
        &self.plan
    }
}

/// On-disk catalog layout (`[[basin]]` and `[[indicator]]` tables).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub basin: Vec<BasinEntry>,
    #[serde(default)]
    pub indicator: Vec<IndicatorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasinEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// GeoJSON geometry object, as a JSON string.
    #[serde(default)]
    pub geometry: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl BasinEntry {
    fn into_basin(self) -> Result<Basin, CatalogError> {
        let geometry = self
            .geometry
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<geojson::Geometry>(raw).map_err(|err| {
                    CatalogError::Geometry {
                        basin: self.id.clone(),
                        message: err.to_string(),
                    }
                })
            })
            .transpose()?;
        Ok(Basin {
            id: self.id,
            name: self.name,
            aliases: self.aliases,
            geometry,
            attributes: self.attributes,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
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

impl IndicatorEntry {
    fn into_definition(self) -> IndicatorDefinition {
        IndicatorDefinition {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            unit: self.unit,
            aggregation: self.aggregation,
            valid_range: self.valid_range,
            derivation: self.derivation,
            temporal_resolution: self.temporal_resolution,
            category: self.category,
        }
    }
}
