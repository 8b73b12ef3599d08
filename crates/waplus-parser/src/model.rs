use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TabularTimeseries,
    RasterMetadata,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::TabularTimeseries => "tabular_timeseries",
            Capability::RasterMetadata => "raster_metadata",
        }
    }
}

/// One observation as it appeared in the source, before any catalog lookup or
/// unit handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub row: u64,
    pub line: u64,
    pub byte_offset: u64,
    pub basin_key: String,
    pub indicator_key: String,
    pub timestamp: DateTime<Utc>,
    /// `None` when the cell held a missing-value token.
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub quality_flag: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterDescriptor {
    pub raster_id: String,
    pub coverage: Vec<String>,
    /// Ground sampling distance in metres.
    pub resolution: f64,
    pub acquisition_date: DateTime<Utc>,
    pub storage_path: String,
    pub indicator: Option<String>,
    pub crs: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

pub type ObservationStream = Box<dyn Iterator<Item = Result<RawObservation, RowError>> + Send>;

pub enum DecodedFile {
    Timeseries(ObservationStream),
    Raster(RasterDescriptor),
}

impl DecodedFile {
    pub fn capability(&self) -> Capability {
        match self {
            DecodedFile::Timeseries(_) => Capability::TabularTimeseries,
            DecodedFile::Raster(_) => Capability::RasterMetadata,
        }
    }
}

impl fmt::Debug for DecodedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedFile::Timeseries(_) => f.write_str("DecodedFile::Timeseries(..)"),
            DecodedFile::Raster(descriptor) => f
                .debug_tuple("DecodedFile::Raster")
                .field(&descriptor.raster_id)
                .finish(),
        }
    }
}
