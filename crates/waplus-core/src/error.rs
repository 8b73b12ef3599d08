// crates/waplus-core/src/error.rs

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use waplus_parser::ParseError;

use crate::jobs::JobState;
use crate::types::Checksum;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Transient contention or lost connectivity; safe to retry.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// Referential or check constraint violated by the batch.
    #[error("store constraint violated: {0}")]
    Constraint(String),

    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cache unavailable: {0}")]
pub struct CacheUnavailable(pub String);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source `{uri}` not found")]
    NotFound { uri: String },

    #[error("failed to read source `{uri}`: {source}")]
    Io {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid discovery pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },

    #[error("cannot infer a format tag for `{uri}`")]
    UnknownFormat { uri: String },
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog TOML is invalid: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("basin `{basin}` has invalid GeoJSON geometry: {message}")]
    Geometry { basin: String, message: String },

    #[error("indicator `{0}` is defined more than once")]
    DuplicateIndicator(String),

    #[error("indicator `{indicator}` has an invalid valid_range {min}..{max}")]
    InvalidRange { indicator: String, min: f64, max: f64 },

    #[error("derived indicator `{indicator}` references unknown input `{input}`")]
    UnknownDerivationInput { indicator: String, input: String },

    #[error("derived indicator `{indicator}` is malformed: {message}")]
    InvalidDerivation { indicator: String, message: String },

    #[error("derived indicators form a cycle through {0:?}")]
    DerivationCycle(Vec<String>),

    #[error("catalog backend error: {0}")]
    Backend(String),
}

/// Pipeline stage, used in timeout reporting and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parsing,
    Transforming,
    Loading,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parsing => "parsing",
            Stage::Transforming => "transforming",
            Stage::Loading => "loading",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse failure classes the orchestrator maps to a disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Parse,
    StageTimeout,
    SourceIo,
    StoreConflict,
    ClaimConflict,
    StoreConstraint,
    ChecksumMismatch,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Parse => "parse",
            FailureKind::StageTimeout => "stage_timeout",
            FailureKind::SourceIo => "source_io",
            FailureKind::StoreConflict => "store_conflict",
            FailureKind::ClaimConflict => "claim_conflict",
            FailureKind::StoreConstraint => "store_constraint",
            FailureKind::ChecksumMismatch => "checksum_mismatch",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("content checksum {actual} does not match discovered checksum {expected}")]
    ChecksumMismatch { expected: Checksum, actual: Checksum },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("checksum {0} is claimed by another worker")]
    ClaimConflict(Checksum),

    #[error("{stage} stage timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::Parse(_) => FailureKind::Parse,
            IngestError::Source(SourceError::UnknownFormat { .. }) => FailureKind::Parse,
            IngestError::Source(_) => FailureKind::SourceIo,
            IngestError::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            IngestError::Store(StoreError::Conflict(_)) => FailureKind::StoreConflict,
            IngestError::Store(StoreError::Constraint(_)) => FailureKind::StoreConstraint,
            IngestError::Store(_) => FailureKind::Internal,
            IngestError::ClaimConflict(_) => FailureKind::ClaimConflict,
            IngestError::Timeout { .. } => FailureKind::StageTimeout,
            IngestError::Cancelled => FailureKind::Cancelled,
            IngestError::Internal(_) => FailureKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
