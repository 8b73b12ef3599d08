use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::jobs::{IngestionJob, JobStatus, JobUpdate};
use crate::types::{BasinIndicator, Checksum, IndicatorRecord, RasterRecord, SourceFile};

mod memory;
#[cfg(feature = "runtime")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "runtime")]
pub use postgres::PgStore;

/// Monotonic counter bumped by every commit that changed at least one row.
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Rows failing a constraint are skipped; the rest commit.
    Partial,
    /// Any constraint failure rolls the whole file back.
    AllOrNothing,
}

#[derive(Debug, Clone, Copy)]
pub struct CommitRequest<'a> {
    pub checksum: &'a Checksum,
    pub timeseries: &'a [IndicatorRecord],
    pub rasters: &'a [RasterRecord],
    pub mode: CommitMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowRejection {
    pub record: String,
    pub source_row: Option<u64>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub generation: Generation,
    /// Pairs whose stored rows actually changed.
    pub changed: BTreeSet<BasinIndicator>,
    pub written: u64,
    pub unchanged: u64,
    pub rejected: Vec<RowRejection>,
}

/// Read-side filter. Empty sets match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndicatorQuery {
    pub basins: BTreeSet<String>,
    pub indicators: BTreeSet<String>,
    pub window: Option<TimeWindow>,
}

/// Half-open `[start, end)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl IndicatorQuery {
    pub fn new<B, I>(basins: B, indicators: I) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            basins: basins.into_iter().map(Into::into).collect(),
            indicators: indicators.into_iter().map(Into::into).collect(),
            window: None,
        }
    }

    pub fn within(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.window = Some(TimeWindow { start, end });
        self
    }

    pub fn matches(&self, record: &IndicatorRecord) -> bool {
        (self.basins.is_empty() || self.basins.contains(&record.basin_id))
            && (self.indicators.is_empty() || self.indicators.contains(&record.indicator_id))
            && self
                .window
                .map(|w| record.timestamp >= w.start && record.timestamp < w.end)
                .unwrap_or(true)
    }
}

/// Authoritative store for normalized records. Only the loader writes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn supports_partial_commit(&self) -> bool;

    /// Upserts one file's candidates atomically.
    async fn commit(&self, request: CommitRequest<'_>) -> Result<CommitReport, StoreError>;

    async fn current_generation(&self) -> Result<Generation, StoreError>;

    async fn query_timeseries(&self, query: &IndicatorQuery) -> Result<Vec<IndicatorRecord>, StoreError>;

    async fn query_rasters(&self, basins: &BTreeSet<String>) -> Result<Vec<RasterRecord>, StoreError>;
}

/// Audit trail of ingestion jobs plus the per-checksum claim table.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, source: &SourceFile) -> Result<IngestionJob, StoreError>;

    /// Persists a state change. Changes out of a terminal state are refused.
    async fn transition(&self, job_id: Uuid, update: JobUpdate) -> Result<IngestionJob, StoreError>;

    async fn job(&self, job_id: Uuid) -> Result<Option<IngestionJob>, StoreError>;

    /// Every job ever recorded for the checksum, oldest first.
    async fn history(&self, checksum: &Checksum) -> Result<Vec<IngestionJob>, StoreError>;

    async fn try_claim(&self, checksum: &Checksum, owner: Uuid, lease: Duration) -> Result<bool, StoreError>;

    async fn release_claim(&self, checksum: &Checksum, owner: Uuid) -> Result<(), StoreError>;

    /// Most recent job for the checksum that reached a terminal state.
    async fn latest_terminal(&self, checksum: &Checksum) -> Result<Option<IngestionJob>, StoreError> {
        Ok(self
            .history(checksum)
            .await?
            .into_iter()
            .rev()
            .find(|job| job.state.is_terminal()))
    }

    async fn status(&self, checksum: &Checksum) -> Result<Option<JobStatus>, StoreError> {
        Ok(self
            .history(checksum)
            .await?
            .last()
            .map(IngestionJob::status))
    }
}
