use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{CommitMode, CommitRequest, Generation, RecordStore};
use crate::transform::{NormalizedBatch, RejectionRule, ValidationError};
use crate::types::{BasinIndicator, Checksum};

/// What to do when the store refuses some rows of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintPolicy {
    /// Skip the offending rows and commit the rest.
    #[default]
    RejectRows,
    /// Roll back the whole file and fail the job.
    RollbackFile,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOutcome {
    /// Pairs whose stored rows changed; the cache invalidation scope.
    pub touched: BTreeSet<BasinIndicator>,
    pub generation: Generation,
    pub written: u64,
    pub unchanged: u64,
    pub rejected: Vec<ValidationError>,
}

impl LoadOutcome {
    /// Records present in the store after the commit, whether or not they changed.
    pub fn loaded(&self) -> u64 {
        self.written + self.unchanged
    }
}

/// Sole writer of normalized records. One commit per file.
#[derive(Clone)]
pub struct Loader {
    store: Arc<dyn RecordStore>,
    policy: ConstraintPolicy,
}

impl Loader {
    pub fn new(store: Arc<dyn RecordStore>, requested: ConstraintPolicy) -> Self {
        let policy = match requested {
            ConstraintPolicy::RejectRows if !store.supports_partial_commit() => {
                warn!("store cannot commit partially; falling back to rollback_file");
                ConstraintPolicy::RollbackFile
            }
            other => other,
        };
        Self { store, policy }
    }

    pub fn policy(&self) -> ConstraintPolicy {
        self.policy
    }

    pub async fn load(
        &self,
        checksum: &Checksum,
        batch: &NormalizedBatch,
    ) -> Result<LoadOutcome, StoreError> {
        let mode = match self.policy {
            ConstraintPolicy::RejectRows => CommitMode::Partial,
            ConstraintPolicy::RollbackFile => CommitMode::AllOrNothing,
        };
        let report = self
            .store
            .commit(CommitRequest {
                checksum,
                timeseries: &batch.timeseries,
                rasters: &batch.rasters,
                mode,
            })
            .await?;

        debug!(
            checksum = %checksum.short(),
            written = report.written,
            unchanged = report.unchanged,
            rejected = report.rejected.len(),
            generation = report.generation,
            "commit finished"
        );

        let rejected = report
            .rejected
            .into_iter()
            .map(|row| {
                ValidationError::new(RejectionRule::StoreConstraint, row.source_row, row.record, row.reason)
            })
            .collect();

        Ok(LoadOutcome {
            touched: report.changed,
            generation: report.generation,
            written: report.written,
            unchanged: report.unchanged,
            rejected,
        })
    }
}
