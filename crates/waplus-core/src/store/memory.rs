use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    CommitMode, CommitReport, CommitRequest, Generation, IndicatorQuery, JobStore, RecordStore,
    RowRejection,
};
use crate::error::StoreError;
use crate::jobs::{IngestionJob, JobUpdate};
use crate::types::{Checksum, IndicatorRecord, NaturalKey, RasterRecord, SourceFile};

#[derive(Default)]
struct RecordState {
    timeseries: BTreeMap<NaturalKey, IndicatorRecord>,
    rasters: BTreeMap<Checksum, RasterRecord>,
    generation: Generation,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<Uuid, IngestionJob>,
    by_checksum: HashMap<Checksum, Vec<Uuid>>,
    claims: HashMap<Checksum, (Uuid, Instant)>,
}

/// In-process store implementing both the record and job contracts. Used for
/// dry runs and tests; the knobs below simulate store behaviour that is hard
/// to provoke against a real database.
pub struct MemoryStore {
    records: RwLock<RecordState>,
    jobs: Mutex<JobTable>,
    partial_commit: bool,
    /// When set, rows must reference one of these basins.
    reference_basins: RwLock<Option<HashSet<String>>>,
    pending_conflicts: AtomicUsize,
    commit_delay: Mutex<Option<Duration>>,
    commit_calls: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(RecordState::default()),
            jobs: Mutex::new(JobTable::default()),
            partial_commit: true,
            reference_basins: RwLock::new(None),
            pending_conflicts: AtomicUsize::new(0),
            commit_delay: Mutex::new(None),
            commit_calls: AtomicU64::new(0),
        }
    }

    /// A store that can only commit a file as a whole.
    pub fn without_partial_commit() -> Self {
        Self {
            partial_commit: false,
            ..Self::new()
        }
    }

    pub fn with_reference_basins<I, S>(self, basins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.reference_basins.write() = Some(basins.into_iter().map(Into::into).collect());
        self
    }

    /// Deletes a basin from reference data, as an operator might mid-run.
    pub fn remove_basin(&self, basin_id: &str) {
        if let Some(basins) = self.reference_basins.write().as_mut() {
            basins.remove(basin_id);
        }
    }

    /// The next `count` commits fail with a transient conflict.
    pub fn fail_next_commits(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        *self.commit_delay.lock() = delay;
    }

    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn timeseries_len(&self) -> usize {
        self.records.read().timeseries.len()
    }

    pub fn all_timeseries(&self) -> Vec<IndicatorRecord> {
        self.records.read().timeseries.values().cloned().collect()
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn basin_known(reference: &Option<HashSet<String>>, basin_id: &str) -> bool {
        reference
            .as_ref()
            .map(|basins| basins.contains(basin_id))
            .unwrap_or(true)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn supports_partial_commit(&self) -> bool {
        self.partial_commit
    }

    async fn commit(&self, request: CommitRequest<'_>) -> Result<CommitReport, StoreError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.commit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_conflict() {
            return Err(StoreError::Conflict(format!(
                "injected conflict committing {}",
                request.checksum.short()
            )));
        }

        let reference = self.reference_basins.read().clone();
        let mut report = CommitReport::default();
        let mut accepted_series = Vec::with_capacity(request.timeseries.len());
        let mut accepted_rasters = Vec::with_capacity(request.rasters.len());

        for record in request.timeseries {
            if Self::basin_known(&reference, &record.basin_id) {
                accepted_series.push(record);
                continue;
            }
            let reason = format!("basin `{}` no longer exists", record.basin_id);
            if request.mode == CommitMode::AllOrNothing {
                return Err(StoreError::Constraint(reason));
            }
            report.rejected.push(RowRejection {
                record: format!(
                    "{}/{}@{}",
                    record.basin_id,
                    record.indicator_id,
                    record.timestamp.to_rfc3339()
                ),
                source_row: record.source_row,
                reason,
            });
        }
        for raster in request.rasters {
            match raster
                .coverage
                .iter()
                .find(|basin| !Self::basin_known(&reference, basin))
            {
                None => accepted_rasters.push(raster),
                Some(basin) => {
                    let reason = format!("coverage basin `{basin}` no longer exists");
                    if request.mode == CommitMode::AllOrNothing {
                        return Err(StoreError::Constraint(reason));
                    }
                    report.rejected.push(RowRejection {
                        record: raster.raster_id.clone(),
                        source_row: None,
                        reason,
                    });
                }
            }
        }

        let mut state = self.records.write();
        for record in accepted_series {
            let key = record.natural_key();
            let unchanged = state
                .timeseries
                .get(&key)
                .is_some_and(|existing| existing.same_content(record));
            if unchanged {
                report.unchanged += 1;
                continue;
            }
            state.timeseries.insert(key, record.clone());
            report.changed.insert(record.scope());
            report.written += 1;
        }
        for raster in accepted_rasters {
            if state.rasters.contains_key(&raster.checksum) {
                report.unchanged += 1;
                continue;
            }
            state.rasters.insert(raster.checksum.clone(), raster.clone());
            report.changed.extend(raster.scope());
            report.written += 1;
        }
        if !report.changed.is_empty() {
            state.generation += 1;
        }
        report.generation = state.generation;
        Ok(report)
    }

    async fn current_generation(&self) -> Result<Generation, StoreError> {
        Ok(self.records.read().generation)
    }

    async fn query_timeseries(&self, query: &IndicatorQuery) -> Result<Vec<IndicatorRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .timeseries
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect())
    }

    async fn query_rasters(&self, basins: &BTreeSet<String>) -> Result<Vec<RasterRecord>, StoreError> {
        let mut rasters: Vec<RasterRecord> = self
            .records
            .read()
            .rasters
            .values()
            .filter(|raster| basins.is_empty() || !raster.coverage.is_disjoint(basins))
            .cloned()
            .collect();
        rasters.sort_by(|a, b| {
            a.acquisition_date
                .cmp(&b.acquisition_date)
                .then_with(|| a.raster_id.cmp(&b.raster_id))
        });
        Ok(rasters)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, source: &SourceFile) -> Result<IngestionJob, StoreError> {
        let job = IngestionJob::discovered(source);
        let mut state = self.jobs.lock();
        state
            .by_checksum
            .entry(job.checksum.clone())
            .or_default()
            .push(job.job_id);
        state.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn transition(&self, job_id: Uuid, update: JobUpdate) -> Result<IngestionJob, StoreError> {
        let mut state = self.jobs.lock();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if !job.state.can_transition_to(update.state) {
            return Err(StoreError::IllegalTransition {
                job_id,
                from: job.state,
                to: update.state,
            });
        }
        job.apply(update);
        Ok(job.clone())
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<IngestionJob>, StoreError> {
        Ok(self.jobs.lock().jobs.get(&job_id).cloned())
    }

    async fn history(&self, checksum: &Checksum) -> Result<Vec<IngestionJob>, StoreError> {
        let state = self.jobs.lock();
        Ok(state
            .by_checksum
            .get(checksum)
            .into_iter()
            .flatten()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn try_claim(&self, checksum: &Checksum, owner: Uuid, lease: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.jobs.lock();
        let held_elsewhere = matches!(
            state.claims.get(checksum),
            Some((holder, expires)) if *holder != owner && *expires > now
        );
        if held_elsewhere {
            return Ok(false);
        }
        state.claims.insert(checksum.clone(), (owner, now + lease));
        Ok(true)
    }

    async fn release_claim(&self, checksum: &Checksum, owner: Uuid) -> Result<(), StoreError> {
        let mut state = self.jobs.lock();
        if matches!(state.claims.get(checksum), Some((holder, _)) if *holder == owner) {
            state.claims.remove(checksum);
        }
        Ok(())
    }
}
