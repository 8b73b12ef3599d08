use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use waplus_parser::DecodedFile;

use super::{Disposition, JobOutcome, PipelineConfig, PipelineContext, WorkItem};
use crate::error::{IngestError, Stage};
use crate::jobs::{IngestionJob, JobState, JobUpdate};
use crate::loader::Loader;
use crate::transform::{NormalizedBatch, RejectionReport, TransformOptions, Transformer};
use crate::types::{Checksum, SourceFile};

pub(super) async fn run(
    worker_id: usize,
    context: PipelineContext,
    config: Arc<PipelineConfig>,
    queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
) {
    let loader = Loader::new(context.records.clone(), config.constraint_policy);
    let runner = JobRunner {
        context,
        config,
        loader,
    };
    loop {
        let next = {
            let mut queue = queue.lock().await;
            queue.recv().await
        };
        let Some(item) = next else {
            debug!(worker_id, "queue closed; worker exiting");
            break;
        };

        let span = info_span!(
            "ingest_job",
            worker_id,
            job_id = %item.job.job_id,
            checksum = %item.job.checksum.short(),
            format = %item.source.format,
        );
        let outcome = runner
            .run(item.job, &item.source, &item.cancel)
            .instrument(span)
            .await;
        // The submitter may have stopped listening; the job row is the record.
        let _ = item.respond.send(outcome);
    }
}

/// How a successful attempt ended.
enum Finish {
    Loaded { loaded: u64, report: RejectionReport },
    /// Cancellation arrived while the commit was in flight; the data stands.
    CancelledAfterLoad { loaded: u64, report: RejectionReport },
    /// A previous job for the checksum already reached this terminal state.
    Replayed(IngestionJob),
}

struct JobRunner {
    context: PipelineContext,
    config: Arc<PipelineConfig>,
    loader: Loader,
}

impl JobRunner {
    async fn run(&self, job: IngestionJob, source: &SourceFile, cancel: &CancellationToken) -> JobOutcome {
        info!(uri = %source.uri, "job started");
        let mut state = job.state;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self.attempt(&job, source, attempt, &mut state, cancel).await;

            let error = match result {
                Ok(finish) => return self.complete(&job, attempt, finish).await,
                Err(error) => error,
            };

            let kind = error.kind();
            let disposition = self.config.classification.classify(kind);
            match disposition {
                Disposition::Retry if self.config.retry.should_retry(attempt) => {
                    let delay = self.config.retry.delay_for(attempt);
                    self.release(&job).await;
                    warn!(attempt, kind = kind.as_str(), error = %error, ?delay, "attempt failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let update = JobUpdate::to(JobState::Failed)
                                .attempt(attempt)
                                .error(IngestError::Cancelled.to_string());
                            return self.settle(&job, update).await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Disposition::Retry => {
                    error!(attempt, kind = kind.as_str(), error = %error, "retry budget exhausted");
                    let update = JobUpdate::to(JobState::Failed)
                        .attempt(attempt)
                        .error(format!("gave up after {attempt} attempts: {error}"));
                    return self.settle(&job, update).await;
                }
                Disposition::Quarantine => {
                    warn!(attempt, kind = kind.as_str(), error = %error, "job quarantined");
                    let update = JobUpdate::to(JobState::Quarantined)
                        .attempt(attempt)
                        .error(error.to_string());
                    return self.settle(&job, update).await;
                }
                Disposition::Fail => {
                    error!(attempt, kind = kind.as_str(), error = %error, "job failed");
                    let update = JobUpdate::to(JobState::Failed)
                        .attempt(attempt)
                        .error(error.to_string());
                    return self.settle(&job, update).await;
                }
            }
        }
    }

    async fn complete(&self, job: &IngestionJob, attempt: u32, finish: Finish) -> JobOutcome {
        let update = match finish {
            Finish::Loaded { loaded, report } => {
                info!(attempt, loaded, rejected = report.total, "job completed");
                JobUpdate::to(JobState::Completed).attempt(attempt).report(loaded, report)
            }
            Finish::CancelledAfterLoad { loaded, report } => {
                warn!(attempt, loaded, "job cancelled during load; committed data kept");
                JobUpdate::to(JobState::Failed)
                    .attempt(attempt)
                    .error(IngestError::Cancelled.to_string())
                    .report(loaded, report)
            }
            Finish::Replayed(prior) => {
                info!(prior_job = %prior.job_id, state = %prior.state, "checksum already processed");
                let mut update = JobUpdate::to(prior.state).attempt(attempt);
                if let Some(reason) = prior.last_error {
                    update = update.error(reason);
                }
                if let Some(report) = prior.rejection_report {
                    update = update.report(prior.records_loaded, report);
                }
                update
            }
        };
        self.settle(job, update).await
    }

    /// Records the terminal state, then releases the claim so a waiting
    /// duplicate sees the final state.
    async fn settle(&self, job: &IngestionJob, update: JobUpdate) -> JobOutcome {
        let outcome = self.finish(job, update).await;
        self.release(job).await;
        outcome
    }

    /// One pass under the checksum claim. The caller releases the claim.
    async fn attempt(
        &self,
        job: &IngestionJob,
        source: &SourceFile,
        attempt: u32,
        state: &mut JobState,
        cancel: &CancellationToken,
    ) -> Result<Finish, IngestError> {
        self.acquire(job, cancel).await?;

        let work = self.claimed(job, source, attempt, state, cancel);
        tokio::pin!(work);
        let heartbeat = self.heartbeat(job);
        tokio::pin!(heartbeat);
        tokio::select! {
            biased;
            result = &mut work => result,
            () = &mut heartbeat => work.await,
        }
    }

    /// Waits until this job holds the checksum claim. Waiting on another
    /// holder does not count as an attempt.
    async fn acquire(&self, job: &IngestionJob, cancel: &CancellationToken) -> Result<(), IngestError> {
        let mut waited = false;
        loop {
            if self.renew(job).await? {
                if waited {
                    debug!("checksum claim acquired after waiting");
                }
                return Ok(());
            }
            if !waited {
                info!("checksum claimed by another job; waiting");
                waited = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(self.config.claim_poll) => {}
            }
        }
    }

    async fn renew(&self, job: &IngestionJob) -> Result<bool, IngestError> {
        Ok(self
            .context
            .jobs
            .try_claim(&job.checksum, job.job_id, self.config.claim_lease)
            .await?)
    }

    /// Keeps extending the lease while a stage runs. Resolves only once the
    /// claim has been taken over; the next stage boundary then reports it.
    async fn heartbeat(&self, job: &IngestionJob) {
        let interval = (self.config.claim_lease / 3).max(Duration::from_millis(1));
        loop {
            tokio::time::sleep(interval).await;
            match self.renew(job).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("checksum claim lost while a stage was running");
                    return;
                }
                Err(err) => warn!(error = %err, "failed to renew checksum claim"),
            }
        }
    }

    async fn release(&self, job: &IngestionJob) {
        if let Err(err) = self.context.jobs.release_claim(&job.checksum, job.job_id).await {
            warn!(error = %err, "failed to release checksum claim; it will lapse with its lease");
        }
    }

    async fn claimed(
        &self,
        job: &IngestionJob,
        source: &SourceFile,
        attempt: u32,
        state: &mut JobState,
        cancel: &CancellationToken,
    ) -> Result<Finish, IngestError> {
        if *state == JobState::Discovered {
            if let Some(prior) = self.context.jobs.latest_terminal(&job.checksum).await? {
                if matches!(prior.state, JobState::Completed | JobState::Quarantined) {
                    return Ok(Finish::Replayed(prior));
                }
            }
        }

        self.enter(job, JobState::Parsing, attempt, state, cancel).await?;
        let decoded = self.parse(source).await?;

        self.enter(job, JobState::Transforming, attempt, state, cancel).await?;
        let batch = self.transform(source, decoded).await?;
        debug!(
            candidates = batch.candidate_count(),
            rejected = batch.report.total,
            "transform finished"
        );

        self.enter(job, JobState::Loading, attempt, state, cancel).await?;
        // Not raced against cancellation: a commit in flight always completes.
        let outcome = bounded(Stage::Loading, self.config.timeouts.load, self.loader.load(&job.checksum, &batch))
            .await??;
        self.context
            .cache
            .invalidate(&outcome.touched, outcome.generation)
            .await;

        let loaded = outcome.loaded();
        let NormalizedBatch { mut report, .. } = batch;
        for rejection in outcome.rejected {
            report.record(rejection);
        }

        if cancel.is_cancelled() {
            Ok(Finish::CancelledAfterLoad { loaded, report })
        } else {
            Ok(Finish::Loaded { loaded, report })
        }
    }

    async fn enter(
        &self,
        job: &IngestionJob,
        next: JobState,
        attempt: u32,
        state: &mut JobState,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        if !self.renew(job).await? {
            return Err(IngestError::ClaimConflict(job.checksum.clone()));
        }
        self.context
            .jobs
            .transition(job.job_id, JobUpdate::to(next).attempt(attempt))
            .await?;
        *state = next;
        debug!(stage = next.as_str(), attempt, "stage entered");
        Ok(())
    }

    /// Read, verify and decode share one parse budget.
    async fn parse(&self, source: &SourceFile) -> Result<DecodedFile, IngestError> {
        let stage = async {
            let bytes = self.context.reader.read(source).await?;

            let actual = Checksum::of(&bytes);
            if actual != source.checksum {
                return Err(IngestError::ChecksumMismatch {
                    expected: source.checksum.clone(),
                    actual,
                });
            }

            let registry = self.context.registry.clone();
            let format = source.format.clone();
            let decoded = tokio::task::spawn_blocking(move || registry.decode(&format, bytes))
                .await
                .map_err(|err| IngestError::Internal(format!("parse task failed: {err}")))??;
            Ok::<_, IngestError>(decoded)
        };
        bounded(Stage::Parsing, self.config.timeouts.parse, stage).await?
    }

    async fn transform(&self, source: &SourceFile, decoded: DecodedFile) -> Result<NormalizedBatch, IngestError> {
        let basins = self.context.basins.clone();
        let indicators = self.context.indicators.clone();
        let options = TransformOptions {
            sample_limit: self.config.sample_limit,
        };
        let source = source.clone();
        let task = tokio::task::spawn_blocking(move || {
            Transformer::new(basins.as_ref(), indicators.as_ref(), options).transform(&source, decoded)
        });
        bounded(Stage::Transforming, self.config.timeouts.transform, task)
            .await?
            .map_err(|err| IngestError::Internal(format!("transform task failed: {err}")))
    }

    async fn finish(&self, job: &IngestionJob, update: JobUpdate) -> JobOutcome {
        match self.context.jobs.transition(job.job_id, update.clone()).await {
            Ok(updated) => JobOutcome::from_job(&updated),
            Err(err) => {
                error!(error = %err, state = %update.state, "failed to record terminal job state");
                let mut local = job.clone();
                local.apply(update);
                JobOutcome::from_job(&local)
            }
        }
    }
}

async fn bounded<F, T>(stage: Stage, limit: Duration, future: F) -> Result<T, IngestError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| IngestError::Timeout { stage, after: limit })
}
