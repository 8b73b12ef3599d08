//! Worker pool driving each source file through parse, transform and load.
//!
//! Submission creates the job row and then blocks on a bounded queue. A fixed
//! set of workers drains the queue; every file runs to a terminal state on a
//! single worker. The orchestrator is the only component that moves job state.

mod retry;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use waplus_parser::ParserRegistry;

pub use retry::{
    ClassificationTable, Disposition, RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER,
};

use crate::cache::CacheManager;
use crate::catalog::{BasinCatalog, IndicatorCatalog, ReferenceCatalog};
use crate::discovery::SourceReader;
use crate::error::IngestError;
use crate::jobs::{IngestionJob, JobState};
use crate::loader::ConstraintPolicy;
use crate::store::{JobStore, RecordStore};
use crate::transform::{RejectionReport, DEFAULT_SAMPLE_LIMIT};
use crate::types::{Checksum, SourceFile};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
/// Outlasts the sum of the default stage timeouts; workers also renew it.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(900);
pub const DEFAULT_CLAIM_POLL: Duration = Duration::from_millis(250);
pub const DEFAULT_PARSE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_TRANSFORM_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageTimeouts {
    pub parse: Duration,
    pub transform: Duration,
    pub load: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            parse: DEFAULT_PARSE_TIMEOUT,
            transform: DEFAULT_TRANSFORM_TIMEOUT,
            load: DEFAULT_LOAD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub claim_lease: Duration,
    /// How often a duplicate checks whether the claim holder has finished.
    pub claim_poll: Duration,
    pub timeouts: StageTimeouts,
    pub retry: RetryPolicy,
    pub classification: ClassificationTable,
    pub constraint_policy: ConstraintPolicy,
    pub sample_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            claim_lease: DEFAULT_CLAIM_LEASE,
            claim_poll: DEFAULT_CLAIM_POLL,
            timeouts: StageTimeouts::default(),
            retry: RetryPolicy::default(),
            classification: ClassificationTable::default(),
            constraint_policy: ConstraintPolicy::default(),
            sample_limit: DEFAULT_SAMPLE_LIMIT,
        }
    }
}

/// Handles every stage needs, passed explicitly instead of living in globals.
#[derive(Clone)]
pub struct PipelineContext {
    pub registry: Arc<ParserRegistry>,
    pub basins: Arc<dyn BasinCatalog>,
    pub indicators: Arc<dyn IndicatorCatalog>,
    pub records: Arc<dyn RecordStore>,
    pub jobs: Arc<dyn JobStore>,
    pub cache: Arc<CacheManager>,
    pub reader: Arc<dyn SourceReader>,
}

impl PipelineContext {
    /// Wires a context whose record and job stores are the same object.
    pub fn new<S>(
        registry: ParserRegistry,
        catalog: Arc<ReferenceCatalog>,
        store: Arc<S>,
        cache: Arc<CacheManager>,
        reader: Arc<dyn SourceReader>,
    ) -> Self
    where
        S: RecordStore + JobStore + 'static,
    {
        Self {
            registry: Arc::new(registry),
            basins: catalog.clone(),
            indicators: catalog,
            records: store.clone(),
            jobs: store,
            cache,
            reader,
        }
    }
}

/// Final word on one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub checksum: Checksum,
    pub uri: String,
    pub state: JobState,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub loaded: u64,
    pub rejected: u64,
    pub report: Option<RejectionReport>,
}

impl JobOutcome {
    fn from_job(job: &IngestionJob) -> Self {
        Self {
            job_id: job.job_id,
            checksum: job.checksum.clone(),
            uri: job.uri.clone(),
            state: job.state,
            last_error: job.last_error.clone(),
            attempts: job.attempt_count,
            loaded: job.records_loaded,
            rejected: job.records_rejected,
            report: job.rejection_report.clone(),
        }
    }
}

/// Caller's side of a submitted job.
pub struct JobTicket {
    pub job_id: Uuid,
    pub checksum: Checksum,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    /// Requests cooperative cancellation. Takes effect at the next stage
    /// boundary; an in-flight commit is allowed to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<JobOutcome, IngestError> {
        self.outcome
            .await
            .map_err(|_| IngestError::Internal(format!("worker dropped job {}", self.job_id)))
    }
}

pub(crate) struct WorkItem {
    job: IngestionJob,
    source: SourceFile,
    cancel: CancellationToken,
    respond: oneshot::Sender<JobOutcome>,
}

pub struct Orchestrator {
    context: PipelineContext,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(context: PipelineContext, config: PipelineConfig) -> Self {
        Self { context, config }
    }

    pub fn start(self) -> PipelineHandle {
        let workers = self.config.workers.max(1);
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let config = Arc::new(self.config);
        let shutdown = CancellationToken::new();

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            tasks.spawn(worker::run(
                worker_id,
                self.context.clone(),
                config.clone(),
                receiver.clone(),
            ));
        }
        info!(workers, queue_capacity = config.queue_capacity, "pipeline started");

        PipelineHandle {
            sender: Some(sender),
            jobs: self.context.jobs.clone(),
            shutdown,
            workers: tasks,
        }
    }
}

pub struct PipelineHandle {
    sender: Option<mpsc::Sender<WorkItem>>,
    jobs: Arc<dyn JobStore>,
    shutdown: CancellationToken,
    workers: JoinSet<()>,
}

impl PipelineHandle {
    /// Records the discovery and queues it, waiting while the queue is full.
    pub async fn submit(&self, source: SourceFile) -> Result<JobTicket, IngestError> {
        let sender = self.sender()?;
        let permit = sender
            .reserve()
            .await
            .map_err(|_| IngestError::Internal("pipeline queue is closed".to_string()))?;
        let (item, ticket) = self.prepare(source).await?;
        permit.send(item);
        Ok(ticket)
    }

    /// Like [`submit`](Self::submit) but returns `None` instead of waiting
    /// when the queue is full. No job is recorded in that case.
    pub async fn try_submit(&self, source: SourceFile) -> Result<Option<JobTicket>, IngestError> {
        let sender = self.sender()?;
        let permit = match sender.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => return Ok(None),
            Err(mpsc::error::TrySendError::Closed(())) => {
                return Err(IngestError::Internal("pipeline queue is closed".to_string()))
            }
        };
        let (item, ticket) = self.prepare(source).await?;
        permit.send(item);
        Ok(Some(ticket))
    }

    /// Cancels every queued and running job.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Closes the queue and waits for workers to drain it.
    pub async fn shutdown(mut self) {
        self.sender.take();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
        info!("pipeline stopped");
    }

    fn sender(&self) -> Result<&mpsc::Sender<WorkItem>, IngestError> {
        self.sender
            .as_ref()
            .ok_or_else(|| IngestError::Internal("pipeline is shut down".to_string()))
    }

    async fn prepare(&self, source: SourceFile) -> Result<(WorkItem, JobTicket), IngestError> {
        let job = self.jobs.create_job(&source).await?;
        let cancel = self.shutdown.child_token();
        let (respond, outcome) = oneshot::channel();
        let ticket = JobTicket {
            job_id: job.job_id,
            checksum: job.checksum.clone(),
            cancel: cancel.clone(),
            outcome,
        };
        let item = WorkItem {
            job,
            source,
            cancel,
            respond,
        };
        Ok((item, ticket))
    }
}
