mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Barrier;
use uuid::Uuid;
use waplus_core::discovery::{MemorySourceReader, SourceReader};
use waplus_core::error::{SourceError, StoreError};
use waplus_core::jobs::{IngestionJob, JobState, JobUpdate};
use waplus_core::loader::ConstraintPolicy;
use waplus_core::orchestrator::{Orchestrator, PipelineConfig, PipelineContext};
use waplus_core::store::{
    CommitReport, CommitRequest, Generation, IndicatorQuery, JobStore, MemoryStore, RecordStore,
};
use waplus_core::transform::RejectionRule;
use waplus_core::types::{Checksum, IndicatorRecord, RasterRecord, SourceFile};
use waplus_parser::formats::LongTableDecoder;
use waplus_parser::{Capability, DecodedFile, ParseError, SourceDecoder};

use common::{fast_config, fixture, precip_csv, Harness};

/// Long-table decoder that counts how often it is invoked.
struct CountingDecoder {
    inner: LongTableDecoder,
    calls: Arc<AtomicUsize>,
}

impl SourceDecoder for CountingDecoder {
    fn format(&self) -> &'static str {
        self.inner.format()
    }

    fn capability(&self) -> Capability {
        self.inner.capability()
    }

    fn decode(&self, content: Bytes) -> Result<DecodedFile, ParseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(content)
    }
}

async fn wait_for_state(store: &MemoryStore, job_id: Uuid, state: JobState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = store.job(job_id).await.unwrap().expect("job exists");
            if job.state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job never reached {state}"));
}

#[tokio::test]
async fn basin42_scenario_completes_with_one_rejection() {
    let harness = Harness::new();
    let source = harness
        .reader
        .add("data/basin42_2023.csv", "csv_long", fixture("basin42_2023.csv"));
    let pipeline = harness.start(fast_config());

    let outcome = pipeline.submit(source.clone()).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.loaded, 1);
    assert_eq!(outcome.rejected, 1);
    let report = outcome.report.expect("rejection report");
    assert_eq!(report.count(RejectionRule::OutOfRange), 1);
    assert_eq!(report.samples[0].row, Some(1));

    let stored = harness.store.all_timeseries();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].value, 12.0);

    let status = harness.store.status(&source.checksum).await.unwrap().expect("status");
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.last_error, None);
}

#[tokio::test]
async fn rediscovered_checksum_short_circuits_before_parsing() {
    let mut harness = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    harness.registry.register(Arc::new(CountingDecoder {
        inner: LongTableDecoder::csv(),
        calls: calls.clone(),
    }));
    let source = harness
        .reader
        .add("data/basin42_2023.csv", "csv_long", fixture("basin42_2023.csv"));
    let pipeline = harness.start(fast_config());

    let first = pipeline.submit(source.clone()).await.unwrap().wait().await.unwrap();
    let stored_after_first = harness.store.all_timeseries();
    let again = SourceFile::new("archive/copy_of_basin42.csv", "csv_long", source.checksum.clone());
    let second = pipeline.submit(again).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(first.state, JobState::Completed);
    assert_eq!(second.state, JobState::Completed);
    assert_ne!(first.job_id, second.job_id);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "parser ran once");
    assert_eq!(harness.store.commit_calls(), 1, "loader ran once");
    assert_eq!(harness.store.all_timeseries(), stored_after_first);

    let history = harness.store.history(&source.checksum).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|job| job.state == JobState::Completed));
}

#[tokio::test]
async fn one_out_of_range_row_among_a_hundred() {
    let harness = Harness::new();
    let csv = precip_csv("B43", 100, |row| if row == 37 { -3.0 } else { 2.5 });
    let source = harness.reader.add("data/b43.csv", "csv_long", csv);
    let pipeline = harness.start(fast_config());

    let outcome = pipeline.submit(source).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.loaded, 99);
    assert_eq!(outcome.rejected, 1);
    assert_eq!(outcome.report.expect("report").samples[0].row, Some(37));
    assert_eq!(harness.store.timeseries_len(), 99);
}

#[tokio::test]
async fn truncated_raster_header_is_quarantined_and_stays_quarantined() {
    let harness = Harness::new();
    let source = harness.reader.add(
        "rasters/evap_2023_02.hdr",
        "raster_hdr",
        fixture("truncated_header.hdr"),
    );
    let pipeline = harness.start(fast_config());

    let first = pipeline.submit(source.clone()).await.unwrap().wait().await.unwrap();
    let second = pipeline.submit(source.clone()).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(first.state, JobState::Quarantined);
    assert_eq!(first.attempts, 1, "parse errors are not retried");
    let reason = first.last_error.clone().expect("reason recorded");
    assert!(reason.contains("truncated") || reason.contains("END"), "{reason}");

    assert_eq!(second.state, JobState::Quarantined);
    assert_eq!(second.last_error, first.last_error);
    let history = harness.store.history(&source.checksum).await.unwrap();
    assert!(history.iter().all(|job| job.state == JobState::Quarantined));
    assert!(history[1].finished_at.is_some());
}

#[tokio::test]
async fn transient_conflicts_are_retried() {
    let harness = Harness::new();
    harness.store.fail_next_commits(2);
    let source = harness
        .reader
        .add("data/basin42_2023.csv", "csv_long", fixture("basin42_2023.csv"));
    let pipeline = harness.start(fast_config());

    let outcome = pipeline.submit(source).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(harness.store.commit_calls(), 3);
    assert_eq!(harness.store.timeseries_len(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job() {
    let harness = Harness::new();
    harness.store.fail_next_commits(10);
    let source = harness
        .reader
        .add("data/basin42_2023.csv", "csv_long", fixture("basin42_2023.csv"));
    let pipeline = harness.start(fast_config());

    let outcome = pipeline.submit(source).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.attempts, 3);
    let reason = outcome.last_error.expect("reason");
    assert!(reason.contains("gave up after 3 attempts"), "{reason}");
    assert_eq!(harness.store.timeseries_len(), 0);
}

#[tokio::test]
async fn constraint_failure_under_rollback_policy_fails_without_writes() {
    let harness = Harness::with_store(MemoryStore::new().with_reference_basins(["B42", "B43", "B44"]));
    harness.store.remove_basin("B43");
    let csv = "basin,indicator,timestamp,value,unit\nB42,precip_mm,2023-01-01,1,mm\nB43,precip_mm,2023-01-01,2,mm\n";
    let source = harness.reader.add("data/two.csv", "csv_long", csv);
    let pipeline = harness.start(PipelineConfig {
        constraint_policy: ConstraintPolicy::RollbackFile,
        ..fast_config()
    });

    let outcome = pipeline.submit(source).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.last_error.expect("reason").contains("constraint"));
    assert_eq!(harness.store.timeseries_len(), 0);
}

#[tokio::test]
async fn checksum_drift_between_discovery_and_read_fails() {
    let harness = Harness::new();
    let source = harness
        .reader
        .add("data/basin42_2023.csv", "csv_long", fixture("basin42_2023.csv"));
    harness
        .reader
        .insert("data/basin42_2023.csv", Bytes::from_static(b"basin,indicator\n"));
    let pipeline = harness.start(fast_config());

    let outcome = pipeline.submit(source).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(outcome.state, JobState::Failed);
    assert!(outcome.last_error.expect("reason").contains("does not match"));
}

#[tokio::test]
async fn raster_descriptors_are_loaded() {
    let harness = Harness::new();
    let source = harness
        .reader
        .add("rasters/evap_2023_01.hdr", "raster_hdr", fixture("evap_2023_01.hdr"));
    let pipeline = harness.start(fast_config());

    let outcome = pipeline.submit(source.clone()).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.loaded, 1);
    let rasters = harness
        .store
        .query_rasters(&["B43".to_string()].into_iter().collect())
        .await
        .unwrap();
    assert_eq!(rasters.len(), 1);
    assert_eq!(rasters[0].checksum, source.checksum);
}

#[tokio::test]
async fn cancellation_during_loading_keeps_committed_data() {
    let harness = Harness::new();
    harness.store.set_commit_delay(Some(Duration::from_millis(200)));
    let source = harness
        .reader
        .add("data/basin42_2023.csv", "csv_long", fixture("basin42_2023.csv"));
    let pipeline = harness.start(fast_config());

    let ticket = pipeline.submit(source).await.unwrap();
    wait_for_state(&harness.store, ticket.job_id, JobState::Loading).await;
    ticket.cancel();
    let outcome = ticket.wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.last_error.as_deref(), Some("cancelled"));
    assert_eq!(outcome.loaded, 1);
    assert_eq!(harness.store.timeseries_len(), 1);
}

#[tokio::test]
async fn full_queue_pushes_back_on_submitters() {
    let harness = Harness::new();
    harness.store.set_commit_delay(Some(Duration::from_millis(300)));
    let pipeline = harness.start(PipelineConfig {
        workers: 1,
        queue_capacity: 1,
        ..fast_config()
    });

    let mut tickets = Vec::new();
    for (index, basin) in ["B42", "B43"].into_iter().enumerate() {
        let csv = precip_csv(basin, 3, |_| 1.0);
        let source = harness.reader.add(&format!("data/{index}.csv"), "csv_long", csv);
        tickets.push(pipeline.submit(source).await.unwrap());
    }
    let overflow = harness
        .reader
        .add("data/overflow.csv", "csv_long", precip_csv("B44", 3, |_| 1.0));
    let refused = pipeline.try_submit(overflow.clone()).await.unwrap();
    assert!(refused.is_none());
    assert!(harness.store.history(&overflow.checksum).await.unwrap().is_empty());

    for ticket in tickets {
        assert_eq!(ticket.wait().await.unwrap().state, JobState::Completed);
    }
    pipeline.shutdown().await;
}

/// Record store whose commits wait until two of them are in flight at once.
struct RendezvousStore {
    inner: MemoryStore,
    barrier: Barrier,
}

#[async_trait]
impl RecordStore for RendezvousStore {
    fn supports_partial_commit(&self) -> bool {
        self.inner.supports_partial_commit()
    }

    async fn commit(&self, request: CommitRequest<'_>) -> Result<CommitReport, StoreError> {
        self.barrier.wait().await;
        self.inner.commit(request).await
    }

    async fn current_generation(&self) -> Result<Generation, StoreError> {
        self.inner.current_generation().await
    }

    async fn query_timeseries(&self, query: &IndicatorQuery) -> Result<Vec<IndicatorRecord>, StoreError> {
        self.inner.query_timeseries(query).await
    }

    async fn query_rasters(&self, basins: &BTreeSet<String>) -> Result<Vec<RasterRecord>, StoreError> {
        self.inner.query_rasters(basins).await
    }
}

#[async_trait]
impl JobStore for RendezvousStore {
    async fn create_job(&self, source: &SourceFile) -> Result<IngestionJob, StoreError> {
        self.inner.create_job(source).await
    }

    async fn transition(&self, job_id: Uuid, update: JobUpdate) -> Result<IngestionJob, StoreError> {
        self.inner.transition(job_id, update).await
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<IngestionJob>, StoreError> {
        self.inner.job(job_id).await
    }

    async fn history(&self, checksum: &Checksum) -> Result<Vec<IngestionJob>, StoreError> {
        self.inner.history(checksum).await
    }

    async fn try_claim(&self, checksum: &Checksum, owner: Uuid, lease: Duration) -> Result<bool, StoreError> {
        self.inner.try_claim(checksum, owner, lease).await
    }

    async fn release_claim(&self, checksum: &Checksum, owner: Uuid) -> Result<(), StoreError> {
        self.inner.release_claim(checksum, owner).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn jobs_over_disjoint_basins_load_concurrently() {
    let harness = Harness::new();
    let store = Arc::new(RendezvousStore {
        inner: MemoryStore::new(),
        barrier: Barrier::new(2),
    });
    let context = PipelineContext::new(
        harness.registry.clone(),
        harness.catalog.clone(),
        store.clone(),
        harness.cache.clone(),
        harness.reader.clone(),
    );
    let pipeline = Orchestrator::new(context, fast_config()).start();

    let a = harness.reader.add("data/a.csv", "csv_long", precip_csv("B42", 5, |_| 1.0));
    let b = harness.reader.add("data/b.csv", "csv_long", precip_csv("B43", 5, |_| 2.0));
    let ticket_a = pipeline.submit(a).await.unwrap();
    let ticket_b = pipeline.submit(b).await.unwrap();

    let (outcome_a, outcome_b) = tokio::time::timeout(Duration::from_secs(5), async {
        (ticket_a.wait().await.unwrap(), ticket_b.wait().await.unwrap())
    })
    .await
    .expect("both commits were in flight together");
    pipeline.shutdown().await;

    assert_eq!(outcome_a.state, JobState::Completed);
    assert_eq!(outcome_b.state, JobState::Completed);
    assert_eq!(store.inner.timeseries_len(), 10);
}

#[tokio::test]
async fn duplicate_waits_for_the_claim_holder_without_spending_attempts() {
    let harness = Harness::new();
    harness.store.set_commit_delay(Some(Duration::from_millis(300)));
    let source = harness
        .reader
        .add("data/basin42_2023.csv", "csv_long", fixture("basin42_2023.csv"));
    let pipeline = harness.start(fast_config());

    let first = pipeline.submit(source.clone()).await.unwrap();
    let second = pipeline.submit(source.clone()).await.unwrap();
    let first = first.wait().await.unwrap();
    let second = second.wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(first.state, JobState::Completed);
    assert_eq!(second.state, JobState::Completed);
    assert_eq!(first.attempts, 1);
    assert_eq!(second.attempts, 1);
    assert_eq!(harness.store.commit_calls(), 1);
}

#[tokio::test]
async fn claim_is_renewed_while_a_slow_commit_runs() {
    let harness = Harness::new();
    harness.store.set_commit_delay(Some(Duration::from_millis(300)));
    let source = harness
        .reader
        .add("data/basin42_2023.csv", "csv_long", fixture("basin42_2023.csv"));
    let pipeline = harness.start(PipelineConfig {
        claim_lease: Duration::from_millis(50),
        ..fast_config()
    });

    let first = pipeline.submit(source.clone()).await.unwrap();
    let second = pipeline.submit(source.clone()).await.unwrap();
    let first = first.wait().await.unwrap();
    let second = second.wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(first.state, JobState::Completed);
    assert_eq!(second.state, JobState::Completed);
    assert_eq!(harness.store.commit_calls(), 1, "the lease never lapsed mid-commit");
}

/// Reader that stalls before handing over the bytes.
struct SlowReader {
    inner: Arc<MemorySourceReader>,
    delay: Duration,
}

#[async_trait]
impl SourceReader for SlowReader {
    async fn read(&self, source: &SourceFile) -> Result<Bytes, SourceError> {
        tokio::time::sleep(self.delay).await;
        self.inner.read(source).await
    }
}

#[tokio::test]
async fn parse_timeout_covers_the_read_and_is_retried() {
    let harness = Harness::new();
    let source = harness
        .reader
        .add("data/basin42_2023.csv", "csv_long", fixture("basin42_2023.csv"));
    let context = PipelineContext::new(
        harness.registry.clone(),
        harness.catalog.clone(),
        harness.store.clone(),
        harness.cache.clone(),
        Arc::new(SlowReader {
            inner: harness.reader.clone(),
            delay: Duration::from_millis(200),
        }),
    );
    let mut config = fast_config();
    config.timeouts.parse = Duration::from_millis(20);
    let pipeline = Orchestrator::new(context, config).start();

    let outcome = pipeline.submit(source).await.unwrap().wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(outcome.state, JobState::Failed);
    assert_eq!(outcome.attempts, 3);
    let error = outcome.last_error.expect("failure recorded");
    assert!(error.contains("parsing stage timed out"), "{error}");
    assert_eq!(harness.store.commit_calls(), 0);
}

#[tokio::test]
async fn job_cancelled_in_the_queue_never_parses() {
    let mut harness = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    harness.registry.register(Arc::new(CountingDecoder {
        inner: LongTableDecoder::csv(),
        calls: calls.clone(),
    }));
    harness.store.set_commit_delay(Some(Duration::from_millis(300)));
    let pipeline = harness.start(PipelineConfig {
        workers: 1,
        ..fast_config()
    });

    let running = harness
        .reader
        .add("data/a.csv", "csv_long", precip_csv("B42", 3, |_| 1.0));
    let queued = harness
        .reader
        .add("data/b.csv", "csv_long", precip_csv("B43", 3, |_| 1.0));
    let running = pipeline.submit(running).await.unwrap();
    wait_for_state(&harness.store, running.job_id, JobState::Loading).await;
    let queued = pipeline.submit(queued).await.unwrap();
    queued.cancel();

    let queued_id = queued.job_id;
    let cancelled = queued.wait().await.unwrap();
    let finished = running.wait().await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(finished.state, JobState::Completed);
    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(cancelled.last_error.as_deref(), Some("cancelled"));
    assert_eq!(cancelled.loaded, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let job = harness.store.job(queued_id).await.unwrap().expect("job exists");
    assert_eq!(job.attempt_count, 1);
    assert!(job.finished_at.is_some());
}
