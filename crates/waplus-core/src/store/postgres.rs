use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use super::{
    CommitMode, CommitReport, CommitRequest, Generation, IndicatorQuery, JobStore, RecordStore,
    RowRejection,
};
use crate::catalog::ReferenceCatalog;
use crate::db::DbPool;
use crate::error::{CatalogError, StoreError};
use crate::jobs::{IngestionJob, JobUpdate};
use crate::types::{
    Aggregation, Basin, Checksum, Derivation, IndicatorDefinition, IndicatorRecord, RasterRecord,
    SourceFile, ValidRange,
};

const UPSERT_TIMESERIES: &str = r#"
    INSERT INTO indicator_timeseries (
        basin_id, indicator_id, observed_at, source_checksum,
        value, unit, derived, quality_flag, comment, source_row
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (basin_id, indicator_id, observed_at, source_checksum)
    DO UPDATE SET
        value = EXCLUDED.value,
        unit = EXCLUDED.unit,
        derived = EXCLUDED.derived,
        quality_flag = EXCLUDED.quality_flag,
        comment = EXCLUDED.comment,
        source_row = EXCLUDED.source_row,
        loaded_at = now()
    WHERE (
        indicator_timeseries.value, indicator_timeseries.unit, indicator_timeseries.derived,
        indicator_timeseries.quality_flag, indicator_timeseries.comment
    ) IS DISTINCT FROM (
        EXCLUDED.value, EXCLUDED.unit, EXCLUDED.derived, EXCLUDED.quality_flag, EXCLUDED.comment
    )
"#;

const JOB_COLUMNS: &str = "job_id, checksum, uri, format, state, attempt_count, last_error, \
     records_loaded, records_rejected, rejection_report, created_at, updated_at, finished_at";

/// Postgres-backed record, job and claim store. Rows are upserted through the
/// table's natural key so concurrent writers serialize on row locks only.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn load_catalog(&self) -> Result<ReferenceCatalog, CatalogError> {
        let backend = |err: sqlx::Error| CatalogError::Backend(err.to_string());

        let basin_rows = sqlx::query::<sqlx::Postgres>(
            "SELECT basin_id, name, aliases, geometry, attributes FROM basin ORDER BY basin_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut basins = Vec::with_capacity(basin_rows.len());
        for row in basin_rows {
            let id: String = row.try_get("basin_id").map_err(backend)?;
            let geometry: Option<serde_json::Value> = row.try_get("geometry").map_err(backend)?;
            let geometry = geometry
                .map(serde_json::from_value::<geojson::Geometry>)
                .transpose()
                .map_err(|err| CatalogError::Geometry {
                    basin: id.clone(),
                    message: err.to_string(),
                })?;
            let attributes: serde_json::Value = row.try_get("attributes").map_err(backend)?;
            basins.push(Basin {
                name: row.try_get("name").map_err(backend)?,
                aliases: row.try_get("aliases").map_err(backend)?,
                geometry,
                attributes: serde_json::from_value(attributes).unwrap_or_default(),
                id,
            });
        }

        let indicator_rows = sqlx::query::<sqlx::Postgres>(
            r#"
            SELECT indicator_id, name, unit, aggregation, valid_min, valid_max,
                   derivation, temporal_resolution, category
            FROM indicator_definition
            ORDER BY indicator_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut indicators = Vec::with_capacity(indicator_rows.len());
        for row in indicator_rows {
            let id: String = row.try_get("indicator_id").map_err(backend)?;
            let aggregation: String = row.try_get("aggregation").map_err(backend)?;
            let derivation: Option<serde_json::Value> = row.try_get("derivation").map_err(backend)?;
            let derivation = derivation
                .map(serde_json::from_value::<Derivation>)
                .transpose()
                .map_err(|err| CatalogError::InvalidDerivation {
                    indicator: id.clone(),
                    message: err.to_string(),
                })?;
            indicators.push(IndicatorDefinition {
                name: row.try_get("name").map_err(backend)?,
                unit: row.try_get("unit").map_err(backend)?,
                aggregation: Aggregation::parse(&aggregation).ok_or_else(|| {
                    CatalogError::Backend(format!("unknown aggregation `{aggregation}` for `{id}`"))
                })?,
                valid_range: ValidRange {
                    min: row.try_get("valid_min").map_err(backend)?,
                    max: row.try_get("valid_max").map_err(backend)?,
                },
                derivation,
                temporal_resolution: row.try_get("temporal_resolution").map_err(backend)?,
                category: row.try_get("category").map_err(backend)?,
                id,
            });
        }

        ReferenceCatalog::new(basins, indicators)
    }

    async fn commit_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        request: &CommitRequest<'_>,
    ) -> Result<CommitReport, StoreError> {
        let partial = request.mode == CommitMode::Partial;
        let mut report = CommitReport::default();

        for record in request.timeseries {
            if partial {
                savepoint(tx, "SAVEPOINT loader_row").await?;
            }
            let result = sqlx::query::<sqlx::Postgres>(UPSERT_TIMESERIES)
                .bind(&record.basin_id)
                .bind(&record.indicator_id)
                .bind(record.timestamp)
                .bind(record.source_checksum.as_str())
                .bind(record.value)
                .bind(&record.unit)
                .bind(record.derived)
                .bind(record.quality_flag.as_deref())
                .bind(record.comment.as_deref())
                .bind(record.source_row.map(|row| row as i64))
                .execute(&mut **tx)
                .await;

            match result.map_err(classify) {
                Ok(done) => {
                    if partial {
                        savepoint(tx, "RELEASE SAVEPOINT loader_row").await?;
                    }
                    if done.rows_affected() > 0 {
                        report.written += 1;
                        report.changed.insert(record.scope());
                    } else {
                        report.unchanged += 1;
                    }
                }
                Err(StoreError::Constraint(reason)) if partial => {
                    savepoint(tx, "ROLLBACK TO SAVEPOINT loader_row").await?;
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
                Err(err) => return Err(err),
            }
        }

        for raster in request.rasters {
            if partial {
                savepoint(tx, "SAVEPOINT loader_raster").await?;
            }
            match insert_raster(tx, raster).await {
                Ok(true) => {
                    if partial {
                        savepoint(tx, "RELEASE SAVEPOINT loader_raster").await?;
                    }
                    report.written += 1;
                    report.changed.extend(raster.scope());
                }
                Ok(false) => {
                    if partial {
                        savepoint(tx, "RELEASE SAVEPOINT loader_raster").await?;
                    }
                    report.unchanged += 1;
                }
                Err(StoreError::Constraint(reason)) if partial => {
                    savepoint(tx, "ROLLBACK TO SAVEPOINT loader_raster").await?;
                    report.rejected.push(RowRejection {
                        record: raster.raster_id.clone(),
                        source_row: None,
                        reason,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        report.generation = if report.changed.is_empty() {
            read_generation(&mut **tx).await?
        } else {
            next_generation(tx, request.checksum, report.changed.len()).await?
        };
        Ok(report)
    }
}

async fn savepoint(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    statement: &str,
) -> Result<(), StoreError> {
    sqlx::query::<sqlx::Postgres>(statement)
        .execute(&mut **tx)
        .await
        .map(|_| ())
        .map_err(classify)
}

/// Returns `false` when a raster with the same checksum is already stored.
async fn insert_raster(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    raster: &RasterRecord,
) -> Result<bool, StoreError> {
    let attributes = serde_json::to_value(&raster.attributes)
        .map_err(|err| StoreError::Backend(err.to_string()))?;
    let inserted = sqlx::query::<sqlx::Postgres>(
        r#"
        INSERT INTO raster_metadata (
            checksum, raster_id, indicator_id, resolution, acquisition_date,
            storage_path, crs, attributes
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (checksum) DO NOTHING
        "#,
    )
    .bind(raster.checksum.as_str())
    .bind(&raster.raster_id)
    .bind(raster.indicator_id.as_deref())
    .bind(raster.resolution)
    .bind(raster.acquisition_date)
    .bind(&raster.storage_path)
    .bind(raster.crs.as_deref())
    .bind(attributes)
    .execute(&mut **tx)
    .await
    .map_err(classify)?;

    if inserted.rows_affected() == 0 {
        return Ok(false);
    }
    for basin in &raster.coverage {
        sqlx::query::<sqlx::Postgres>(
            "INSERT INTO raster_coverage (checksum, basin_id) VALUES ($1, $2)",
        )
        .bind(raster.checksum.as_str())
        .bind(basin)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
    }
    Ok(true)
}

/// Bumps the counter row as the transaction's last write. The row lock is held
/// until commit, so generations are handed out in commit order.
async fn next_generation(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    checksum: &Checksum,
    changed_pairs: usize,
) -> Result<Generation, StoreError> {
    let generation = sqlx::query_scalar::<_, i64>(
        "UPDATE store_generation_counter SET generation = generation + 1 RETURNING generation",
    )
    .fetch_one(&mut **tx)
    .await
    .map_err(classify)?;
    sqlx::query::<sqlx::Postgres>(
        "INSERT INTO store_generation (generation, checksum, changed_pairs) VALUES ($1, $2, $3)",
    )
    .bind(generation)
    .bind(checksum.as_str())
    .bind(changed_pairs as i32)
    .execute(&mut **tx)
    .await
    .map_err(classify)?;
    Ok(generation as Generation)
}

async fn read_generation<'e, E>(executor: E) -> Result<Generation, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let generation = sqlx::query_scalar::<_, i64>(
        "SELECT generation FROM store_generation_counter",
    )
    .fetch_one(executor)
    .await
    .map_err(classify)?;
    Ok(generation as Generation)
}

/// Maps driver errors onto the store taxonomy: integrity violations (class 23)
/// are constraints; serialization failures, deadlocks, lock timeouts and lost
/// connections are transient conflicts.
fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if code.starts_with("23") => StoreError::Constraint(db.message().to_string()),
            Some("40001") | Some("40P01") | Some("55P03") | Some("57014") => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Conflict(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn record_from_row(row: &PgRow) -> Result<IndicatorRecord, sqlx::Error> {
    let source_row: Option<i64> = row.try_get("source_row")?;
    let checksum: String = row.try_get("source_checksum")?;
    Ok(IndicatorRecord {
        basin_id: row.try_get("basin_id")?,
        indicator_id: row.try_get("indicator_id")?,
        timestamp: row.try_get("observed_at")?,
        value: row.try_get("value")?,
        unit: row.try_get("unit")?,
        source_checksum: Checksum::from_hex(checksum),
        derived: row.try_get("derived")?,
        quality_flag: row.try_get("quality_flag")?,
        comment: row.try_get("comment")?,
        source_row: source_row.map(|row| row as u64),
    })
}

fn job_from_row(row: &PgRow) -> Result<IngestionJob, StoreError> {
    let decode = |err: sqlx::Error| StoreError::Backend(err.to_string());
    let state: String = row.try_get("state").map_err(decode)?;
    let checksum: String = row.try_get("checksum").map_err(decode)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(decode)?;
    let loaded: i64 = row.try_get("records_loaded").map_err(decode)?;
    let rejected: i64 = row.try_get("records_rejected").map_err(decode)?;
    let report: Option<serde_json::Value> = row.try_get("rejection_report").map_err(decode)?;
    let rejection_report = match report {
        Some(value) => match serde_json::from_value(value) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable rejection report");
                None
            }
        },
        None => None,
    };

    Ok(IngestionJob {
        job_id: row.try_get("job_id").map_err(decode)?,
        checksum: Checksum::from_hex(checksum),
        uri: row.try_get("uri").map_err(decode)?,
        format: row.try_get("format").map_err(decode)?,
        state: state.parse().map_err(StoreError::Backend)?,
        attempt_count: attempt_count.max(0) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        records_loaded: loaded.max(0) as u64,
        records_rejected: rejected.max(0) as u64,
        rejection_report,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
    })
}

fn report_json(job: &IngestionJob) -> Result<Option<serde_json::Value>, StoreError> {
    job.rejection_report
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|err| StoreError::Backend(err.to_string()))
}

#[async_trait]
impl RecordStore for PgStore {
    fn supports_partial_commit(&self) -> bool {
        true
    }

    async fn commit(&self, request: CommitRequest<'_>) -> Result<CommitReport, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        let report = self.commit_in_tx(&mut tx, &request).await?;
        tx.commit().await.map_err(classify)?;
        Ok(report)
    }

    async fn current_generation(&self) -> Result<Generation, StoreError> {
        read_generation(&self.pool).await
    }

    async fn query_timeseries(&self, query: &IndicatorQuery) -> Result<Vec<IndicatorRecord>, StoreError> {
        let basins: Option<Vec<String>> =
            (!query.basins.is_empty()).then(|| query.basins.iter().cloned().collect());
        let indicators: Option<Vec<String>> =
            (!query.indicators.is_empty()).then(|| query.indicators.iter().cloned().collect());
        let rows = sqlx::query::<sqlx::Postgres>(
            r#"
            SELECT basin_id, indicator_id, observed_at, source_checksum, value, unit,
                   derived, quality_flag, comment, source_row
            FROM indicator_timeseries
            WHERE ($1::TEXT[] IS NULL OR basin_id = ANY($1))
              AND ($2::TEXT[] IS NULL OR indicator_id = ANY($2))
              AND ($3::TIMESTAMPTZ IS NULL OR observed_at >= $3)
              AND ($4::TIMESTAMPTZ IS NULL OR observed_at < $4)
            ORDER BY basin_id, indicator_id, observed_at, source_checksum
            "#,
        )
        .bind(basins)
        .bind(indicators)
        .bind(query.window.map(|w| w.start))
        .bind(query.window.map(|w| w.end))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter()
            .map(|row| record_from_row(row).map_err(classify))
            .collect()
    }

    async fn query_rasters(&self, basins: &BTreeSet<String>) -> Result<Vec<RasterRecord>, StoreError> {
        let filter: Option<Vec<String>> =
            (!basins.is_empty()).then(|| basins.iter().cloned().collect());
        let rows = sqlx::query::<sqlx::Postgres>(
            r#"
            SELECT m.checksum, m.raster_id, m.indicator_id, m.resolution, m.acquisition_date,
                   m.storage_path, m.crs, m.attributes,
                   ARRAY_AGG(c.basin_id ORDER BY c.basin_id) AS coverage
            FROM raster_metadata m
            JOIN raster_coverage c ON c.checksum = m.checksum
            GROUP BY m.checksum
            HAVING ($1::TEXT[] IS NULL OR BOOL_OR(c.basin_id = ANY($1)))
            ORDER BY m.acquisition_date, m.raster_id
            "#,
        )
        .bind(filter)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let mut rasters = Vec::with_capacity(rows.len());
        for row in rows {
            let checksum: String = row.try_get("checksum").map_err(classify)?;
            let coverage: Vec<String> = row.try_get("coverage").map_err(classify)?;
            let attributes: serde_json::Value = row.try_get("attributes").map_err(classify)?;
            rasters.push(RasterRecord {
                raster_id: row.try_get("raster_id").map_err(classify)?,
                coverage: coverage.into_iter().collect(),
                indicator_id: row.try_get("indicator_id").map_err(classify)?,
                resolution: row.try_get("resolution").map_err(classify)?,
                acquisition_date: row.try_get("acquisition_date").map_err(classify)?,
                storage_path: row.try_get("storage_path").map_err(classify)?,
                checksum: Checksum::from_hex(checksum),
                crs: row.try_get("crs").map_err(classify)?,
                attributes: serde_json::from_value::<BTreeMap<String, String>>(attributes)
                    .unwrap_or_default(),
            });
        }
        Ok(rasters)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, source: &SourceFile) -> Result<IngestionJob, StoreError> {
        let job = IngestionJob::discovered(source);
        sqlx::query::<sqlx::Postgres>(
            r#"
            INSERT INTO ingestion_job (job_id, checksum, uri, format, state, attempt_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $6)
            "#,
        )
        .bind(job.job_id)
        .bind(job.checksum.as_str())
        .bind(&job.uri)
        .bind(&job.format)
        .bind(job.state.as_str())
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(job)
    }

    async fn transition(&self, job_id: Uuid, update: JobUpdate) -> Result<IngestionJob, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        let row = sqlx::query::<sqlx::Postgres>(&format!(
            "SELECT {JOB_COLUMNS} FROM ingestion_job WHERE job_id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?
        .ok_or(StoreError::JobNotFound(job_id))?;

        let mut job = job_from_row(&row)?;
        if !job.state.can_transition_to(update.state) {
            return Err(StoreError::IllegalTransition {
                job_id,
                from: job.state,
                to: update.state,
            });
        }
        job.apply(update);

        sqlx::query::<sqlx::Postgres>(
            r#"
            UPDATE ingestion_job
            SET state = $2, attempt_count = $3, last_error = $4, records_loaded = $5,
                records_rejected = $6, rejection_report = $7, updated_at = $8, finished_at = $9
            WHERE job_id = $1
            "#,
        )
        .bind(job.job_id)
        .bind(job.state.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.last_error.as_deref())
        .bind(job.records_loaded as i64)
        .bind(job.records_rejected as i64)
        .bind(report_json(&job)?)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(job)
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<IngestionJob>, StoreError> {
        let row = sqlx::query::<sqlx::Postgres>(&format!(
            "SELECT {JOB_COLUMNS} FROM ingestion_job WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn history(&self, checksum: &Checksum) -> Result<Vec<IngestionJob>, StoreError> {
        let rows = sqlx::query::<sqlx::Postgres>(&format!(
            "SELECT {JOB_COLUMNS} FROM ingestion_job WHERE checksum = $1 ORDER BY seq"
        ))
        .bind(checksum.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn try_claim(&self, checksum: &Checksum, owner: Uuid, lease: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query::<sqlx::Postgres>(
            r#"
            INSERT INTO ingestion_claim (checksum, owner, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (checksum) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE ingestion_claim.expires_at < now()
                   OR ingestion_claim.owner = EXCLUDED.owner
            "#,
        )
        .bind(checksum.as_str())
        .bind(owner)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, checksum: &Checksum, owner: Uuid) -> Result<(), StoreError> {
        sqlx::query::<sqlx::Postgres>("DELETE FROM ingestion_claim WHERE checksum = $1 AND owner = $2")
            .bind(checksum.as_str())
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
