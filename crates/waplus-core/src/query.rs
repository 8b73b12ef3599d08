use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, CacheManager, QueryKind};
use crate::catalog::{IndicatorCatalog, KeyMatch};
use crate::error::StoreError;
use crate::store::{IndicatorQuery, RecordStore};
use crate::types::{Aggregation, IndicatorRecord, RasterRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSummary {
    pub basin_id: String,
    pub indicator_id: String,
    pub aggregation: Aggregation,
    pub value: f64,
    pub unit: String,
    pub observations: usize,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

/// Read-only access to committed records, served through the cache.
pub struct ExplorerService {
    store: Arc<dyn RecordStore>,
    cache: Arc<CacheManager>,
    indicators: Arc<dyn IndicatorCatalog>,
}

impl ExplorerService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: Arc<CacheManager>,
        indicators: Arc<dyn IndicatorCatalog>,
    ) -> Self {
        Self {
            store,
            cache,
            indicators,
        }
    }

    pub async fn timeseries(&self, query: &IndicatorQuery) -> Result<Vec<IndicatorRecord>, StoreError> {
        let key = CacheKey::for_query(QueryKind::Timeseries, query);
        let generation = self.store.current_generation().await?;
        self.cache
            .get_or_compute(&key, generation, || self.store.query_timeseries(query))
            .await
    }

    pub async fn rasters(&self, basins: &BTreeSet<String>) -> Result<Vec<RasterRecord>, StoreError> {
        let key = CacheKey::rasters(basins.clone());
        let generation = self.store.current_generation().await?;
        self.cache
            .get_or_compute(&key, generation, || self.store.query_rasters(basins))
            .await
    }

    /// One summary per (basin, indicator) with data in the query, ordered by pair.
    pub async fn summarize(&self, query: &IndicatorQuery) -> Result<Vec<IndicatorSummary>, StoreError> {
        let key = CacheKey::for_query(QueryKind::Summary, query);
        let generation = self.store.current_generation().await?;
        self.cache
            .get_or_compute(&key, generation, || async {
                let records = self.store.query_timeseries(query).await?;
                Ok::<_, StoreError>(summarize_records(self.indicators.as_ref(), &records))
            })
            .await
    }
}

/// Aggregates records per pair. Several sources may report the same instant;
/// the value loaded last in store order wins for that instant.
pub fn summarize_records(
    indicators: &dyn IndicatorCatalog,
    records: &[IndicatorRecord],
) -> Vec<IndicatorSummary> {
    let mut grouped: BTreeMap<(&str, &str), BTreeMap<DateTime<Utc>, &IndicatorRecord>> = BTreeMap::new();
    for record in records {
        grouped
            .entry((record.basin_id.as_str(), record.indicator_id.as_str()))
            .or_default()
            .insert(record.timestamp, record);
    }

    let mut summaries = Vec::with_capacity(grouped.len());
    for ((basin_id, indicator_id), series) in grouped {
        let KeyMatch::Unique(definition) = indicators.indicator_by_key(indicator_id) else {
            continue;
        };
        let (Some((first, _)), Some((last, latest))) = (series.first_key_value(), series.last_key_value()) else {
            continue;
        };
        let total: f64 = series.values().map(|record| record.value).sum();
        let value = match definition.aggregation {
            Aggregation::Sum => total,
            Aggregation::Mean => total / series.len() as f64,
            Aggregation::Instantaneous => latest.value,
        };
        summaries.push(IndicatorSummary {
            basin_id: basin_id.to_string(),
            indicator_id: indicator_id.to_string(),
            aggregation: definition.aggregation,
            value,
            unit: definition.unit.clone(),
            observations: series.len(),
            first: *first,
            last: *last,
        });
    }
    summaries
}
