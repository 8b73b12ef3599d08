mod common;

use std::sync::Arc;

use bytes::Bytes;
use waplus_core::error::StoreError;
use waplus_core::loader::{ConstraintPolicy, Loader};
use waplus_core::store::{IndicatorQuery, MemoryStore, RecordStore};
use waplus_core::transform::{NormalizedBatch, RejectionRule, TransformOptions, Transformer};
use waplus_core::types::{BasinIndicator, Checksum, SourceFile};
use waplus_parser::ParserRegistry;

use common::catalog;

const TWO_BASINS: &str = "\
basin,indicator,timestamp,value,unit
B42,precip_mm,2023-01-01,10,mm
B42,precip_mm,2023-01-02,11,mm
B43,et_mm,2023-01-01,3,mm
";

fn batch(contents: &'static str) -> (Checksum, NormalizedBatch) {
    let catalog = catalog();
    let bytes = Bytes::from_static(contents.as_bytes());
    let source = SourceFile::new("mem://loader.csv", "csv_long", Checksum::of(&bytes));
    let decoded = ParserRegistry::standard()
        .decode("csv_long", bytes)
        .expect("decodes");
    let batch = Transformer::new(catalog.as_ref(), catalog.as_ref(), TransformOptions::default())
        .transform(&source, decoded);
    (source.checksum, batch)
}

#[tokio::test]
async fn reloading_identical_content_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let loader = Loader::new(store.clone(), ConstraintPolicy::RejectRows);
    let (checksum, batch) = batch(TWO_BASINS);

    let first = loader.load(&checksum, &batch).await.unwrap();
    assert_eq!(first.written, 3);
    assert_eq!(first.generation, 1);
    assert_eq!(
        first.touched,
        [
            BasinIndicator::new("B42", "precip_mm"),
            BasinIndicator::new("B43", "et_mm"),
        ]
        .into_iter()
        .collect()
    );

    let before = store.all_timeseries();
    let second = loader.load(&checksum, &batch).await.unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.loaded(), 3);
    assert!(second.touched.is_empty());
    assert_eq!(second.generation, 1);
    assert_eq!(store.all_timeseries(), before);
}

#[tokio::test]
async fn store_constraint_rejects_only_offending_rows() {
    let store = Arc::new(MemoryStore::new().with_reference_basins(["B42"]));
    let loader = Loader::new(store.clone(), ConstraintPolicy::RejectRows);
    let (checksum, batch) = batch(TWO_BASINS);

    let outcome = loader.load(&checksum, &batch).await.unwrap();
    assert_eq!(outcome.written, 2);
    assert_eq!(outcome.rejected.len(), 1);
    let rejected = &outcome.rejected[0];
    assert_eq!(rejected.rule, RejectionRule::StoreConstraint);
    assert_eq!(rejected.row, Some(3));
    assert!(rejected.message.contains("B43"));

    let stored = store
        .query_timeseries(&IndicatorQuery::default())
        .await
        .unwrap();
    assert!(stored.iter().all(|record| record.basin_id == "B42"));
}

#[tokio::test]
async fn rollback_policy_keeps_the_store_untouched() {
    let store = Arc::new(MemoryStore::new().with_reference_basins(["B42"]));
    let loader = Loader::new(store.clone(), ConstraintPolicy::RollbackFile);
    let (checksum, batch) = batch(TWO_BASINS);

    let err = loader.load(&checksum, &batch).await.unwrap_err();
    assert!(matches!(err, StoreError::Constraint(_)));
    assert_eq!(store.timeseries_len(), 0);
    assert_eq!(store.current_generation().await.unwrap(), 0);
}

#[tokio::test]
async fn stores_without_partial_commit_force_rollback() {
    let store = Arc::new(MemoryStore::without_partial_commit());
    let loader = Loader::new(store, ConstraintPolicy::RejectRows);
    assert_eq!(loader.policy(), ConstraintPolicy::RollbackFile);
}

#[tokio::test]
async fn same_instant_from_two_files_is_kept_per_source() {
    let store = Arc::new(MemoryStore::new());
    let loader = Loader::new(store.clone(), ConstraintPolicy::RejectRows);
    let (first_checksum, first) = batch(TWO_BASINS);
    let (second_checksum, second) = batch(
        "basin,indicator,timestamp,value,unit\nB42,precip_mm,2023-01-01,10.5,mm\n",
    );
    loader.load(&first_checksum, &first).await.unwrap();
    let outcome = loader.load(&second_checksum, &second).await.unwrap();

    assert_eq!(outcome.written, 1);
    assert_eq!(outcome.generation, 2);
    assert_eq!(store.timeseries_len(), 4);
}
