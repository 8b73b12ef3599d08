#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use waplus_core::cache::{CacheConfig, CacheManager};
use waplus_core::catalog::ReferenceCatalog;
use waplus_core::discovery::MemorySourceReader;
use waplus_core::orchestrator::{
    PipelineConfig, PipelineContext, PipelineHandle, RetryPolicy, StageTimeouts,
};
use waplus_core::store::MemoryStore;
use waplus_parser::ParserRegistry;

pub const CATALOG: &str = r#"
[[basin]]
id = "B42"
name = "Upper Litani"
aliases = ["LIT-U"]

[[basin]]
id = "B43"
name = "Lower Litani"

[[basin]]
id = "B44"
name = "Orontes"

[[indicator]]
id = "precip_mm"
name = "Precipitation"
unit = "mm"
aggregation = "sum"
valid_range = { min = 0.0, max = 1000.0 }

[[indicator]]
id = "et_mm"
name = "Evapotranspiration"
unit = "mm"
aggregation = "sum"
valid_range = { min = 0.0, max = 1000.0 }

[[indicator]]
id = "runoff_mcm"
unit = "mcm"
aggregation = "sum"
valid_range = { min = 0.0, max = 100000.0 }

[[indicator]]
id = "reservoir_level_m"
unit = "m"
aggregation = "instantaneous"
valid_range = { min = 0.0, max = 500.0 }

[[indicator]]
id = "soil_moisture"
unit = "fraction"
aggregation = "mean"
valid_range = { min = 0.0, max = 1.0 }

[[indicator]]
id = "net_water_mm"
unit = "mm"
aggregation = "sum"
valid_range = { min = -1000.0, max = 1000.0 }
derivation = { op = "difference", inputs = ["precip_mm", "et_mm"] }
"#;

pub fn catalog() -> Arc<ReferenceCatalog> {
    Arc::new(ReferenceCatalog::from_toml_str(CATALOG).expect("test catalog parses"))
}

pub fn fixture(name: &str) -> Bytes {
    let path = format!(
        "{}/../waplus-parser/tests/data/{name}",
        env!("CARGO_MANIFEST_DIR")
    );
    Bytes::from(std::fs::read(&path).unwrap_or_else(|err| panic!("fixture {path}: {err}")))
}

/// A long-format CSV with `rows` precipitation rows for one basin, one per day.
pub fn precip_csv(basin: &str, rows: usize, value_for: impl Fn(usize) -> f64) -> String {
    let mut csv = String::from("basin,indicator,timestamp,value,unit\n");
    let start = chrono::NaiveDate::from_ymd_opt(2023, 1, 1).expect("valid date");
    for row in 1..=rows {
        let day = start + chrono::Days::new(row as u64 - 1);
        csv.push_str(&format!("{basin},precip_mm,{day},{},mm\n", value_for(row)));
    }
    csv
}

pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        workers: 2,
        queue_capacity: 8,
        claim_lease: Duration::from_secs(30),
        claim_poll: Duration::from_millis(10),
        timeouts: StageTimeouts {
            parse: Duration::from_secs(5),
            transform: Duration::from_secs(5),
            load: Duration::from_secs(5),
        },
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(20),
        },
        ..PipelineConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub cache: Arc<CacheManager>,
    pub reader: Arc<MemorySourceReader>,
    pub catalog: Arc<ReferenceCatalog>,
    pub registry: ParserRegistry,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store: Arc::new(store),
            cache: Arc::new(CacheManager::in_memory(CacheConfig::default())),
            reader: Arc::new(MemorySourceReader::new()),
            catalog: catalog(),
            registry: ParserRegistry::standard(),
        }
    }

    pub fn context(&self) -> PipelineContext {
        PipelineContext::new(
            self.registry.clone(),
            self.catalog.clone(),
            self.store.clone(),
            self.cache.clone(),
            self.reader.clone(),
        )
    }

    pub fn start(&self, config: PipelineConfig) -> PipelineHandle {
        waplus_core::orchestrator::Orchestrator::new(self.context(), config).start()
    }
}
