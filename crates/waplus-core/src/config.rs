//! Runtime settings: an optional TOML file, then environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheConfig, DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_TTL};
use crate::loader::ConstraintPolicy;
use crate::orchestrator::{
    ClassificationTable, PipelineConfig, RetryPolicy, StageTimeouts, DEFAULT_BASE_DELAY,
    DEFAULT_CLAIM_LEASE, DEFAULT_CLAIM_POLL, DEFAULT_LOAD_TIMEOUT, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_MULTIPLIER, DEFAULT_PARSE_TIMEOUT, DEFAULT_QUEUE_CAPACITY, DEFAULT_TRANSFORM_TIMEOUT,
    DEFAULT_WORKERS,
};
use crate::transform::DEFAULT_SAMPLE_LIMIT;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file is invalid: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("environment variable {name} has invalid value `{value}`")]
    Env { name: &'static str, value: String },

    #[error("invalid setting {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub claim_lease_secs: u64,
    pub claim_poll_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            claim_lease_secs: DEFAULT_CLAIM_LEASE.as_secs(),
            claim_poll_ms: DEFAULT_CLAIM_POLL.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub parse_secs: u64,
    pub transform_secs: u64,
    pub load_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            parse_secs: DEFAULT_PARSE_TIMEOUT.as_secs(),
            transform_secs: DEFAULT_TRANSFORM_TIMEOUT.as_secs(),
            load_secs: DEFAULT_LOAD_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    pub constraint_policy: ConstraintPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSettings {
    pub rejection_sample_limit: usize,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            rejection_sample_limit: DEFAULT_SAMPLE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub pipeline: PipelineSettings,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    pub cache: CacheSettings,
    pub loader: LoaderSettings,
    pub transform: TransformSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reads `.env`, the optional TOML file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut settings = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        settings.apply_env_overrides(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Applies `WAPLUS_*` overrides. `lookup` stands in for the environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").or_else(|| lookup("WAPLUS_DATABASE_URL")) {
            self.database.url = Some(url);
        }
        if let Some(workers) = parse_env(&lookup, "WAPLUS_WORKERS")? {
            self.pipeline.workers = workers;
        }
        if let Some(capacity) = parse_env(&lookup, "WAPLUS_QUEUE_CAPACITY")? {
            self.pipeline.queue_capacity = capacity;
        }
        if let Some(attempts) = parse_env(&lookup, "WAPLUS_MAX_ATTEMPTS")? {
            self.retry.max_attempts = attempts;
        }
        if let Some(ttl) = parse_env(&lookup, "WAPLUS_CACHE_TTL_SECS")? {
            self.cache.ttl_secs = ttl;
        }
        if let Some(format) = lookup("WAPLUS_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => {
                    return Err(ConfigError::Env {
                        name: "WAPLUS_LOG_FORMAT",
                        value: format,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, message: &str| {
            Err(ConfigError::Invalid {
                field,
                message: message.to_string(),
            })
        };
        if self.pipeline.workers == 0 {
            return invalid("pipeline.workers", "must be at least 1");
        }
        if self.pipeline.queue_capacity == 0 {
            return invalid("pipeline.queue_capacity", "must be at least 1");
        }
        if self.pipeline.claim_poll_ms == 0 {
            return invalid("pipeline.claim_poll_ms", "must be at least 1");
        }
        let stage_total = self
            .timeouts
            .parse_secs
            .saturating_add(self.timeouts.transform_secs)
            .saturating_add(self.timeouts.load_secs);
        if self.pipeline.claim_lease_secs < stage_total {
            return Err(ConfigError::Invalid {
                field: "pipeline.claim_lease_secs",
                message: format!("must cover the stage timeouts ({stage_total}s in total)"),
            });
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts", "must be at least 1");
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier", "must be 1.0 or greater");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms", "must not be below retry.base_delay_ms");
        }
        if self.cache.max_entries == 0 {
            return invalid("cache.max_entries", "must be at least 1");
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.pipeline.workers,
            queue_capacity: self.pipeline.queue_capacity,
            claim_lease: Duration::from_secs(self.pipeline.claim_lease_secs),
            claim_poll: Duration::from_millis(self.pipeline.claim_poll_ms),
            timeouts: StageTimeouts {
                parse: Duration::from_secs(self.timeouts.parse_secs),
                transform: Duration::from_secs(self.timeouts.transform_secs),
                load: Duration::from_secs(self.timeouts.load_secs),
            },
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                multiplier: self.retry.multiplier,
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            classification: ClassificationTable::default(),
            constraint_policy: self.loader.constraint_policy,
            sample_limit: self.transform.rejection_sample_limit,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.cache.ttl_secs),
            max_entries: self.cache.max_entries,
        }
    }
}

fn parse_env<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { name, value }),
    }
}
