use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Bounded exponential backoff. Attempts are 1-based.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Pause before the attempt following `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Retry,
    Quarantine,
    Fail,
}

/// Failure kind to disposition mapping. Kinds absent from the table fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationTable {
    entries: HashMap<FailureKind, Disposition>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        use Disposition::*;
        use FailureKind::*;
        let entries = [
            (Parse, Quarantine),
            (StageTimeout, Retry),
            (SourceIo, Retry),
            (StoreConflict, Retry),
            (ClaimConflict, Retry),
            (StoreConstraint, Fail),
            (ChecksumMismatch, Fail),
            (Cancelled, Fail),
            (Internal, Fail),
        ]
        .into_iter()
        .collect();
        Self { entries }
    }
}

impl ClassificationTable {
    pub fn with(mut self, kind: FailureKind, disposition: Disposition) -> Self {
        self.entries.insert(kind, disposition);
        self
    }

    pub fn classify(&self, kind: FailureKind) -> Disposition {
        self.entries.get(&kind).copied().unwrap_or(Disposition::Fail)
    }
}
