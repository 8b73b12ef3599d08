use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transform::RejectionReport;
use crate::types::{Checksum, SourceFile};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Discovered,
    Parsing,
    Transforming,
    Loading,
    Completed,
    Failed,
    Quarantined,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Discovered => "discovered",
            JobState::Parsing => "parsing",
            JobState::Transforming => "transforming",
            JobState::Loading => "loading",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Quarantined => "quarantined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Quarantined
        )
    }

    /// Terminal states accept nothing. Any live state may fail, be quarantined,
    /// or restart at `Parsing` for a retry; forward moves follow the stage order,
    /// plus the `Discovered -> Completed` dedup short-circuit.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Failed | JobState::Quarantined | JobState::Parsing => true,
            JobState::Transforming => *self == JobState::Parsing,
            JobState::Loading => *self == JobState::Transforming,
            JobState::Completed => matches!(self, JobState::Loading | JobState::Discovered),
            JobState::Discovered => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "discovered" => Ok(JobState::Discovered),
            "parsing" => Ok(JobState::Parsing),
            "transforming" => Ok(JobState::Transforming),
            "loading" => Ok(JobState::Loading),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "quarantined" => Ok(JobState::Quarantined),
            other => Err(format!("unknown job state `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: Uuid,
    pub checksum: Checksum,
    pub uri: String,
    pub format: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub records_loaded: u64,
    pub records_rejected: u64,
    pub rejection_report: Option<RejectionReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestionJob {
    pub fn discovered(source: &SourceFile) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            checksum: source.checksum.clone(),
            uri: source.uri.clone(),
            format: source.format.clone(),
            state: JobState::Discovered,
            attempt_count: 0,
            last_error: None,
            records_loaded: 0,
            records_rejected: 0,
            rejection_report: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.job_id,
            state: self.state,
            last_error: self.last_error.clone(),
            attempt_count: self.attempt_count,
            updated_at: self.updated_at,
        }
    }

    /// Applies an update in place. Callers check the transition first.
    pub fn apply(&mut self, update: JobUpdate) {
        let now = Utc::now();
        self.state = update.state;
        if let Some(attempt) = update.attempt_count {
            self.attempt_count = attempt;
        }
        if update.last_error.is_some() {
            self.last_error = update.last_error;
        }
        if let Some(loaded) = update.records_loaded {
            self.records_loaded = loaded;
        }
        if let Some(rejected) = update.records_rejected {
            self.records_rejected = rejected;
        }
        if update.rejection_report.is_some() {
            self.rejection_report = update.rejection_report;
        }
        self.updated_at = now;
        if self.state.is_terminal() {
            self.finished_at = Some(now);
        }
    }
}

/// Operator-facing answer to "what happened to this checksum".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub state: JobState,
    pub last_error: Option<String>,
    pub attempt_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub state: JobState,
    pub attempt_count: Option<u32>,
    pub last_error: Option<String>,
    pub records_loaded: Option<u64>,
    pub records_rejected: Option<u64>,
    pub rejection_report: Option<RejectionReport>,
}

impl JobUpdate {
    pub fn to(state: JobState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt_count = Some(attempt);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(message.into());
        self
    }

    pub fn report(mut self, loaded: u64, report: RejectionReport) -> Self {
        self.records_loaded = Some(loaded);
        self.records_rejected = Some(report.total);
        self.rejection_report = Some(report);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::JobState::*;

    #[test]
    fn terminal_states_are_immutable() {
        for terminal in [Completed, Failed, Quarantined] {
            for next in [Parsing, Transforming, Loading, Completed, Failed, Quarantined] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn stages_advance_in_order() {
        assert!(Discovered.can_transition_to(Parsing));
        assert!(Parsing.can_transition_to(Transforming));
        assert!(Transforming.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Completed));
        assert!(Discovered.can_transition_to(Completed));
        assert!(!Parsing.can_transition_to(Loading));
        assert!(!Transforming.can_transition_to(Completed));
        assert!(Loading.can_transition_to(Parsing));
        assert!(Parsing.can_transition_to(Quarantined));
    }

    #[test]
    fn states_round_trip_through_strings() {
        for state in [Discovered, Parsing, Transforming, Loading, Completed, Failed, Quarantined] {
            assert_eq!(state.as_str().parse::<super::JobState>(), Ok(state));
        }
    }
}
