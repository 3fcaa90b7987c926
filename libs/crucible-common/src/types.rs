use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a job. Transitions are monotonic: `NotStarted` -> `Running`
/// -> `Done`. A record never moves backwards, and once `Done` it is
/// immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Running,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not_started",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(JobStatus::NotStarted),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named companion file staged into the sandbox next to the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub name: String,
    pub content: String,
}

/// Everything a client supplies at submission time.
#[derive(Debug, Clone)]
pub struct JobSeed {
    pub owner: String,
    pub source: String,
    pub args: Vec<String>,
    pub input_files: Vec<InputFile>,
}

/// One submission, tracked end-to-end.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub owner: String,
    pub status: JobStatus,
    pub source: String,
    pub args: Vec<String>,
    pub input_files: Vec<InputFile>,
    pub sandbox_id: Option<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub crashed: bool,
    pub timed_out: bool,
    pub peak_memory_mb: f64,
    pub peak_cpu_pct: f64,
    pub execution_ms: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal fields written in one atomic store update when a job finishes.
/// `timed_out` means the sandbox was forcibly terminated at the deadline and
/// dominates the exit code; `crashed` means a non-zero exit without timeout.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub crashed: bool,
    pub timed_out: bool,
    pub peak_memory_mb: f64,
    pub peak_cpu_pct: f64,
    pub execution_ms: u64,
}

/// Listing row, newest-first by creation time.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub status: JobStatus,
    pub crashed: bool,
    pub timed_out: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
}

/// Aggregate counters for the admin CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub total_jobs: i64,
    pub not_started: i64,
    pub running: i64,
    pub done: i64,
    pub crashed: i64,
    pub timed_out: i64,
    pub avg_execution_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for status in [JobStatus::NotStarted, JobStatus::Running, JobStatus::Done] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_str("failed"), None);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::NotStarted).unwrap(),
            "\"not_started\""
        );
    }
}
