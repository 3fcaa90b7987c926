//! Durable persistence for jobs and API keys.
//!
//! A single local SQLite file backs the whole service. Status transitions
//! are guarded inside the UPDATE statements themselves, so concurrent
//! writers serialize in the database and exactly one finalize wins.

use crate::types::{
    ApiKey, InputFile, Job, JobOutcome, JobSeed, JobStatus, JobSummary, ServiceStats,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

fn corrupt(message: String) -> StoreError {
    StoreError::Database(sqlx::Error::Decode(message.into()))
}

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Opens (creating if missing) the database file and runs migrations.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same ephemeral database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'not_started',
                source TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                input_files TEXT NOT NULL DEFAULT '[]',
                sandbox_id TEXT,
                stdout BLOB NOT NULL DEFAULT x'',
                stderr BLOB NOT NULL DEFAULT x'',
                crashed INTEGER NOT NULL DEFAULT 0,
                timed_out INTEGER NOT NULL DEFAULT 0,
                peak_memory_mb REAL NOT NULL DEFAULT 0,
                peak_cpu_pct REAL NOT NULL DEFAULT 0,
                execution_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_owner_created ON jobs(owner, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                key TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts a new job with status `not_started`.
    pub async fn create(&self, seed: &JobSeed) -> Result<Job, StoreError> {
        let job = Job {
            id: Uuid::new_v4(),
            owner: seed.owner.clone(),
            status: JobStatus::NotStarted,
            source: seed.source.clone(),
            args: seed.args.clone(),
            input_files: seed.input_files.clone(),
            sandbox_id: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            crashed: false,
            timed_out: false,
            peak_memory_mb: 0.0,
            peak_cpu_pct: 0.0,
            execution_ms: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (id, owner, status, source, args, input_files, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.owner)
        .bind(job.status.as_str())
        .bind(&job.source)
        .bind(serde_json::to_string(&job.args)?)
        .bind(serde_json::to_string(&job.input_files)?)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    /// Transitions `not_started` -> `running` and stamps `started_at`.
    /// Re-entry while already `running` is a no-op; a finished job rejects
    /// the transition.
    pub async fn mark_running(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ?1 \
             WHERE id = ?2 AND status = 'not_started'",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.status_of(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(JobStatus::Running) => Ok(()),
            Some(from) => Err(StoreError::InvalidTransition {
                id,
                from,
                to: JobStatus::Running,
            }),
        }
    }

    /// Records the runtime handle of the sandbox executing this job.
    pub async fn attach_sandbox(&self, id: Uuid, sandbox_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET sandbox_id = ?1 WHERE id = ?2")
            .bind(sandbox_id)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Writes every terminal field and status `done` atomically. The guard
    /// on the current status makes repeated finalization fail with
    /// `InvalidTransition`: exactly one concurrent caller wins.
    pub async fn finalize(&self, id: Uuid, outcome: &JobOutcome) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done', stdout = ?1, stderr = ?2, crashed = ?3, timed_out = ?4,
                peak_memory_mb = ?5, peak_cpu_pct = ?6, execution_ms = ?7, completed_at = ?8
            WHERE id = ?9 AND status != 'done'
            "#,
        )
        .bind(outcome.stdout.clone())
        .bind(outcome.stderr.clone())
        .bind(outcome.crashed)
        .bind(outcome.timed_out)
        .bind(outcome.peak_memory_mb)
        .bind(outcome.peak_cpu_pct)
        .bind(outcome.execution_ms as i64)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.status_of(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(from) => Err(StoreError::InvalidTransition {
                id,
                from,
                to: JobStatus::Done,
            }),
        }
    }

    /// Fetches one job. When `owner` is given, a job belonging to someone
    /// else is indistinguishable from a missing one.
    pub async fn get(&self, id: Uuid, owner: Option<&str>) -> Result<Job, StoreError> {
        let row: Option<JobRow> = match owner {
            Some(owner) => {
                sqlx::query_as(&format!("{JOB_SELECT} WHERE id = ?1 AND owner = ?2"))
                    .bind(id.to_string())
                    .bind(owner)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as(&format!("{JOB_SELECT} WHERE id = ?1"))
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        row.ok_or(StoreError::NotFound(id))?.into_job()
    }

    /// Lists an owner's jobs, newest first.
    pub async fn list(
        &self,
        owner: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobSummary>, StoreError> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            r#"
            SELECT id, status, crashed, timed_out, created_at, completed_at
            FROM jobs
            WHERE owner = ?1
            ORDER BY created_at DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(owner)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    /// Re-finalizes every job stuck in `running` as crashed with an
    /// explanatory message. Used by the startup sweeper.
    pub async fn reap_running(&self, reason: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'done', crashed = 1, stderr = ?1, completed_at = ?2 \
             WHERE status = 'running'",
        )
        .bind(reason.as_bytes().to_vec())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn status_of(&self, id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        let status: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match status {
            None => Ok(None),
            Some((raw,)) => JobStatus::from_str(&raw)
                .map(Some)
                .ok_or_else(|| corrupt(format!("unknown job status '{raw}'"))),
        }
    }

    /// Generates and stores a fresh API key.
    pub async fn create_key(&self, description: &str) -> Result<ApiKey, StoreError> {
        let key = ApiKey {
            key: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            description: description.to_string(),
        };

        sqlx::query("INSERT INTO api_keys (key, created_at, description) VALUES (?1, ?2, ?3)")
            .bind(&key.key)
            .bind(key.created_at)
            .bind(&key.description)
            .execute(&self.pool)
            .await?;

        Ok(key)
    }

    pub async fn key_exists(&self, key: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM api_keys WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_keys(&self) -> Result<Vec<ApiKey>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>, String)> =
            sqlx::query_as("SELECT key, created_at, description FROM api_keys ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(key, created_at, description)| ApiKey {
                key,
                created_at,
                description,
            })
            .collect())
    }

    /// Returns whether a key was actually deleted.
    pub async fn revoke_key(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn stats(&self) -> Result<ServiceStats, StoreError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT COUNT(*) AS total_jobs,
                   COALESCE(SUM(status = 'not_started'), 0) AS not_started,
                   COALESCE(SUM(status = 'running'), 0) AS running,
                   COALESCE(SUM(status = 'done'), 0) AS done,
                   COALESCE(SUM(crashed), 0) AS crashed,
                   COALESCE(SUM(timed_out), 0) AS timed_out,
                   COALESCE(AVG(CASE WHEN status = 'done' THEN execution_ms END), 0.0)
                       AS avg_execution_ms
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ServiceStats {
            total_jobs: row.total_jobs,
            not_started: row.not_started,
            running: row.running,
            done: row.done,
            crashed: row.crashed,
            timed_out: row.timed_out,
            avg_execution_ms: row.avg_execution_ms,
        })
    }
}

const JOB_SELECT: &str = "SELECT id, owner, status, source, args, input_files, sandbox_id, \
     stdout, stderr, crashed, timed_out, peak_memory_mb, peak_cpu_pct, execution_ms, \
     created_at, started_at, completed_at FROM jobs";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    owner: String,
    status: String,
    source: String,
    args: String,
    input_files: String,
    sandbox_id: Option<String>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    crashed: bool,
    timed_out: bool,
    peak_memory_mb: f64,
    peak_cpu_pct: f64,
    execution_ms: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> Result<Job, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| corrupt(format!("malformed job id '{}': {e}", self.id)))?;
        let status = JobStatus::from_str(&self.status)
            .ok_or_else(|| corrupt(format!("unknown job status '{}'", self.status)))?;
        let args: Vec<String> = serde_json::from_str(&self.args)?;
        let input_files: Vec<InputFile> = serde_json::from_str(&self.input_files)?;

        Ok(Job {
            id,
            owner: self.owner,
            status,
            source: self.source,
            args,
            input_files,
            sandbox_id: self.sandbox_id,
            stdout: self.stdout,
            stderr: self.stderr,
            crashed: self.crashed,
            timed_out: self.timed_out,
            peak_memory_mb: self.peak_memory_mb,
            peak_cpu_pct: self.peak_cpu_pct,
            execution_ms: self.execution_ms.max(0) as u64,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    status: String,
    crashed: bool,
    timed_out: bool,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl SummaryRow {
    fn into_summary(self) -> Result<JobSummary, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| corrupt(format!("malformed job id '{}': {e}", self.id)))?;
        let status = JobStatus::from_str(&self.status)
            .ok_or_else(|| corrupt(format!("unknown job status '{}'", self.status)))?;

        Ok(JobSummary {
            id,
            status,
            crashed: self.crashed,
            timed_out: self.timed_out,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    total_jobs: i64,
    not_started: i64,
    running: i64,
    done: i64,
    crashed: i64,
    timed_out: i64,
    avg_execution_ms: f64,
}
