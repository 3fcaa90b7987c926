//! Per-job orchestration: the supervisor owns the whole sandbox lifecycle
//! and guarantees that no job stays `running` and no sandbox outlives its
//! job, whatever fails along the way.

use crate::archive::{self, MAIN_SOURCE_FILE};
use crate::demux::{self, OutputBuffers};
use crate::sandbox::{SandboxRuntime, SandboxSpec};
use crate::stats::{self, ResourceUsage};
use anyhow::{Context, Result};
use crucible_common::config::Config;
use crucible_common::store::{JobStore, StoreError};
use crucible_common::types::{Job, JobOutcome, JobStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Where staged inputs land and where the sandbox command runs.
pub const SANDBOX_WORKDIR: &str = "/app";

pub const PROJECT_LABEL_KEY: &str = "project";
pub const JOB_ID_LABEL_KEY: &str = "jobId";

const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub project_label: String,
    pub sandbox_image: String,
    pub memory_limit_bytes: i64,
    pub cpu_weight: i64,
    pub deadline_ms: u64,
    pub output_cap_bytes: usize,
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            project_label: config.project_label.clone(),
            sandbox_image: config.sandbox_image.clone(),
            memory_limit_bytes: config.memory_limit_bytes,
            cpu_weight: config.cpu_weight,
            deadline_ms: config.deadline_ms,
            output_cap_bytes: config.output_cap_bytes,
        }
    }
}

/// Mutable state of one job in flight. Owning it explicitly (rather than in
/// captured locals) lets every failure branch see exactly what must be torn
/// down: a created sandbox, a ticking collector, a ticking sampler.
struct JobRun {
    sandbox_id: Option<String>,
    started: Option<Instant>,
    timed_out: bool,
    collector: Option<JoinHandle<OutputBuffers>>,
    sampler: Option<(oneshot::Sender<()>, JoinHandle<ResourceUsage>)>,
}

impl JobRun {
    fn new() -> Self {
        Self {
            sandbox_id: None,
            started: None,
            timed_out: false,
            collector: None,
            sampler: None,
        }
    }
}

pub struct Supervisor {
    store: JobStore,
    runtime: Arc<dyn SandboxRuntime>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(store: JobStore, runtime: Arc<dyn SandboxRuntime>, config: SupervisorConfig) -> Self {
        Self {
            store,
            runtime,
            config,
        }
    }

    /// Runs one job to its terminal state. Never returns an error: every
    /// failure is recorded on the job itself, and problems recording the
    /// failure are logged for the sweeper to reconcile after a restart.
    pub async fn run_job(&self, id: uuid::Uuid) {
        let job = match self.store.get(id, None).await {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %id, error = %e, "cannot load job, refusing to run");
                return;
            }
        };
        if job.status != JobStatus::NotStarted {
            warn!(job_id = %id, status = %job.status, "refusing to run job twice");
            return;
        }

        let mut run = JobRun::new();
        if let Err(err) = self.drive(&job, &mut run).await {
            error!(job_id = %id, error = %format!("{err:#}"), "job execution failed");
            self.fail_job(id, &mut run, &err).await;
        }
    }

    async fn drive(&self, job: &Job, run: &mut JobRun) -> Result<()> {
        let id = job.id;
        self.store
            .mark_running(id)
            .await
            .context("failed to mark job running")?;
        info!(job_id = %id, phase = "running", "job started");

        let archive = archive::build_archive(&job.source, &job.input_files)
            .context("failed to stage job inputs")?;

        let sandbox_id = self
            .runtime
            .create(&self.sandbox_spec(job))
            .await
            .context("failed to create sandbox")?;
        run.sandbox_id = Some(sandbox_id.clone());
        info!(job_id = %id, sandbox_id = %sandbox_id, phase = "created", "sandbox created");

        self.store
            .attach_sandbox(id, &sandbox_id)
            .await
            .context("failed to record sandbox handle")?;

        self.runtime
            .upload(&sandbox_id, archive, SANDBOX_WORKDIR)
            .await
            .context("failed to upload inputs to sandbox")?;

        // Attach first, then open stats, then start: no output frame and no
        // early sample may be missed.
        let output = self
            .runtime
            .attach(&sandbox_id)
            .await
            .context("failed to attach to sandbox output")?;
        run.collector = Some(tokio::spawn(demux::collect(
            output,
            self.config.output_cap_bytes,
        )));

        let stats_stream = self
            .runtime
            .stats(&sandbox_id)
            .await
            .context("failed to open sandbox stats stream")?;
        let (stop_sampler, stop_rx) = oneshot::channel();
        run.sampler = Some((
            stop_sampler,
            tokio::spawn(stats::sample_peaks(stats_stream, stop_rx)),
        ));

        // The deadline is anchored to the instant captured just before
        // start: the window counted against the job begins when the sandbox
        // begins, not when the timer future first gets polled.
        let started = Instant::now();
        run.started = Some(started);
        let deadline = tokio::time::sleep_until(tokio::time::Instant::from_std(
            started + Duration::from_millis(self.config.deadline_ms),
        ));
        tokio::pin!(deadline);


        self.runtime
            .start(&sandbox_id)
            .await
            .context("failed to start sandbox")?;
        info!(job_id = %id, phase = "executing", "sandbox started");

        // Race the wait against the deadline. The deadline branch fires at
        // most once: it flags the timeout and kills, but the wait is never
        // abandoned.
        let wait = self.runtime.wait(&sandbox_id);
        tokio::pin!(wait);
        let exit_code = loop {
            tokio::select! {
                result = &mut wait => {
                    break result.context("failed waiting for sandbox exit")?;
                }
                _ = &mut deadline, if !run.timed_out => {
                    run.timed_out = true;
                    warn!(
                        job_id = %id,
                        deadline_ms = self.config.deadline_ms,
                        "deadline elapsed, killing sandbox"
                    );
                    if let Err(e) = self.runtime.kill(&sandbox_id).await {
                        warn!(job_id = %id, error = %e, "failed to kill timed-out sandbox");
                    }
                }
            }
        };
        let execution_ms = started.elapsed().as_millis() as u64;

        // Tear down observers: stop the sampler, let the collector drain the
        // closed stream. Joining both is the barrier after which the buffers
        // and peaks are safe to read.
        let (buffers, usage) = self.settle_observers(run).await;

        let outcome = JobOutcome {
            stdout: buffers.stdout,
            stderr: buffers.stderr,
            crashed: !run.timed_out && exit_code != 0,
            timed_out: run.timed_out,
            peak_memory_mb: usage.peak_memory_mb,
            peak_cpu_pct: usage.peak_cpu_pct,
            execution_ms,
        };
        info!(
            job_id = %id,
            phase = "finished",
            exit_code,
            crashed = outcome.crashed,
            timed_out = outcome.timed_out,
            execution_ms,
            peak_memory_mb = outcome.peak_memory_mb,
            peak_cpu_pct = outcome.peak_cpu_pct,
            "sandbox exited"
        );

        self.finalize_with_retry(id, &outcome)
            .await
            .context("failed to finalize job")?;

        if let Err(e) = self.runtime.remove(&sandbox_id, true).await {
            warn!(
                job_id = %id,
                sandbox_id = %sandbox_id,
                error = %e,
                "failed to remove sandbox; the startup sweeper will reclaim it"
            );
        }
        run.sandbox_id = None;
        info!(job_id = %id, phase = "done", "job completed");
        Ok(())
    }

    /// Common funnel for every failure branch: record the error as a crashed
    /// outcome and make sure no sandbox survives.
    async fn fail_job(&self, id: uuid::Uuid, run: &mut JobRun, err: &anyhow::Error) {
        if let Some((stop, handle)) = run.sampler.take() {
            let _ = stop.send(());
            handle.abort();
        }
        if let Some(handle) = run.collector.take() {
            handle.abort();
        }

        let mut stderr = format!("{err:#}").into_bytes();
        stderr.truncate(self.config.output_cap_bytes);
        let outcome = JobOutcome {
            stdout: Vec::new(),
            stderr,
            crashed: true,
            timed_out: run.timed_out,
            peak_memory_mb: 0.0,
            peak_cpu_pct: 0.0,
            execution_ms: run
                .started
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0),
        };

        if let Err(e) = self.finalize_with_retry(id, &outcome).await {
            error!(
                job_id = %id,
                error = %e,
                "could not record job failure; the sweeper will reconcile on restart"
            );
        }

        if let Some(sandbox_id) = run.sandbox_id.take() {
            if let Err(e) = self.runtime.remove(&sandbox_id, true).await {
                error!(
                    job_id = %id,
                    sandbox_id = %sandbox_id,
                    error = %e,
                    "failed to remove sandbox after job failure"
                );
            }
        }
    }

    async fn settle_observers(&self, run: &mut JobRun) -> (OutputBuffers, ResourceUsage) {
        let usage = match run.sampler.take() {
            Some((stop, handle)) => {
                let _ = stop.send(());
                handle.await.unwrap_or_default()
            }
            None => ResourceUsage::default(),
        };
        let buffers = match run.collector.take() {
            Some(handle) => handle
                .await
                .unwrap_or_else(|_| OutputBuffers::new(self.config.output_cap_bytes)),
            None => OutputBuffers::new(self.config.output_cap_bytes),
        };
        (buffers, usage)
    }

    /// Finalization is the one write the engine cannot paper over; storage
    /// hiccups get a few linearly backed-off retries before the error is
    /// surfaced to the operator.
    async fn finalize_with_retry(
        &self,
        id: uuid::Uuid,
        outcome: &JobOutcome,
    ) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self.store.finalize(id, outcome).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Database(e)) if attempt < FINALIZE_ATTEMPTS => {
                    warn!(job_id = %id, attempt, error = %e, "finalize failed, retrying");
                    tokio::time::sleep(FINALIZE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn sandbox_spec(&self, job: &Job) -> SandboxSpec {
        let main_class = MAIN_SOURCE_FILE.trim_end_matches(".java");
        let mut script =
            format!("cd {SANDBOX_WORKDIR} && javac {MAIN_SOURCE_FILE} && java {main_class}");
        for arg in &job.args {
            script.push(' ');
            script.push_str(&archive::shell_quote(arg));
        }

        let mut labels = HashMap::new();
        labels.insert(
            PROJECT_LABEL_KEY.to_string(),
            self.config.project_label.clone(),
        );
        labels.insert(JOB_ID_LABEL_KEY.to_string(), job.id.to_string());

        SandboxSpec {
            image: self.config.sandbox_image.clone(),
            command: vec!["sh".to_string(), "-c".to_string(), script],
            working_dir: SANDBOX_WORKDIR.to_string(),
            memory_limit_bytes: self.config.memory_limit_bytes,
            cpu_weight: self.config.cpu_weight,
            labels,
        }
    }

    /// Startup reconciliation: force-remove every sandbox carrying our
    /// project label, then re-finalize jobs a previous process left in
    /// `running`. Runs before the service accepts new submissions.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let sandboxes = self
            .runtime
            .list_labeled(PROJECT_LABEL_KEY, &self.config.project_label)
            .await
            .context("failed to list sandboxes for sweeping")?;

        let mut removed = 0;
        for sandbox_id in &sandboxes {
            match self.runtime.remove(sandbox_id, true).await {
                Ok(()) => {
                    info!(sandbox_id = %sandbox_id, "removed orphaned sandbox");
                    removed += 1;
                }
                Err(e) => {
                    warn!(sandbox_id = %sandbox_id, error = %e, "failed to remove orphaned sandbox");
                }
            }
        }

        let reaped = self
            .store
            .reap_running("job interrupted by service restart")
            .await
            .context("failed to reap interrupted jobs")?;
        if reaped > 0 {
            warn!(reaped, "re-finalized jobs left running by a previous process");
        }

        Ok(removed)
    }
}
