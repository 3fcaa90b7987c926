//! Supervisor lifecycle tests against a scripted in-process runtime, plus
//! end-to-end scenarios against a live Docker daemon (ignored by default).

use crate::demux::{FrameDecoder, STDERR_TAG, STDOUT_TAG};
use crate::sandbox::{OutputStream, SandboxError, SandboxRuntime, SandboxSpec, StatsStream};
use crate::stats::StatsSample;
use crate::supervisor::{Supervisor, SupervisorConfig};
use async_trait::async_trait;
use crucible_common::store::JobStore;
use crucible_common::types::{InputFile, JobSeed, JobStatus};
use futures_util::{stream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        project_label: "crucible-test".to_string(),
        sandbox_image: "openjdk:17-alpine".to_string(),
        memory_limit_bytes: 512 * 1024 * 1024,
        cpu_weight: 512,
        deadline_ms: 5_000,
        output_cap_bytes: 10_000,
    }
}

fn seed(source: &str) -> JobSeed {
    JobSeed {
        owner: "tenant".to_string(),
        source: source.to_string(),
        args: Vec::new(),
        input_files: Vec::new(),
    }
}

/// Encodes one frame of the runtime's multiplexed wire format.
fn wire_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![tag, 0, 0, 0];
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[derive(Default)]
struct MockState {
    created: Vec<String>,
    uploaded: Vec<String>,
    started: Vec<String>,
    killed: Vec<String>,
    removed: Vec<String>,
}

/// Scripted sandbox runtime: serves a canned multiplexed output stream and
/// stats frames, exits with a configured code after a configured delay, and
/// exits early with 137 when killed.
struct MockRuntime {
    exit_code: i64,
    wait_delay: Duration,
    wire_output: Vec<u8>,
    stats: Vec<StatsSample>,
    fail_create: bool,
    fail_upload: bool,
    preexisting: Vec<String>,
    kill_signal: Notify,
    state: Mutex<MockState>,
}

impl MockRuntime {
    fn new() -> Self {
        Self {
            exit_code: 0,
            wait_delay: Duration::from_millis(10),
            wire_output: wire_frame(STDOUT_TAG, b"hi\n"),
            stats: vec![StatsSample {
                cpu_total_ns: 2_000,
                precpu_total_ns: 1_000,
                system_cpu_ns: Some(4_000),
                presystem_cpu_ns: Some(2_000),
                online_cpus: 2,
                memory_usage_bytes: 48 * 1024 * 1024,
            }],
            fail_create: false,
            fail_upload: false,
            preexisting: Vec::new(),
            kill_signal: Notify::new(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        if self.fail_create {
            return Err(SandboxError::Other("no such image".to_string()));
        }
        assert_eq!(spec.labels.get("project").unwrap(), "crucible-test");
        assert!(spec.labels.contains_key("jobId"));
        let id = format!("sbx-{}", self.state().created.len() + 1);
        self.state().created.push(id.clone());
        Ok(id)
    }

    async fn upload(&self, id: &str, archive: Vec<u8>, _path: &str) -> Result<(), SandboxError> {
        if self.fail_upload {
            return Err(SandboxError::Other("filesystem is read-only".to_string()));
        }
        assert!(!archive.is_empty());
        self.state().uploaded.push(id.to_string());
        Ok(())
    }

    async fn attach(&self, _id: &str) -> Result<OutputStream, SandboxError> {
        // The daemon-side transport would decode the wire framing; replay it
        // through the same decoder the engine ships.
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&self.wire_output);
        Ok(stream::iter(frames.into_iter().map(Ok)).boxed())
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.state().started.push(id.to_string());
        Ok(())
    }

    async fn stats(&self, _id: &str) -> Result<StatsStream, SandboxError> {
        Ok(stream::iter(self.stats.clone().into_iter().map(Ok)).boxed())
    }

    async fn wait(&self, _id: &str) -> Result<i64, SandboxError> {
        tokio::select! {
            _ = tokio::time::sleep(self.wait_delay) => Ok(self.exit_code),
            _ = self.kill_signal.notified() => Ok(137),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.state().killed.push(id.to_string());
        self.kill_signal.notify_one();
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), SandboxError> {
        assert!(force);
        self.state().removed.push(id.to_string());
        Ok(())
    }

    async fn list_labeled(&self, key: &str, value: &str) -> Result<Vec<String>, SandboxError> {
        assert_eq!(key, "project");
        assert_eq!(value, "crucible-test");
        Ok(self.preexisting.clone())
    }
}

async fn run_with(mock: MockRuntime, config: SupervisorConfig) -> (Arc<MockRuntime>, JobStore, uuid::Uuid) {
    let store = JobStore::open_in_memory().await.unwrap();
    let job = store.create(&seed("public class Main {}")).await.unwrap();
    let mock = Arc::new(mock);
    let supervisor = Supervisor::new(store.clone(), mock.clone(), config);
    supervisor.run_job(job.id).await;
    (mock, store, job.id)
}

#[tokio::test]
async fn successful_run_records_output_peaks_and_removes_sandbox() {
    let (mock, store, id) = run_with(MockRuntime::new(), test_config()).await;

    let job = store.get(id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(!job.crashed);
    assert!(!job.timed_out);
    assert_eq!(job.stdout, b"hi\n");
    assert!(job.stderr.is_empty());
    assert_eq!(job.sandbox_id.as_deref(), Some("sbx-1"));
    assert_eq!(job.peak_memory_mb, 48.0);
    assert!((job.peak_cpu_pct - 100.0).abs() < f64::EPSILON);
    assert!(job.execution_ms < 5_000);
    assert!(job.completed_at.unwrap() >= job.started_at.unwrap());

    let state = mock.state();
    assert_eq!(state.started, vec!["sbx-1"]);
    assert_eq!(state.removed, vec!["sbx-1"]);
    assert!(state.killed.is_empty());
}

#[tokio::test]
async fn nonzero_exit_is_a_crash_not_a_timeout() {
    let mut mock = MockRuntime::new();
    mock.exit_code = 3;
    mock.wire_output = wire_frame(STDERR_TAG, b"Exception in thread \"main\"\n");
    let (mock, store, id) = run_with(mock, test_config()).await;

    let job = store.get(id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.crashed);
    assert!(!job.timed_out);
    assert!(!job.stderr.is_empty());
    assert_eq!(mock.state().removed.len(), 1);
}

#[tokio::test]
async fn deadline_kills_the_sandbox_and_timeout_dominates() {
    let mut mock = MockRuntime::new();
    mock.wait_delay = Duration::from_secs(60);
    let mut config = test_config();
    config.deadline_ms = 150;
    let (mock, store, id) = run_with(mock, config).await;

    let job = store.get(id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.timed_out);
    // The sandbox was killed (exit 137), but timeout dominates the exit code.
    assert!(!job.crashed);
    assert!(job.execution_ms >= 150);
    // Output produced before the kill is kept.
    assert_eq!(job.stdout, b"hi\n");

    let state = mock.state();
    assert_eq!(state.killed, vec!["sbx-1"]);
    assert_eq!(state.removed, vec!["sbx-1"]);
}

#[tokio::test]
async fn create_failure_finalizes_the_job_as_crashed() {
    let mut mock = MockRuntime::new();
    mock.fail_create = true;
    let (mock, store, id) = run_with(mock, test_config()).await;

    let job = store.get(id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.crashed);
    let stderr = String::from_utf8_lossy(&job.stderr).into_owned();
    assert!(stderr.contains("failed to create sandbox"), "stderr: {stderr}");
    // Nothing was created, so nothing to remove.
    assert!(mock.state().removed.is_empty());
}

#[tokio::test]
async fn upload_failure_still_removes_the_created_sandbox() {
    let mut mock = MockRuntime::new();
    mock.fail_upload = true;
    let (mock, store, id) = run_with(mock, test_config()).await;

    let job = store.get(id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.crashed);
    assert_eq!(mock.state().removed, vec!["sbx-1"]);
}

#[tokio::test]
async fn output_is_capped_during_collection() {
    let mut mock = MockRuntime::new();
    mock.wire_output = wire_frame(STDOUT_TAG, &vec![b'a'; 150]);
    let mut config = test_config();
    config.output_cap_bytes = 50;
    let (_mock, store, id) = run_with(mock, config).await;

    let job = store.get(id, None).await.unwrap();
    assert_eq!(job.stdout.len(), 50);
}

#[tokio::test]
async fn a_job_is_never_run_twice() {
    let store = JobStore::open_in_memory().await.unwrap();
    let job = store.create(&seed("public class Main {}")).await.unwrap();
    let mock = Arc::new(MockRuntime::new());
    let supervisor = Supervisor::new(store.clone(), mock.clone(), test_config());

    supervisor.run_job(job.id).await;
    supervisor.run_job(job.id).await;

    assert_eq!(mock.state().created.len(), 1);
    assert_eq!(store.get(job.id, None).await.unwrap().status, JobStatus::Done);
}

#[tokio::test]
async fn sweeper_removes_labeled_sandboxes_and_reaps_running_jobs() {
    let store = JobStore::open_in_memory().await.unwrap();
    let stuck = store.create(&seed("public class Main {}")).await.unwrap();
    store.mark_running(stuck.id).await.unwrap();

    let mut mock = MockRuntime::new();
    mock.preexisting = vec!["old-1".to_string(), "old-2".to_string()];
    let mock = Arc::new(mock);
    let supervisor = Supervisor::new(store.clone(), mock.clone(), test_config());

    let removed = supervisor.sweep_orphans().await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(mock.state().removed, vec!["old-1", "old-2"]);

    let job = store.get(stuck.id, None).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.crashed);
    assert!(String::from_utf8_lossy(&job.stderr).contains("restart"));
}

// ---------------------------------------------------------------------------
// End-to-end scenarios against a live Docker daemon.
// ---------------------------------------------------------------------------

mod docker_e2e {
    use super::*;
    use crate::docker::DockerRuntime;
    use crucible_common::types::Job;

    async fn run_source(
        source: &str,
        args: Vec<String>,
        input_files: Vec<InputFile>,
        deadline_ms: u64,
    ) -> Job {
        let store = JobStore::open_in_memory().await.unwrap();
        let runtime = DockerRuntime::connect(None).expect("Docker daemon not reachable");
        let mut config = test_config();
        config.deadline_ms = deadline_ms;
        let supervisor = Supervisor::new(store.clone(), Arc::new(runtime), config);

        let job = store
            .create(&JobSeed {
                owner: "e2e".to_string(),
                source: source.to_string(),
                args,
                input_files,
            })
            .await
            .unwrap();
        supervisor.run_job(job.id).await;
        store.get(job.id, None).await.unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn hello_world() {
        let job = run_source(
            "public class Main { public static void main(String[] a) { System.out.println(\"hi\"); } }",
            Vec::new(),
            Vec::new(),
            10_000,
        )
        .await;

        assert_eq!(job.status, JobStatus::Done);
        assert!(!job.crashed, "stderr: {}", String::from_utf8_lossy(&job.stderr));
        assert!(!job.timed_out);
        assert_eq!(job.stdout, b"hi\n");
        assert!(job.execution_ms < 10_000);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn arguments_are_passed_in_order() {
        let job = run_source(
            "public class Main { public static void main(String[] a) { \
                System.out.println(a.length); \
                for (String s : a) System.out.println(s); } }",
            vec!["x".to_string(), "y".to_string(), "z with space".to_string()],
            Vec::new(),
            10_000,
        )
        .await;

        let stdout = String::from_utf8_lossy(&job.stdout).into_owned();
        assert!(stdout.starts_with("3\n"), "stdout: {stdout}");
        assert_eq!(stdout, "3\nx\ny\nz with space\n");
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn input_files_are_readable_by_name() {
        let source = r#"
import java.nio.file.*;
public class Main {
    public static void main(String[] a) throws Exception {
        String text = Files.readString(Path.of("numbers.txt")).trim();
        int sum = 0;
        for (String part : text.split("\\s+")) sum += Integer.parseInt(part);
        System.out.println("Sum: " + sum);
    }
}
"#;
        let job = run_source(
            source,
            Vec::new(),
            vec![InputFile {
                name: "numbers.txt".to_string(),
                content: "10 20 30 40 50".to_string(),
            }],
            10_000,
        )
        .await;

        let stdout = String::from_utf8_lossy(&job.stdout).into_owned();
        assert!(stdout.contains("Sum: 150"), "stdout: {stdout}");
    }

    #[tokio::test]
    #[ignore] // Requires Docker - runs for the full deadline
    async fn long_running_program_times_out() {
        let source = r#"
public class Main {
    public static void main(String[] a) throws Exception {
        for (int i = 0; i < 20; i++) {
            System.out.println("tick " + i);
            Thread.sleep(1000);
        }
    }
}
"#;
        let job = run_source(source, Vec::new(), Vec::new(), 10_000).await;

        assert!(job.timed_out);
        assert!(!job.crashed);
        assert!(job.execution_ms >= 10_000);
        assert!(String::from_utf8_lossy(&job.stdout).contains("tick 0"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn uncaught_exception_is_a_crash() {
        let job = run_source(
            "public class Main { public static void main(String[] a) { \
                throw new RuntimeException(\"boom\"); } }",
            Vec::new(),
            Vec::new(),
            10_000,
        )
        .await;

        assert!(job.crashed);
        assert!(!job.timed_out);
        assert!(String::from_utf8_lossy(&job.stderr).contains("boom"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn resource_peaks_are_observed() {
        let source = r#"
public class Main {
    public static void main(String[] a) {
        byte[][] blocks = new byte[10][];
        for (int i = 0; i < 10; i++) blocks[i] = new byte[1024 * 1024];
        long acc = 0;
        for (long i = 0; i < 2_000_000_000L; i++) acc += i ^ blocks[(int) (i % 10)][0];
        System.out.println(acc);
    }
}
"#;
        let job = run_source(source, Vec::new(), Vec::new(), 30_000).await;

        assert!(job.peak_memory_mb >= 10.0, "peak_memory_mb: {}", job.peak_memory_mb);
        assert!(job.peak_cpu_pct > 0.0, "peak_cpu_pct: {}", job.peak_cpu_pct);
    }
}
