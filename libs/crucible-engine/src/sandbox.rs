//! The narrow interface the engine needs from a container runtime.

use crate::demux::StdioFrame;
use crate::stats::StatsSample;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    #[error("{0}")]
    Other(String),
}

/// Demultiplexed stdio chunks from an attached sandbox.
pub type OutputStream = BoxStream<'static, Result<StdioFrame, SandboxError>>;

/// Live resource statistics frames from a running sandbox.
pub type StatsStream = BoxStream<'static, Result<StatsSample, SandboxError>>;

/// Everything needed to create one sandbox. `auto_remove` is deliberately
/// absent: the supervisor always removes the sandbox explicitly so that
/// removal can be observed even after a failure.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub memory_limit_bytes: i64,
    /// Relative CPU share weight (the runtime's `cpu_shares`).
    pub cpu_weight: i64,
    /// Must carry the project tag and the job id.
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Creates a sandbox and returns its opaque runtime handle.
    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError>;

    /// Places a tar archive into the sandbox filesystem at `path`.
    async fn upload(&self, id: &str, archive: Vec<u8>, path: &str) -> Result<(), SandboxError>;

    /// Opens the sandbox's multiplexed stdout/stderr stream. Must be called
    /// before [`start`](Self::start) so no output is missed.
    async fn attach(&self, id: &str) -> Result<OutputStream, SandboxError>;

    async fn start(&self, id: &str) -> Result<(), SandboxError>;

    /// Opens the live statistics stream.
    async fn stats(&self, id: &str) -> Result<StatsStream, SandboxError>;

    /// Blocks until the sandbox exits and returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, SandboxError>;

    /// Best-effort termination; the sandbox may already be dead.
    async fn kill(&self, id: &str) -> Result<(), SandboxError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), SandboxError>;

    /// Handles of all sandboxes (running or not) carrying the given label.
    async fn list_labeled(&self, key: &str, value: &str) -> Result<Vec<String>, SandboxError>;
}
