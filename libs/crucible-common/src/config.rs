// Service configuration, read from CRUCIBLE_* environment variables.

use anyhow::{Context, Result};
use std::str::FromStr;

pub const DEFAULT_LISTEN_PORT: u16 = 3000;
pub const DEFAULT_DEADLINE_MS: u64 = 10_000;
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 10_000;
pub const DEFAULT_SANDBOX_IMAGE: &str = "openjdk:17-alpine";
pub const DEFAULT_MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;
pub const DEFAULT_CPU_WEIGHT: i64 = 512;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub db_path: String,
    /// Path to the container runtime socket; `None` uses the local default.
    pub runtime_socket: Option<String>,
    /// Label value attached to every sandbox, used to scope the sweeper.
    pub project_label: String,
    pub deadline_ms: u64,
    pub output_cap_bytes: usize,
    pub sandbox_image: String,
    pub memory_limit_bytes: i64,
    pub cpu_weight: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            listen_port: parse_env("CRUCIBLE_LISTEN_PORT", DEFAULT_LISTEN_PORT)?,
            db_path: env_or("CRUCIBLE_DB_PATH", "crucible.db"),
            runtime_socket: std::env::var("CRUCIBLE_DOCKER_SOCKET").ok(),
            project_label: env_or("CRUCIBLE_PROJECT_LABEL", "crucible"),
            deadline_ms: parse_env("CRUCIBLE_DEADLINE_MS", DEFAULT_DEADLINE_MS)?,
            output_cap_bytes: parse_env("CRUCIBLE_OUTPUT_CAP_BYTES", DEFAULT_OUTPUT_CAP_BYTES)?,
            sandbox_image: env_or("CRUCIBLE_SANDBOX_IMAGE", DEFAULT_SANDBOX_IMAGE),
            memory_limit_bytes: parse_env("CRUCIBLE_MEMORY_LIMIT_BYTES", DEFAULT_MEMORY_LIMIT_BYTES)?,
            cpu_weight: parse_env("CRUCIBLE_CPU_WEIGHT", DEFAULT_CPU_WEIGHT)?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        Err(_) => Ok(default),
    }
}
