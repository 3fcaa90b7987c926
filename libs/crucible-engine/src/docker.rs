//! Docker implementation of the sandbox driver, on top of bollard.

use crate::demux::{self, StdioFrame};
use crate::sandbox::{OutputStream, SandboxError, SandboxRuntime, SandboxSpec, StatsStream};
use crate::stats::StatsSample;
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, Stats,
    StatsOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the daemon, over the given socket or the local default.
    pub fn connect(socket: Option<&str>) -> Result<Self, SandboxError> {
        let docker = match socket {
            Some(path) => Docker::connect_with_socket(path, 120, API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker })
    }

    /// Pulls the image if it is not already present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "image already present");
            return Ok(());
        }

        info!(image, "pulling sandbox image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        info!(image, "image pulled");
        Ok(())
    }
}

fn frame_from_log(output: LogOutput) -> StdioFrame {
    match output {
        LogOutput::StdOut { message } => StdioFrame {
            tag: demux::STDOUT_TAG,
            data: message,
        },
        LogOutput::StdErr { message } => StdioFrame {
            tag: demux::STDERR_TAG,
            data: message,
        },
        LogOutput::Console { message } => StdioFrame {
            tag: demux::STDOUT_TAG,
            data: message,
        },
        // Stdin echo is not ours; the demultiplexer drops the unknown tag.
        LogOutput::StdIn { message } => StdioFrame {
            tag: 0,
            data: message,
        },
    }
}

fn sample_from_stats(stats: &Stats) -> StatsSample {
    StatsSample {
        cpu_total_ns: stats.cpu_stats.cpu_usage.total_usage,
        precpu_total_ns: stats.precpu_stats.cpu_usage.total_usage,
        system_cpu_ns: stats.cpu_stats.system_cpu_usage,
        presystem_cpu_ns: stats.precpu_stats.system_cpu_usage,
        online_cpus: stats.cpu_stats.online_cpus.unwrap_or(0),
        memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        self.ensure_image(&spec.image).await?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_limit_bytes),
                cpu_shares: Some(spec.cpu_weight),
                // The supervisor removes the sandbox explicitly so removal
                // is observable even after a failure.
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        Ok(created.id)
    }

    async fn upload(&self, id: &str, archive: Vec<u8>, path: &str) -> Result<(), SandboxError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive.into())
            .await?;
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<OutputStream, SandboxError> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let results = self.docker.attach_container(id, Some(options)).await?;
        let stream = results
            .output
            .map(|item| item.map(frame_from_log).map_err(SandboxError::from))
            .boxed();
        Ok(stream)
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<StatsStream, SandboxError> {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };
        let stream = self
            .docker
            .stats(id, Some(options))
            .map(|item| {
                item.map(|stats| sample_from_stats(&stats))
                    .map_err(SandboxError::from)
            })
            .boxed();
        Ok(stream)
    }

    async fn wait(&self, id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit is a job outcome, not a transport failure;
            // hand the code back and let the supervisor classify it.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(SandboxError::Other(
                "wait stream ended without an exit status".to_string(),
            )),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn list_labeled(&self, key: &str, value: &str) -> Result<Vec<String>, SandboxError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{key}={value}")]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
