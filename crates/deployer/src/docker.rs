//! Docker engine backed by the bollard API client

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, RestartPolicy as DockerRestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info};

use crate::engine::{
    BuildEvent, BuildRequest, ContainerDetails, ContainerEngine, ContainerSpec, ContainerSummary,
    EngineError, EngineResult, RestartPolicy,
};

/// Seconds bollard waits on a single daemon request
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Container engine talking to a Docker daemon
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the daemon.
    ///
    /// With no socket path, `DOCKER_HOST` or the platform default socket is used.
    pub fn connect(socket: Option<&str>) -> EngineResult<Self> {
        let docker = match socket {
            Some(path) => {
                info!("Connecting to Docker at {}", path);
                Docker::connect_with_socket(path, REQUEST_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => {
                info!("Connecting to Docker with local defaults");
                Docker::connect_with_local_defaults()
            }
        }
        .map_err(classify)?;

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.docker.ping().await.map(|_| ()).map_err(classify)
    }

    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, EngineResult<BuildEvent>> {
        debug!(
            "Building {} from {} bytes of context",
            request.tag,
            request.context.len()
        );

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: request.tag,
            rm: true,
            forcerm: true,
            labels: request.labels,
            ..Default::default()
        };

        self.docker
            .build_image(options, None, Some(request.context))
            .map(|item| match item {
                Ok(info) => {
                    let failure = info
                        .error_detail
                        .and_then(|detail| detail.message)
                        .or(info.error);
                    match failure {
                        Some(message) => Ok(BuildEvent::Error(message)),
                        None => Ok(BuildEvent::Output(info.stream.unwrap_or_default())),
                    }
                }
                Err(e) => Err(classify(e)),
            })
            .boxed()
    }

    async fn remove_image(&self, tag: &str) -> EngineResult<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_image(tag, Some(options), None)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let restart = match spec.restart_policy {
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::Never => RestartPolicyNameEnum::NO,
        };

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            // Equal to memory: no swap on top of the ceiling
            memory_swap: Some(spec.memory_bytes),
            cpu_period: Some(spec.cpu_period),
            cpu_quota: Some(spec.cpu_quota),
            restart_policy: Some(DockerRestartPolicy {
                name: Some(restart),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(classify)?;

        for warning in &response.warnings {
            debug!("Docker warning creating {}: {}", spec.name, warning);
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> EngineResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn list_containers(&self, key: &str, value: &str) -> EngineResult<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}={}", key, value)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    image: c.image.unwrap_or_default(),
                    running: c.state.as_deref() == Some("running"),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerDetails> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let host = info.host_config.unwrap_or_default();
        let restart_policy = host
            .restart_policy
            .and_then(|policy| policy.name)
            .map(|name| match name {
                RestartPolicyNameEnum::ALWAYS => RestartPolicy::Always,
                _ => RestartPolicy::Never,
            });

        Ok(ContainerDetails {
            id: info.id.unwrap_or_else(|| id.to_string()),
            image: info.config.and_then(|c| c.image).unwrap_or_default(),
            running: info.state.and_then(|s| s.running).unwrap_or(false),
            memory_bytes: host.memory,
            cpu_period: host.cpu_period,
            cpu_quota: host.cpu_quota,
            restart_policy,
        })
    }

    async fn container_logs(
        &self,
        id: &str,
        tail: usize,
        max_bytes: usize,
    ) -> EngineResult<Vec<u8>> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            output.extend_from_slice(&chunk.into_bytes());

            // Keep the newest bytes
            if output.len() > max_bytes {
                let excess = output.len() - max_bytes;
                output.drain(..excess);
            }
        }

        Ok(output)
    }
}

fn classify(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 304, ..
        } => EngineError::NotModified,
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Rejected {
            status: status_code,
            message,
        },
        BollardError::DockerStreamError { error } => EngineError::Rejected {
            status: 500,
            message: error,
        },
        other => EngineError::Unavailable(other.to_string()),
    }
}
