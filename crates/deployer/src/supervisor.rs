//! Lifecycle of the one container backing each deployment
//!
//! Containers are located by the exact value of [`DEPLOYMENT_LABEL`], which
//! always carries the full deployment identity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bothost_common::{DeployError, DeploymentId, ResourceProfile, Result};
use tracing::{debug, info, warn};

use crate::builder::ImageHandle;
use crate::config::DeployerConfig;
use crate::engine::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerSummary, EngineError,
    RestartPolicy, DEPLOYMENT_LABEL,
};

/// CFS scheduler period the CPU quota is expressed against
pub const CPU_PERIOD_MICROS: i64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Owns create/start/stop/remove/inspect against the container engine
#[derive(Clone)]
pub struct Supervisor {
    engine: Arc<dyn ContainerEngine>,
    stop_timeout: Duration,
    log_timeout: Duration,
    max_log_bytes: usize,
}

impl Supervisor {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &DeployerConfig) -> Self {
        Self {
            engine,
            stop_timeout: config.stop_timeout,
            log_timeout: config.log_timeout,
            max_log_bytes: config.max_log_bytes,
        }
    }

    /// Container name of a deployment
    pub fn container_name(id: &DeploymentId) -> String {
        format!("bothost-{}", id)
    }

    /// Check the engine is reachable
    pub async fn ping(&self) -> Result<()> {
        self.engine
            .ping()
            .await
            .map_err(|e| DeployError::RuntimeUnavailable(e.to_string()))
    }

    /// Create the resource-capped container of a built image.
    ///
    /// Leftover containers of the same deployment are removed first.
    pub async fn create(&self, image: &ImageHandle, resources: &ResourceProfile) -> Result<String> {
        resources.validate()?;
        let id = &image.deployment_id;

        for stale in self.list(id).await? {
            warn!("[{}] Removing stale container {}", id, stale.id);
            self.remove(&stale.id).await.or_else(ignore_missing)?;
        }

        let spec = ContainerSpec {
            name: Self::container_name(id),
            image: image.tag.clone(),
            labels: HashMap::from([(DEPLOYMENT_LABEL.to_string(), id.to_string())]),
            memory_bytes: resources.memory_limit_bytes(),
            cpu_period: CPU_PERIOD_MICROS,
            cpu_quota: resources.cpu_quota_micros(CPU_PERIOD_MICROS),
            restart_policy: RestartPolicy::Always,
        };

        let container = self
            .engine
            .create_container(&spec)
            .await
            .map_err(|e| match e {
                EngineError::Unavailable(msg) => DeployError::RuntimeUnavailable(msg),
                other => DeployError::Create(other.to_string()),
            })?;

        info!(
            "[{}] Created container {} (memory {} MB, cpu {})",
            id, container, resources.memory_limit_mb, resources.cpu_quota_fraction
        );
        Ok(container)
    }

    /// Start a container; already running is success
    pub async fn start(&self, container_ref: &str) -> Result<StartOutcome> {
        match self.engine.start_container(container_ref).await {
            Ok(()) => Ok(StartOutcome::Started),
            Err(EngineError::NotModified) => Ok(StartOutcome::AlreadyRunning),
            Err(e) => Err(e.into_deploy_error(container_ref)),
        }
    }

    /// Stop a container; already stopped is reported, not failed
    pub async fn stop(&self, container_ref: &str) -> Result<StopOutcome> {
        match self
            .engine
            .stop_container(container_ref, self.stop_timeout)
            .await
        {
            Ok(()) => Ok(StopOutcome::Stopped),
            Err(EngineError::NotModified) => Ok(StopOutcome::AlreadyStopped),
            Err(e) => Err(e.into_deploy_error(container_ref)),
        }
    }

    /// Force-remove a container whatever its state
    pub async fn remove(&self, container_ref: &str) -> Result<()> {
        self.engine
            .remove_container(container_ref)
            .await
            .map_err(|e| e.into_deploy_error(container_ref))
    }

    /// Force-remove every container of a deployment, returning how many went
    pub async fn remove_all(&self, id: &DeploymentId) -> Result<usize> {
        let containers = self.list(id).await?;
        for container in &containers {
            self.remove(&container.id).await.or_else(ignore_missing)?;
            debug!("[{}] Removed container {}", id, container.id);
        }
        Ok(containers.len())
    }

    /// Bounded, sanitized tail of a container's output
    pub async fn logs(&self, container_ref: &str, max_lines: usize) -> Result<String> {
        let raw = tokio::time::timeout(
            self.log_timeout,
            self.engine
                .container_logs(container_ref, max_lines, self.max_log_bytes),
        )
        .await
        .map_err(|_| DeployError::timeout("log retrieval", self.log_timeout))?
        .map_err(|e| e.into_deploy_error(container_ref))?;

        Ok(sanitize_logs(&raw))
    }

    /// Locate the container of a deployment by exact identity
    pub async fn find(&self, id: &DeploymentId) -> Result<String> {
        let mut matches = self.list(id).await?;
        if matches.len() > 1 {
            warn!("[{}] {} containers carry this deployment id", id, matches.len());
        }
        match matches.pop() {
            Some(container) => Ok(container.id),
            None => Err(DeployError::ContainerNotFound(id.to_string())),
        }
    }

    /// Inspect the container of a deployment
    pub async fn inspect(&self, id: &DeploymentId) -> Result<ContainerDetails> {
        let container = self.find(id).await?;
        self.engine
            .inspect_container(&container)
            .await
            .map_err(|e| e.into_deploy_error(id.as_str()))
    }

    async fn list(&self, id: &DeploymentId) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .engine
            .list_containers(DEPLOYMENT_LABEL, id.as_str())
            .await
            .map_err(|e| e.into_deploy_error(id.as_str()))?;

        // Exact equality, whatever filtering the engine applied
        Ok(containers
            .into_iter()
            .filter(|c| c.labels.get(DEPLOYMENT_LABEL).map(String::as_str) == Some(id.as_str()))
            .collect())
    }
}

fn ignore_missing(err: DeployError) -> Result<()> {
    match err {
        DeployError::ContainerNotFound(_) => Ok(()),
        other => Err(other),
    }
}

/// Strip control characters except newlines so logs render as plain text
pub fn sanitize_logs(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| *c == '\n' || (!c.is_control() && *c != char::REPLACEMENT_CHARACTER))
        .collect()
}
