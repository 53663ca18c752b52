//! Deploy pipeline and deployment state machine
//!
//! `deploy()` records the deployment as `QUEUED`, returns its identity and
//! drives the pipeline in a background task:
//!
//! 1. fetch the repository into the deployment's workspace
//! 2. detect the runtime (then `BUILDING`)
//! 3. build the image
//! 4. create and start the container (then `RUNNING`)
//!
//! Any failure ends in `FAILED` with the error as reason. Each pipeline owns a
//! cancellation token; `delete()` cancels it and waits for the task before
//! tearing anything down, so a pipeline can never resurrect a deleted
//! deployment.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bothost_common::{
    DeployError, Deployment, DeploymentId, DeploymentStatus, ResourceProfile, Result,
    StatusSnapshot,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::{ImageBuilder, ImageHandle};
use crate::config::DeployerConfig;
use crate::detector;
use crate::engine::{ContainerDetails, ContainerEngine};
use crate::fetcher::{self, SourceFetcher, Workspace};
use crate::logs::LogReader;
use crate::sink::StatusSink;
use crate::supervisor::{StartOutcome, StopOutcome, Supervisor};

/// Failure reason of pipelines lost with a previous process
pub const RESTART_INTERRUPTED: &str = "deployment interrupted by service restart";

/// Failure reason of built deployments whose container vanished
pub const CONTAINER_LOST: &str = "container no longer exists";

struct Tracked {
    deployment: Deployment,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Tracked {
    fn idle(deployment: Deployment) -> Self {
        Self {
            deployment,
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

struct Inner {
    config: DeployerConfig,
    fetcher: Arc<dyn SourceFetcher>,
    builder: ImageBuilder,
    supervisor: Supervisor,
    logs: LogReader,
    sink: Arc<dyn StatusSink>,
    deployments: RwLock<HashMap<DeploymentId, Tracked>>,
}

/// Entry point for everything done to deployments
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        fetcher: Arc<dyn SourceFetcher>,
        sink: Arc<dyn StatusSink>,
        config: DeployerConfig,
    ) -> Self {
        let supervisor = Supervisor::new(engine.clone(), &config);
        let builder = ImageBuilder::new(
            engine,
            config.image_namespace.clone(),
            config.build_timeout,
        );

        Self {
            inner: Arc::new(Inner {
                logs: LogReader::new(supervisor.clone()),
                supervisor,
                builder,
                fetcher,
                sink,
                config,
                deployments: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &DeployerConfig {
        &self.inner.config
    }

    /// Accept a deployment and start its pipeline in the background
    pub async fn deploy(
        &self,
        owner_id: &str,
        repo_url: &str,
        resources: ResourceProfile,
    ) -> Result<DeploymentId> {
        if owner_id.trim().is_empty() {
            return Err(DeployError::Validation("owner id is required".to_string()));
        }
        fetcher::validate_source(repo_url)?;
        resources.validate()?;

        let id = DeploymentId::generate();
        let deployment = Deployment::new(
            id.clone(),
            owner_id.to_string(),
            repo_url.to_string(),
            resources,
        );

        self.inner
            .sink
            .save(&deployment)
            .await
            .map_err(|e| DeployError::Persistence(format!("{:#}", e)))?;

        info!("[{}] Deployment queued for owner {} from {}", id, owner_id, repo_url);

        // Spawn under the lock so a concurrent delete always finds the task
        let cancel = CancellationToken::new();
        let mut deployments = self.inner.deployments.write().await;
        let inner = self.inner.clone();
        let task = tokio::spawn(inner.run_pipeline(deployment.clone(), cancel.clone()));
        deployments.insert(
            id.clone(),
            Tracked {
                deployment,
                cancel,
                task: Some(task),
            },
        );
        drop(deployments);

        Ok(id)
    }

    /// Start a built deployment; starting a running one is a no-op
    pub async fn start(&self, id: &DeploymentId) -> Result<StartOutcome> {
        self.require_built(id).await?;

        let container = self.inner.supervisor.find(id).await?;
        let outcome = self.inner.supervisor.start(&container).await?;
        match outcome {
            StartOutcome::Started => info!("[{}] Container started", id),
            StartOutcome::AlreadyRunning => info!("[{}] Container is already running", id),
        }

        self.inner
            .update(id, |d| {
                d.mark_started()?;
                d.container_ref = Some(container);
                Ok(())
            })
            .await?;

        Ok(outcome)
    }

    /// Stop a built deployment; stopping a stopped one is reported, not failed
    pub async fn stop(&self, id: &DeploymentId) -> Result<StopOutcome> {
        self.require_built(id).await?;

        let container = self.inner.supervisor.find(id).await?;
        let outcome = self.inner.supervisor.stop(&container).await?;
        match outcome {
            StopOutcome::Stopped => info!("[{}] Container stopped", id),
            StopOutcome::AlreadyStopped => info!("[{}] Container was already stopped", id),
        }

        self.inner
            .update(id, |d| {
                d.mark_stopped()?;
                d.container_ref = Some(container);
                Ok(())
            })
            .await?;

        Ok(outcome)
    }

    /// Remove a deployment with its container, image and workspace.
    ///
    /// Cancels an in-flight pipeline first. Deleting an unknown or already
    /// deleted deployment succeeds.
    pub async fn delete(&self, id: &DeploymentId) -> Result<()> {
        let tracked = self.inner.deployments.write().await.remove(id);

        let previous = match tracked {
            Some(mut tracked) => {
                tracked.cancel.cancel();
                if let Some(task) = tracked.task.take() {
                    if let Err(e) = task.await {
                        warn!("[{}] Pipeline task ended abnormally: {}", id, e);
                    }
                }
                Some(tracked.deployment)
            }
            None => None,
        };

        if let Err(e) = self.inner.teardown(id).await {
            error!("[{}] Delete failed: {}", id, e);
            if let Some(mut deployment) = previous {
                // Stay tracked so the delete can be retried
                if deployment.status.is_in_flight() {
                    let _ = deployment.mark_failed(format!("deletion incomplete: {}", e));
                }
                self.inner.persist(&deployment).await;
                self.inner
                    .deployments
                    .write()
                    .await
                    .insert(id.clone(), Tracked::idle(deployment));
            }
            return Err(e);
        }

        self.inner
            .sink
            .remove(id)
            .await
            .map_err(|e| DeployError::Persistence(format!("{:#}", e)))?;

        info!("[{}] Deployment deleted", id);
        Ok(())
    }

    /// Status for polling
    pub async fn get_status(&self, id: &DeploymentId) -> Result<StatusSnapshot> {
        Ok(self.get(id).await?.snapshot())
    }

    /// Full record of a deployment
    pub async fn get(&self, id: &DeploymentId) -> Result<Deployment> {
        self.inner
            .deployments
            .read()
            .await
            .get(id)
            .map(|t| t.deployment.clone())
            .ok_or_else(|| DeployError::NotFound(id.to_string()))
    }

    /// Deployments of an owner, newest first
    pub async fn list_for_owner(&self, owner_id: &str) -> Vec<Deployment> {
        let mut deployments: Vec<Deployment> = self
            .inner
            .deployments
            .read()
            .await
            .values()
            .filter(|t| t.deployment.owner_id == owner_id)
            .map(|t| t.deployment.clone())
            .collect();

        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deployments
    }

    /// Recent output of a deployment; `None` uses the configured default tail
    pub async fn get_logs(&self, id: &DeploymentId, tail_lines: Option<usize>) -> Result<String> {
        let tail = self.inner.config.log_tail(tail_lines);
        self.inner.logs.get_logs(id, tail).await
    }

    /// Inspect the container of a deployment
    pub async fn inspect(&self, id: &DeploymentId) -> Result<ContainerDetails> {
        self.inner.supervisor.inspect(id).await
    }

    /// Check the container engine is reachable
    pub async fn engine_health(&self) -> Result<()> {
        self.inner.supervisor.ping().await
    }

    /// Rebuild the in-memory view from persisted records after a restart.
    ///
    /// Pipelines do not survive a restart, so in-flight records fail. Built
    /// records are reconciled with what the engine actually runs. Returns the
    /// number of records now tracked.
    pub async fn restore(&self, records: Vec<Deployment>) -> Result<usize> {
        let mut restored = 0;

        for mut deployment in records {
            let id = deployment.id.clone();
            if self.inner.deployments.read().await.contains_key(&id) {
                continue;
            }

            match self.inner.reconcile(&mut deployment).await {
                Ok(true) => self.inner.persist(&deployment).await,
                Ok(false) => {}
                // Keep the record as stored; the engine is asked again on first use
                Err(e) => warn!("[{}] Could not reconcile with the engine: {}", id, e),
            }

            debug!("[{}] Restored in status {}", id, deployment.status);
            self.inner
                .deployments
                .write()
                .await
                .insert(id, Tracked::idle(deployment));
            restored += 1;
        }

        info!("Restored {} deployments", restored);
        Ok(restored)
    }

    async fn require_built(&self, id: &DeploymentId) -> Result<()> {
        let status = self.get(id).await?.status;
        if !status.is_built() {
            return Err(DeployError::ContainerNotFound(id.to_string()));
        }
        Ok(())
    }
}

impl Inner {
    async fn run_pipeline(self: Arc<Self>, deployment: Deployment, cancel: CancellationToken) {
        let id = deployment.id.clone();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(DeployError::Cancelled),
            result = self.execute(&deployment) => result,
        };

        let update = match outcome {
            Ok((container, image)) => {
                info!("[{}] SUCCESS: deployment is running", id);
                self.update(&id, |d| d.mark_running(container, image.tag)).await
            }
            Err(DeployError::Cancelled) => {
                info!("[{}] Pipeline cancelled", id);
                return;
            }
            Err(e) => {
                error!("[{}] FAILED: {}", id, e);
                self.update(&id, |d| d.mark_failed(e.to_string())).await
            }
        };

        if let Err(e) = update {
            debug!("[{}] Dropped final status update: {}", id, e);
        }
    }

    async fn execute(&self, deployment: &Deployment) -> Result<(String, ImageHandle)> {
        let workspace = Workspace::reserve(&self.config.workspace_root, &deployment.id)?;

        let outcome = self.run_steps(deployment, workspace.path()).await;

        if let Err(e) = workspace.discard().await {
            warn!("[{}] Failed to remove workspace: {}", deployment.id, e);
        }

        outcome
    }

    /// Fetch, detect, build and launch inside a reserved workspace
    async fn run_steps(&self, deployment: &Deployment, workspace: &Path) -> Result<(String, ImageHandle)> {
        let id = &deployment.id;

        info!("[{}] 1. Cloning repository...", id);
        tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetcher.fetch(&deployment.source_location, workspace),
        )
        .await
        .map_err(|_| DeployError::timeout("repository fetch", self.config.fetch_timeout))??;

        info!("[{}] 2. Detecting runtime...", id);
        let profile = detector::detect(workspace).await?;

        self.update(id, |d| d.mark_building())
            .await
            .map_err(|e| match e {
                DeployError::NotFound(_) => DeployError::Cancelled,
                other => other,
            })?;

        info!("[{}] 3. Building {} image...", id, profile.kind);
        let image = self.builder.build(workspace, &profile, id).await?;

        info!("[{}] 4. Starting container...", id);
        let container = match self.launch(&image, &deployment.resources).await {
            Ok(container) => container,
            Err(e) => {
                self.builder.discard(&image.tag).await;
                return Err(e);
            }
        };

        Ok((container, image))
    }

    async fn launch(&self, image: &ImageHandle, resources: &ResourceProfile) -> Result<String> {
        let container = self.supervisor.create(image, resources).await?;

        if let Err(e) = self.supervisor.start(&container).await {
            if let Err(remove_err) = self.supervisor.remove(&container).await {
                warn!(
                    "[{}] Failed to remove unstartable container {}: {}",
                    image.deployment_id, container, remove_err
                );
            }
            return Err(e);
        }

        Ok(container)
    }

    /// Remove everything a deployment may have left behind
    async fn teardown(&self, id: &DeploymentId) -> Result<()> {
        let removed = self.supervisor.remove_all(id).await?;
        if removed > 0 {
            info!("[{}] Removed {} container(s)", id, removed);
        }

        self.builder.discard(&self.builder.tag_for(id)).await;

        let workspace = fetcher::workspace_path(&self.config.workspace_root, id);
        if let Err(e) = fetcher::purge(&workspace).await {
            warn!("[{}] Failed to remove workspace: {}", id, e);
        }

        Ok(())
    }

    /// Bring a restored record in line with the engine; true if it changed
    async fn reconcile(&self, deployment: &mut Deployment) -> Result<bool> {
        let id = deployment.id.clone();

        if deployment.status.is_in_flight() {
            warn!("[{}] Pipeline was interrupted, marking failed", id);
            if let Err(e) = self.teardown(&id).await {
                warn!("[{}] Cleanup of interrupted pipeline failed: {}", id, e);
            }
            deployment.mark_failed(RESTART_INTERRUPTED.to_string())?;
            return Ok(true);
        }

        if !deployment.status.is_built() {
            return Ok(false);
        }

        let details = match self.supervisor.inspect(&id).await {
            Ok(details) => details,
            Err(DeployError::ContainerNotFound(_)) => {
                warn!("[{}] Container disappeared, marking failed", id);
                self.builder.discard(&self.builder.tag_for(&id)).await;
                deployment.mark_failed(CONTAINER_LOST.to_string())?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        let before = (deployment.status, deployment.container_ref.clone());
        deployment.container_ref = Some(details.id);
        match (deployment.status, details.running) {
            (DeploymentStatus::Stopped, true) => deployment.mark_started()?,
            (DeploymentStatus::Running, false) => deployment.mark_stopped()?,
            _ => {}
        }

        Ok(before != (deployment.status, deployment.container_ref.clone()))
    }

    /// Apply a transition to a tracked deployment and persist the result
    async fn update<F>(&self, id: &DeploymentId, change: F) -> Result<Deployment>
    where
        F: FnOnce(&mut Deployment) -> Result<()>,
    {
        let snapshot = {
            let mut deployments = self.deployments.write().await;
            let tracked = deployments
                .get_mut(id)
                .ok_or_else(|| DeployError::NotFound(id.to_string()))?;

            let mut next = tracked.deployment.clone();
            change(&mut next)?;
            tracked.deployment = next.clone();
            next
        };

        debug!("[{}] Status is now {}", id, snapshot.status);
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    async fn persist(&self, deployment: &Deployment) {
        if let Err(e) = self.sink.save(deployment).await {
            error!(
                "[{}] Failed to persist status {}: {:#}",
                deployment.id, deployment.status, e
            );
        }
    }
}
