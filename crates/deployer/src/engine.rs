//! Container engine seam
//!
//! Everything the pipeline and the supervisor need from a container runtime,
//! expressed as one object-safe trait so the runtime client is injected rather
//! than global. [`crate::docker::DockerEngine`] talks to a Docker daemon,
//! [`crate::mock::MockEngine`] keeps everything in memory.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bothost_common::DeployError;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Label carrying the full deployment identity on images and containers
pub const DEPLOYMENT_LABEL: &str = "io.bothost.deployment-id";

/// Errors reported by an engine, before they are given deployment meaning
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no such object: {0}")]
    NotFound(String),

    /// The object is already in the requested state
    #[error("not modified")]
    NotModified,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("engine unreachable: {0}")]
    Unavailable(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Map to the deployment error taxonomy for an operation on `deployment`
    pub fn into_deploy_error(self, deployment: &str) -> DeployError {
        match self {
            EngineError::NotFound(_) => DeployError::ContainerNotFound(deployment.to_string()),
            EngineError::Unavailable(msg) => DeployError::RuntimeUnavailable(msg),
            other => DeployError::Runtime(other.to_string()),
        }
    }
}

/// Restart policy applied by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    Always,
}

/// Image build request
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Tag the resulting image is registered under
    pub tag: String,

    /// Gzip-compressed tar of the build context, `Dockerfile` at its root
    pub context: Bytes,

    pub labels: HashMap<String, String>,
}

/// One item of a build progress stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Output(String),
    Error(String),
}

/// Container creation parameters
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub restart_policy: RestartPolicy,
}

/// Container as seen in a listing
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

/// Container as seen by inspection
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub image: String,
    pub running: bool,
    pub memory_bytes: Option<i64>,
    pub cpu_period: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub restart_policy: Option<RestartPolicy>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check the engine is reachable
    async fn ping(&self) -> EngineResult<()>;

    /// Build an image; the stream ends when the build does
    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, EngineResult<BuildEvent>>;

    /// Force-remove an image by tag
    async fn remove_image(&self, tag: &str) -> EngineResult<()>;

    /// Create a container, returning its handle
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    /// `NotModified` if already running
    async fn start_container(&self, id: &str) -> EngineResult<()>;

    /// `NotModified` if already stopped
    async fn stop_container(&self, id: &str, grace: Duration) -> EngineResult<()>;

    /// Force-remove a container in any state
    async fn remove_container(&self, id: &str) -> EngineResult<()>;

    /// All containers, running or not, whose label `key` equals `value`
    async fn list_containers(&self, key: &str, value: &str) -> EngineResult<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerDetails>;

    /// Last `tail` lines of combined stdout/stderr, at most `max_bytes` bytes
    async fn container_logs(&self, id: &str, tail: usize, max_bytes: usize)
        -> EngineResult<Vec<u8>>;
}
