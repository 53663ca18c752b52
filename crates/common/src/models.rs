//! Deployment data model shared by the core and its collaborators

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DeployError, Result};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Unique identity of a deployment.
///
/// Always the canonical lowercase hyphenated form of a v4 UUID, so every
/// identity has the same length and none can be a prefix of another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Allocate a fresh identity
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Parse an identity received from a caller
    pub fn parse(raw: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(raw)
            .map_err(|_| DeployError::Validation(format!("malformed deployment id: {raw}")))?;

        let canonical = uuid.hyphenated().to_string();
        if canonical != raw {
            return Err(DeployError::Validation(format!(
                "deployment id must be a lowercase hyphenated uuid: {raw}"
            )));
        }

        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeploymentId {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeploymentId {
    type Error = DeployError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DeploymentId> for String {
    fn from(id: DeploymentId) -> Self {
        id.0
    }
}

/// Memory and CPU ceiling applied to a deployment's container
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Memory ceiling in MiB
    pub memory_limit_mb: u64,

    /// Share of a single core, in (0, 1]
    pub cpu_quota_fraction: f64,
}

impl ResourceProfile {
    /// Create a validated profile
    pub fn new(memory_limit_mb: u64, cpu_quota_fraction: f64) -> Result<Self> {
        let profile = Self {
            memory_limit_mb,
            cpu_quota_fraction,
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_mb == 0 {
            return Err(DeployError::Validation(
                "memory limit must be greater than 0 MB".to_string(),
            ));
        }
        if self.memory_limit_mb > i64::MAX as u64 / BYTES_PER_MB {
            return Err(DeployError::Validation(format!(
                "memory limit of {} MB is out of range",
                self.memory_limit_mb
            )));
        }
        if !self.cpu_quota_fraction.is_finite()
            || self.cpu_quota_fraction <= 0.0
            || self.cpu_quota_fraction > 1.0
        {
            return Err(DeployError::Validation(format!(
                "cpu quota fraction must be in (0, 1], got {}",
                self.cpu_quota_fraction
            )));
        }
        Ok(())
    }

    /// Memory ceiling in bytes, as the container runtime expects it
    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb * BYTES_PER_MB) as i64
    }

    /// CPU quota in microseconds for the given scheduler period.
    ///
    /// Never below 1ms, the smallest quota the kernel accepts.
    pub fn cpu_quota_micros(&self, period_micros: i64) -> i64 {
        let quota = (self.cpu_quota_fraction * period_micros as f64).round() as i64;
        quota.clamp(1_000, period_micros)
    }
}

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Accepted, repository not yet fetched and classified
    Queued,
    /// Image build and container start in progress
    Building,
    Running,
    Stopped,
    /// Pipeline failed; terminal
    Failed,
}

impl DeploymentStatus {
    /// Whether `next` is a legal successor of this status.
    ///
    /// `Running`/`Stopped` may repeat themselves so start and stop stay
    /// idempotent. `Running`/`Stopped` -> `Failed` only happens when the
    /// container disappeared behind our back.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        matches!(
            (self, next),
            (Queued, Building)
                | (Queued, Failed)
                | (Building, Running)
                | (Building, Failed)
                | (Running, Running)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopped, Stopped)
                | (Stopped, Running)
                | (Stopped, Failed)
        )
    }

    /// A container exists for the deployment
    pub fn is_built(self) -> bool {
        matches!(self, DeploymentStatus::Running | DeploymentStatus::Stopped)
    }

    /// The deploy pipeline is still working on it
    pub fn is_in_flight(self) -> bool {
        matches!(self, DeploymentStatus::Queued | DeploymentStatus::Building)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Queued => "QUEUED",
            DeploymentStatus::Building => "BUILDING",
            DeploymentStatus::Running => "RUNNING",
            DeploymentStatus::Stopped => "STOPPED",
            DeploymentStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A hosted deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique deployment identifier
    pub id: DeploymentId,

    /// Owning user, opaque to the core
    pub owner_id: String,

    /// Repository URL the deployment was built from
    pub source_location: String,

    /// Resource ceiling fixed at deploy time
    pub resources: ResourceProfile,

    /// Current status
    pub status: DeploymentStatus,

    /// Handle of the managed container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,

    /// Tag of the built image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    /// Human-readable failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Create a new deployment record in `Queued`
    pub fn new(
        id: DeploymentId,
        owner_id: String,
        source_location: String,
        resources: ResourceProfile,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            source_location,
            resources,
            status: DeploymentStatus::Queued,
            container_ref: None,
            image_tag: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark as building
    pub fn mark_building(&mut self) -> Result<()> {
        self.advance(DeploymentStatus::Building)
    }

    /// Mark as running in the given container
    pub fn mark_running(&mut self, container_ref: String, image_tag: String) -> Result<()> {
        self.advance(DeploymentStatus::Running)?;
        self.container_ref = Some(container_ref);
        self.image_tag = Some(image_tag);
        Ok(())
    }

    /// Mark a built deployment as running again
    pub fn mark_started(&mut self) -> Result<()> {
        self.require_built(DeploymentStatus::Running)?;
        self.advance(DeploymentStatus::Running)
    }

    /// Mark as stopped
    pub fn mark_stopped(&mut self) -> Result<()> {
        self.require_built(DeploymentStatus::Stopped)?;
        self.advance(DeploymentStatus::Stopped)
    }

    /// Mark as failed
    pub fn mark_failed(&mut self, reason: String) -> Result<()> {
        self.advance(DeploymentStatus::Failed)?;
        self.container_ref = None;
        self.image_tag = None;
        self.reason = Some(reason);
        Ok(())
    }

    /// Read-only view used for polling
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            container_ref: self.container_ref.clone(),
            reason: self.reason.clone(),
        }
    }

    fn require_built(&self, to: DeploymentStatus) -> Result<()> {
        if self.container_ref.is_none() {
            return Err(DeployError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    fn advance(&mut self, next: DeploymentStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DeployError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Status view returned to pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: DeploymentStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
