//! Best-effort log view for end users

use bothost_common::{DeployError, DeploymentId, Result};
use tracing::debug;

use crate::supervisor::Supervisor;

/// Returned instead of an error when a deployment has no container
pub const CONTAINER_NOT_FOUND_PLACEHOLDER: &str = "System: Container not found. Is it running?";

#[derive(Clone)]
pub struct LogReader {
    supervisor: Supervisor,
}

impl LogReader {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    /// Last `tail_lines` lines of a deployment's output.
    ///
    /// A missing container yields [`CONTAINER_NOT_FOUND_PLACEHOLDER`]; other
    /// failures, such as an unreachable engine, are returned.
    pub async fn get_logs(&self, id: &DeploymentId, tail_lines: usize) -> Result<String> {
        let container = match self.supervisor.find(id).await {
            Ok(container) => container,
            Err(DeployError::ContainerNotFound(_)) => {
                debug!("[{}] No container to read logs from", id);
                return Ok(CONTAINER_NOT_FOUND_PLACEHOLDER.to_string());
            }
            Err(e) => return Err(e),
        };

        match self.supervisor.logs(&container, tail_lines).await {
            // Removed between lookup and read
            Err(DeployError::ContainerNotFound(_)) => {
                Ok(CONTAINER_NOT_FOUND_PLACEHOLDER.to_string())
            }
            other => other,
        }
    }
}
