use std::time::Duration;

use thiserror::Error;

use crate::models::DeploymentStatus;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("failed to fetch repository: {0}")]
    Fetch(String),

    /// No (or more than one) recognized runtime manifest.
    #[error("unknown project type: {0}")]
    UnsupportedProject(String),

    #[error("image build failed: {0}")]
    Build(String),

    #[error("container creation rejected: {0}")]
    Create(String),

    #[error("container not found for deployment {0}")]
    ContainerNotFound(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The runtime answered, but with an error none of the above describe.
    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("{operation} timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("deployment pipeline cancelled")]
    Cancelled,

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        DeployError::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// True for the errors that mean "no such thing", as opposed to a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DeployError::NotFound(_) | DeployError::ContainerNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_project_message_names_project_type() {
        let err = DeployError::UnsupportedProject(
            "no package.json or requirements.txt found".to_string(),
        );
        assert!(err.to_string().starts_with("unknown project type"));
    }

    #[test]
    fn not_found_classification() {
        assert!(DeployError::NotFound("x".into()).is_not_found());
        assert!(DeployError::ContainerNotFound("x".into()).is_not_found());
        assert!(!DeployError::RuntimeUnavailable("down".into()).is_not_found());
    }

    #[test]
    fn invalid_transition_display() {
        let err = DeployError::InvalidTransition {
            from: DeploymentStatus::Failed,
            to: DeploymentStatus::Running,
        };
        assert_eq!(err.to_string(), "invalid status transition FAILED -> RUNNING");
    }
}
