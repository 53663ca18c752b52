//! Request/response models for Deploy Service

use bothost_common::{Deployment, ResourceProfile};
use serde::{Deserialize, Serialize};

/// CPU share every plan gets
pub const PLAN_CPU_FRACTION: f64 = 0.5;

/// Subscription tier, deciding resources and how many deployments an owner may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl Plan {
    /// Most deployments an owner on this plan may have at once
    pub fn max_deployments(self) -> usize {
        match self {
            Plan::Free => 1,
            Plan::Pro => 5,
            Plan::Enterprise => 100,
        }
    }

    pub fn memory_limit_mb(self) -> u64 {
        match self {
            Plan::Free => 128,
            Plan::Pro => 512,
            Plan::Enterprise => 1024,
        }
    }

    /// Container limits of the plan
    pub fn resources(self) -> ResourceProfile {
        ResourceProfile {
            memory_limit_mb: self.memory_limit_mb(),
            cpu_quota_fraction: PLAN_CPU_FRACTION,
        }
    }
}

/// Request to deploy a repository
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    /// Owning user
    #[serde(default)]
    pub owner_id: String,

    /// Git repository to deploy
    #[serde(default)]
    pub repo_url: String,

    /// Plan of the owner; `free` when absent
    #[serde(default)]
    pub plan: Option<Plan>,
}

/// Response after accepting a deployment
#[derive(Debug, Serialize, Deserialize)]
pub struct DeployResponse {
    pub success: bool,
    pub deployment_id: String,
    pub message: String,
}

/// Outcome of start, stop and delete
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

/// Deployment record response
#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub deployment: Deployment,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_defaults_to_free() {
        let request: DeployRequest =
            serde_json::from_str(r#"{"owner_id":"u1","repo_url":"https://example.com/bot.git"}"#)
                .unwrap();
        assert_eq!(request.plan.unwrap_or_default(), Plan::Free);
    }

    #[test]
    fn test_plan_parsing() {
        let request: DeployRequest = serde_json::from_str(
            r#"{"owner_id":"u1","repo_url":"https://example.com/bot.git","plan":"enterprise"}"#,
        )
        .unwrap();
        assert_eq!(request.plan, Some(Plan::Enterprise));
    }

    #[test]
    fn test_missing_fields_are_left_empty_for_validation() {
        let request: DeployRequest = serde_json::from_str(r#"{"owner_id":"u1"}"#).unwrap();
        assert_eq!(request.owner_id, "u1");
        assert!(request.repo_url.is_empty());
    }

    #[test]
    fn test_plan_resources_are_valid() {
        for plan in [Plan::Free, Plan::Pro, Plan::Enterprise] {
            plan.resources().validate().unwrap();
        }
        assert_eq!(Plan::Pro.resources().memory_limit_mb, 512);
        assert_eq!(Plan::Enterprise.max_deployments(), 100);
    }
}
