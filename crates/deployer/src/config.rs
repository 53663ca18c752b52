//! Configuration for the deployment pipeline
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Pipeline and supervisor configuration
#[derive(Debug, Clone)]
pub struct DeployerConfig {
    /// Directory under which per-deployment workspaces are created
    pub workspace_root: PathBuf,

    /// Namespace prefix of image tags
    pub image_namespace: String,

    /// Deadline for cloning a repository
    pub fetch_timeout: Duration,

    /// Deadline for building an image
    pub build_timeout: Duration,

    /// Grace period a container gets between SIGTERM and SIGKILL
    pub stop_timeout: Duration,

    /// Deadline for reading container logs
    pub log_timeout: Duration,

    /// Tail length when the caller does not ask for one
    pub default_log_tail: usize,

    /// Upper bound on the tail a caller may ask for
    pub max_log_tail: usize,

    /// Upper bound on the bytes of log output read per request
    pub max_log_bytes: usize,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/tmp/bothost/workspaces"),
            image_namespace: "bothost".to_string(),
            fetch_timeout: Duration::from_secs(300),
            build_timeout: Duration::from_secs(900),
            stop_timeout: Duration::from_secs(10),
            log_timeout: Duration::from_secs(10),
            default_log_tail: 100,
            max_log_tail: 1000,
            max_log_bytes: 256 * 1024,
        }
    }
}

impl DeployerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let config = Self {
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            image_namespace: env::var("IMAGE_NAMESPACE").unwrap_or(defaults.image_namespace),
            fetch_timeout: secs_var("FETCH_TIMEOUT_SECS", defaults.fetch_timeout)?,
            build_timeout: secs_var("BUILD_TIMEOUT_SECS", defaults.build_timeout)?,
            stop_timeout: secs_var("STOP_TIMEOUT_SECS", defaults.stop_timeout)?,
            log_timeout: secs_var("LOG_TIMEOUT_SECS", defaults.log_timeout)?,
            default_log_tail: usize_var("LOG_TAIL_DEFAULT", defaults.default_log_tail)?,
            max_log_tail: usize_var("LOG_TAIL_MAX", defaults.max_log_tail)?,
            max_log_bytes: defaults.max_log_bytes,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.image_namespace.is_empty()
            || !self
                .image_namespace
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c))
        {
            anyhow::bail!(
                "IMAGE_NAMESPACE must be lowercase alphanumeric, got '{}'",
                self.image_namespace
            );
        }
        if self.build_timeout.is_zero() || self.fetch_timeout.is_zero() {
            anyhow::bail!("FETCH_TIMEOUT_SECS and BUILD_TIMEOUT_SECS must be greater than 0");
        }
        if self.default_log_tail == 0 || self.default_log_tail > self.max_log_tail {
            anyhow::bail!("LOG_TAIL_DEFAULT must be between 1 and LOG_TAIL_MAX");
        }
        Ok(())
    }

    /// Clamp a requested log tail into the configured range
    pub fn log_tail(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_log_tail)
            .clamp(1, self.max_log_tail)
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw.parse().with_context(|| format!("Invalid {}", name))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

fn usize_var(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DeployerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_log_tail, 100);
        assert_eq!(config.build_timeout, Duration::from_secs(900));
    }

    #[test]
    fn test_log_tail_clamping() {
        let config = DeployerConfig::default();
        assert_eq!(config.log_tail(None), 100);
        assert_eq!(config.log_tail(Some(0)), 1);
        assert_eq!(config.log_tail(Some(50)), 50);
        assert_eq!(config.log_tail(Some(1_000_000)), 1000);
    }

    #[test]
    fn test_validate_rejects_bad_namespace() {
        let config = DeployerConfig {
            image_namespace: "Bad Namespace".to_string(),
            ..DeployerConfig::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("IMAGE_NAMESPACE"));
    }

    #[test]
    fn test_validate_rejects_zero_build_timeout() {
        let config = DeployerConfig {
            build_timeout: Duration::ZERO,
            ..DeployerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
