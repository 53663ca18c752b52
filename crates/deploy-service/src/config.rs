//! Configuration management for Deploy Service
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use deployer::DeployerConfig;
use std::env;
use std::str::FromStr;

/// Where deployment records are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Redis,
    /// Process memory only, for local development
    Memory,
}

impl FromStr for StoreMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreMode::Redis),
            "memory" => Ok(StoreMode::Memory),
            other => anyhow::bail!("STORE_MODE must be 'redis' or 'memory', got '{}'", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    pub redis_url: String,

    pub store_mode: StoreMode,

    /// Use the in-memory container engine instead of Docker
    pub mock_engine: bool,

    /// Docker socket path; local defaults when unset
    pub docker_socket: Option<String>,

    /// Pipeline settings
    pub deployer: DeployerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            api_port: env::var("API_PORT")
                .unwrap_or_else(|_| "8090".to_string())
                .parse()
                .context("Invalid API_PORT")?,

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),

            store_mode: env::var("STORE_MODE")
                .unwrap_or_else(|_| "redis".to_string())
                .parse()?,

            mock_engine: parse_flag(&env::var("MOCK_ENGINE").unwrap_or_default())
                .context("Invalid MOCK_ENGINE")?,

            docker_socket: env::var("DOCKER_SOCKET").ok().filter(|s| !s.is_empty()),

            deployer: DeployerConfig::from_env()?,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        self.deployer.validate()
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Ensure the workspace root exists
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.deployer.workspace_root).with_context(|| {
            format!(
                "Failed to create workspace root: {}",
                self.deployer.workspace_root.display()
            )
        })
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" => Ok(false),
        "1" | "true" | "yes" => Ok(true),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}
