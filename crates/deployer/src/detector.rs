//! Runtime detection from well-known manifest files

use std::fmt;
use std::path::Path;

use bothost_common::{DeployError, Result};

pub const NODE_MANIFEST: &str = "package.json";
pub const PYTHON_MANIFEST: &str = "requirements.txt";

/// Supported ecosystems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Node,
    Python,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Node => write!(f, "node"),
            RuntimeKind::Python => write!(f, "python"),
        }
    }
}

/// How to build and run a detected project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeProfile {
    pub kind: RuntimeKind,

    /// Image the build starts from
    pub base_image: String,

    /// Manifest that selected this profile
    pub manifest: &'static str,

    /// Dependency installation command
    pub install: Vec<String>,

    /// Process entry command
    pub start: Vec<String>,
}

impl RuntimeProfile {
    pub fn node() -> Self {
        Self {
            kind: RuntimeKind::Node,
            base_image: "node:18-alpine".to_string(),
            manifest: NODE_MANIFEST,
            install: args(&["npm", "install"]),
            start: args(&["node", "index.js"]),
        }
    }

    pub fn python() -> Self {
        Self {
            kind: RuntimeKind::Python,
            base_image: "python:3.9-slim".to_string(),
            manifest: PYTHON_MANIFEST,
            install: args(&["pip", "install", "-r", PYTHON_MANIFEST]),
            start: args(&["python", "bot.py"]),
        }
    }

    /// Render the build descriptor for this profile
    pub fn dockerfile(&self) -> String {
        format!(
            "FROM {}\nWORKDIR /app\nCOPY . .\nRUN {}\nCMD {}\n",
            self.base_image,
            exec_form(&self.install),
            exec_form(&self.start),
        )
    }
}

/// Classify the project in `workspace`.
///
/// Exactly one of the recognized manifests must be present at the root.
pub async fn detect(workspace: &Path) -> Result<RuntimeProfile> {
    let has_node = is_file(&workspace.join(NODE_MANIFEST)).await;
    let has_python = is_file(&workspace.join(PYTHON_MANIFEST)).await;

    match (has_node, has_python) {
        (true, false) => Ok(RuntimeProfile::node()),
        (false, true) => Ok(RuntimeProfile::python()),
        (true, true) => Err(DeployError::UnsupportedProject(format!(
            "ambiguous project, both {} and {} found",
            NODE_MANIFEST, PYTHON_MANIFEST
        ))),
        (false, false) => Err(DeployError::UnsupportedProject(format!(
            "no {} or {} found",
            NODE_MANIFEST, PYTHON_MANIFEST
        ))),
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// JSON array form, so no shell is involved
fn exec_form(command: &[String]) -> String {
    serde_json::Value::from(command.to_vec()).to_string()
}
