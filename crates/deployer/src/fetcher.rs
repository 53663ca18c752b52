//! Repository acquisition into disposable per-deployment workspaces

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bothost_common::{DeployError, DeploymentId, Result};
use tokio::process::Command;
use tracing::{debug, warn};

const URL_SCHEMES: [&str; 4] = ["https://", "http://", "ssh://", "git://"];

/// Materializes a repository into a directory
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Populate `dest`, which must not exist yet, with the contents of `source`
    async fn fetch(&self, source: &str, dest: &Path) -> Result<()>;
}

/// Fetcher shelling out to `git clone`
#[derive(Debug, Clone)]
pub struct GitFetcher {
    program: PathBuf,
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific git binary
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, source: &str, dest: &Path) -> Result<()> {
        validate_source(source).map_err(|e| DeployError::Fetch(e.to_string()))?;

        if tokio::fs::try_exists(dest).await? {
            return Err(DeployError::Fetch(format!(
                "workspace already exists: {}",
                dest.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!("git clone {} into {}", source, dest.display());

        let output = Command::new(&self.program)
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("--quiet")
            .arg("--")
            .arg(source)
            .arg(dest)
            // Fail instead of waiting on a credential prompt
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DeployError::Fetch(format!("failed to execute git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .last()
                .unwrap_or("git clone failed");
            return Err(DeployError::Fetch(reason.to_string()));
        }

        Ok(())
    }
}

/// Check that `source` is a repository location we are willing to hand to git.
///
/// Accepts `https`, `http`, `ssh` and `git` URLs and scp-style `user@host:path`.
pub fn validate_source(source: &str) -> Result<()> {
    if source.is_empty() {
        return Err(DeployError::Validation(
            "repository URL is required".to_string(),
        ));
    }
    if source.starts_with('-') || source.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(DeployError::Validation(format!(
            "malformed repository URL: {:?}",
            source
        )));
    }

    if let Some(rest) = URL_SCHEMES.iter().find_map(|scheme| source.strip_prefix(scheme)) {
        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() || host.starts_with(':') {
            return Err(DeployError::Validation(format!(
                "repository URL has no host: {}",
                source
            )));
        }
        return Ok(());
    }

    if let Some((user_host, path)) = source.split_once(':') {
        if let Some((user, host)) = user_host.split_once('@') {
            if !user.is_empty() && !host.is_empty() && !host.contains('/') && !path.is_empty() {
                return Ok(());
            }
        }
    }

    Err(DeployError::Validation(format!(
        "unsupported repository URL: {}",
        source
    )))
}

/// Directory a deployment's source is fetched into
pub fn workspace_path(root: &Path, id: &DeploymentId) -> PathBuf {
    root.join(id.as_str())
}

/// Scratch directory owned by one pipeline run.
///
/// Removed when dropped, whatever state the pipeline reached.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    armed: bool,
}

impl Workspace {
    /// Claim the workspace path of a deployment; it must not exist yet
    pub fn reserve(root: &Path, id: &DeploymentId) -> Result<Self> {
        let path = workspace_path(root, id);
        if path.exists() {
            return Err(DeployError::Fetch(format!(
                "workspace already exists: {}",
                path.display()
            )));
        }
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the workspace now
    pub async fn discard(mut self) -> Result<()> {
        self.armed = false;
        purge(&self.path).await
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);

        // Inside the runtime the removal goes to the blocking pool
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_quietly(&path));
            }
            Err(_) => remove_quietly(&path),
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove workspace {}: {}", path.display(), e);
        }
    }
}

/// Recursively delete a directory; a missing directory is not an error
pub async fn purge(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        // A concurrent removal may win the race for some entries
        Err(_) if !tokio::fs::try_exists(path).await.unwrap_or(true) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_accepts_common_repository_urls() {
        assert!(validate_source("https://github.com/example/bot.git").is_ok());
        assert!(validate_source("http://git.local/bot").is_ok());
        assert!(validate_source("ssh://git@github.com/example/bot.git").is_ok());
        assert!(validate_source("git@github.com:example/bot.git").is_ok());
    }

    #[test]
    fn test_rejects_malformed_urls() {
        for bad in [
            "",
            "-uhack",
            "--upload-pack=touch /tmp/x",
            "https://",
            "https:///path",
            "file:///etc",
            "/local/path",
            "github.com/example/bot",
            "https://github.com/a b",
        ] {
            assert!(
                matches!(validate_source(bad), Err(DeployError::Validation(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let id = DeploymentId::generate();

        let workspace = Workspace::reserve(root.path(), &id).unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::create_dir_all(path.join("src")).unwrap();
        std::fs::write(path.join("src/index.js"), "console.log(1)").unwrap();

        drop(workspace);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_workspace_dropped_in_runtime_is_removed_in_background() {
        let root = tempfile::tempdir().unwrap();
        let id = DeploymentId::generate();

        let workspace = Workspace::reserve(root.path(), &id).unwrap();
        let path = workspace.path().to_path_buf();
        tokio::fs::create_dir_all(path.join("node_modules/x")).await.unwrap();
        tokio::fs::write(path.join("node_modules/x/index.js"), "1").await.unwrap();

        drop(workspace);

        for _ in 0..200 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workspace {} was not removed", path.display());
    }

    #[tokio::test]
    async fn test_purge_of_missing_directory_succeeds() {
        let root = tempfile::tempdir().unwrap();
        purge(&root.path().join("gone")).await.unwrap();
    }

    #[tokio::test]
    async fn test_workspace_discard_and_reserve_conflict() {
        let root = tempfile::tempdir().unwrap();
        let id = DeploymentId::generate();

        std::fs::create_dir_all(workspace_path(root.path(), &id)).unwrap();
        assert!(Workspace::reserve(root.path(), &id).is_err());

        purge(&workspace_path(root.path(), &id)).await.unwrap();
        let workspace = Workspace::reserve(root.path(), &id).unwrap();
        std::fs::create_dir_all(workspace.path()).unwrap();
        let path = workspace.path().to_path_buf();

        workspace.discard().await.unwrap();
        assert!(!path.exists());

        // Purging twice is fine
        purge(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_git_binary_is_fetch_error() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = GitFetcher::with_program(root.path().join("no-such-git"));

        let err = fetcher
            .fetch("https://github.com/example/bot.git", &root.path().join("clone"))
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Fetch(_)));
        assert!(err.to_string().contains("failed to execute git"));
    }

    #[tokio::test]
    #[ignore] // Requires git and network access
    async fn test_git_fetch_public_repository() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("clone");

        GitFetcher::new()
            .fetch("https://github.com/octocat/Hello-World.git", &dest)
            .await
            .expect("Failed to clone");

        assert!(dest.join(".git").exists());
    }
}
