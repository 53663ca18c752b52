//! Image construction from a fetched workspace

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bothost_common::{DeployError, DeploymentId, Result};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::detector::RuntimeProfile;
use crate::engine::{BuildEvent, BuildRequest, ContainerEngine, EngineError, DEPLOYMENT_LABEL};

/// Diagnostic lines kept for a failed build's error message
const DIAGNOSTIC_LINES: usize = 5;

/// A built image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub tag: String,
    pub deployment_id: DeploymentId,
}

/// Turns workspaces into images
#[derive(Clone)]
pub struct ImageBuilder {
    engine: Arc<dyn ContainerEngine>,
    namespace: String,
    timeout: Duration,
}

impl ImageBuilder {
    pub fn new(engine: Arc<dyn ContainerEngine>, namespace: String, timeout: Duration) -> Self {
        Self {
            engine,
            namespace,
            timeout,
        }
    }

    /// Image tag for a deployment, built from the full identity
    pub fn tag_for(&self, id: &DeploymentId) -> String {
        format!("{}/{}:latest", self.namespace, id)
    }

    /// Build the image of a deployment from its workspace.
    ///
    /// On failure nothing stays registered under the deployment's tag.
    pub async fn build(
        &self,
        workspace: &Path,
        profile: &RuntimeProfile,
        id: &DeploymentId,
    ) -> Result<ImageHandle> {
        let tag = self.tag_for(id);

        write_descriptor(workspace, &profile.dockerfile()).await?;
        let context = pack_context(workspace.to_path_buf()).await?;

        info!(
            "[{}] Building image {} ({} runtime, {} byte context)",
            id,
            tag,
            profile.kind,
            context.len()
        );

        let request = BuildRequest {
            tag: tag.clone(),
            context,
            labels: HashMap::from([(DEPLOYMENT_LABEL.to_string(), id.to_string())]),
        };

        let outcome = match tokio::time::timeout(self.timeout, self.drain(request)).await {
            Ok(result) => result,
            Err(_) => Err(DeployError::timeout("image build", self.timeout)),
        };

        if let Err(e) = outcome {
            self.discard(&tag).await;
            return Err(e);
        }

        Ok(ImageHandle {
            tag,
            deployment_id: id.clone(),
        })
    }

    /// Best-effort removal of an image
    pub async fn discard(&self, tag: &str) {
        match self.engine.remove_image(tag).await {
            Ok(()) => debug!("Removed image {}", tag),
            Err(EngineError::NotFound(_)) => {}
            Err(e) => warn!("Failed to remove image {}: {}", tag, e),
        }
    }

    /// Consume the build stream to its end
    async fn drain(&self, request: BuildRequest) -> Result<()> {
        let mut stream = self.engine.build_image(request);
        let mut recent: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_LINES);
        let mut failed = false;

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| match e {
                EngineError::Unavailable(msg) => DeployError::RuntimeUnavailable(msg),
                other => DeployError::Build(other.to_string()),
            })?;

            let text = match event {
                BuildEvent::Output(text) => text,
                BuildEvent::Error(message) => {
                    failed = true;
                    message
                }
            };

            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if recent.len() == DIAGNOSTIC_LINES {
                    recent.pop_front();
                }
                recent.push_back(line.to_string());
            }
        }

        if failed {
            let diagnostics: Vec<String> = recent.into_iter().collect();
            return Err(DeployError::Build(diagnostics.join("\n")));
        }

        Ok(())
    }
}

/// Pack a workspace into a gzip tar build context, leaving out `.git`
async fn pack_context(root: PathBuf) -> Result<Bytes> {
    tokio::task::spawn_blocking(move || pack_dir(&root))
        .await
        .map_err(|e| DeployError::Build(format!("context packing task failed: {}", e)))?
}

fn pack_dir(root: &Path) -> Result<Bytes> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive.follow_symlinks(false);

    append_tree(&mut archive, root, Path::new(""))?;

    let encoder = archive.into_inner()?;
    Ok(Bytes::from(encoder.finish()?))
}

fn append_tree<W: Write>(
    archive: &mut tar::Builder<W>,
    root: &Path,
    relative: &Path,
) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(root.join(relative))?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name();
        if relative.as_os_str().is_empty() && name == ".git" {
            continue;
        }

        let path = relative.join(&name);
        if entry.file_type()?.is_dir() {
            archive.append_dir(&path, entry.path())?;
            append_tree(archive, root, &path)?;
        } else {
            archive.append_path_with_name(entry.path(), &path)?;
        }
    }

    Ok(())
}

/// Write the Dockerfile, replacing whatever the repository put under that name.
///
/// The old entry is unlinked, never followed, so a symlink cannot redirect the write.
async fn write_descriptor(workspace: &Path, content: &str) -> Result<()> {
    let path = workspace.join("Dockerfile");

    match tokio::fs::symlink_metadata(&path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await?,
        Ok(_) => tokio::fs::remove_file(&path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn entries(context: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(context));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_context_skips_git_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/util.js"), "module.exports = {}").unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let context = pack_context(dir.path().to_path_buf()).await.unwrap();
        let names = entries(&context);

        assert!(names.contains(&"package.json".to_string()));
        assert!(names.contains(&"lib/util.js".to_string()));
        assert!(names.iter().all(|n| !n.starts_with(".git")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_dockerfile_is_replaced_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim.txt");
        std::fs::write(&victim, "precious").unwrap();

        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("package.json"), "{}").unwrap();
        std::os::unix::fs::symlink(&victim, workspace.join("Dockerfile")).unwrap();

        let engine = crate::mock::MockEngine::new();
        let builder = ImageBuilder::new(
            Arc::new(engine.clone()),
            "bothost".to_string(),
            Duration::from_secs(30),
        );
        let id = DeploymentId::generate();

        let handle = builder
            .build(&workspace, &RuntimeProfile::node(), &id)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "precious");
        let meta = std::fs::symlink_metadata(workspace.join("Dockerfile")).unwrap();
        assert!(meta.file_type().is_file());
        let image = engine.image(&handle.tag).unwrap();
        assert!(image.dockerfile.starts_with("FROM node:18-alpine"));
    }

    #[tokio::test]
    async fn test_dockerfile_directory_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Dockerfile/nested")).unwrap();

        write_descriptor(dir.path(), "FROM scratch\n").await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("Dockerfile")).unwrap(),
            "FROM scratch\n"
        );
    }

    #[test]
    fn test_tag_uses_full_identity() {
        let engine: Arc<dyn ContainerEngine> = Arc::new(crate::mock::MockEngine::new());
        let builder = ImageBuilder::new(engine, "bothost".to_string(), Duration::from_secs(1));
        let id = DeploymentId::generate();

        assert_eq!(builder.tag_for(&id), format!("bothost/{}:latest", id));
    }
}
