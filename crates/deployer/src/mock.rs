//! In-memory container engine for development and testing
//!
//! Simulates a Docker daemon without requiring one: images are registered
//! when a build "succeeds", containers are plain records. Knobs allow tests
//! to make builds slow or failing and the engine unreachable.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use crate::engine::{
    BuildEvent, BuildRequest, ContainerDetails, ContainerEngine, ContainerSpec, ContainerSummary,
    EngineError, EngineResult, RestartPolicy,
};

/// Image registered by a successful mock build
#[derive(Debug, Clone)]
pub struct MockImage {
    pub tag: String,
    pub labels: HashMap<String, String>,
    pub dockerfile: String,
    /// Paths of the build context entries
    pub context_entries: Vec<String>,
}

/// Container held by the mock engine
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub restart_policy: RestartPolicy,
    pub logs: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    images: HashMap<String, MockImage>,
    containers: HashMap<String, MockContainer>,
    next_id: u64,
    builds: usize,
    unavailable: bool,
    build_failure: Option<String>,
    build_delay: Option<Duration>,
}

/// Mock container engine
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    /// Create an empty mock engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the daemon were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make subsequent builds fail with `message`
    pub fn fail_builds_with(&self, message: impl Into<String>) {
        self.lock().build_failure = Some(message.into());
    }

    /// Make subsequent builds take `delay`
    pub fn set_build_delay(&self, delay: Duration) {
        self.lock().build_delay = Some(delay);
    }

    /// Number of builds started
    pub fn build_count(&self) -> usize {
        self.lock().builds
    }

    pub fn image(&self, tag: &str) -> Option<MockImage> {
        self.lock().images.get(tag).cloned()
    }

    pub fn image_tags(&self) -> Vec<String> {
        self.lock().images.keys().cloned().collect()
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.lock().containers.values().cloned().collect()
    }

    /// Append output to a container's log
    pub fn push_logs(&self, container_id: &str, data: &[u8]) {
        if let Some(container) = self.lock().containers.get_mut(container_id) {
            container.logs.extend_from_slice(data);
        }
    }

    /// Remove a container behind the supervisor's back
    pub fn forget_container(&self, container_id: &str) {
        self.lock().containers.remove(container_id);
    }

    /// Change a container's run state behind the supervisor's back
    pub fn set_running(&self, container_id: &str, running: bool) {
        if let Some(container) = self.lock().containers.get_mut(container_id) {
            container.running = running;
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not poison every other assertion
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> EngineResult<()> {
        if self.lock().unavailable {
            return Err(EngineError::Unavailable(
                "mock engine is unavailable".to_string(),
            ));
        }
        Ok(())
    }

    async fn run_build(self, request: BuildRequest) -> Vec<EngineResult<BuildEvent>> {
        let (delay, failure) = {
            let mut state = self.lock();
            if state.unavailable {
                return vec![Err(EngineError::Unavailable(
                    "mock engine is unavailable".to_string(),
                ))];
            }
            state.builds += 1;
            (state.build_delay, state.build_failure.clone())
        };

        let mut events = vec![Ok(BuildEvent::Output(format!(
            "Step 1/5 : building {}\n",
            request.tag
        )))];

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (dockerfile, entries) = match unpack_context(&request.context) {
            Ok(unpacked) => unpacked,
            Err(e) => {
                events.push(Ok(BuildEvent::Error(format!("invalid build context: {}", e))));
                return events;
            }
        };

        let Some(dockerfile) = dockerfile else {
            events.push(Ok(BuildEvent::Error(
                "Cannot locate specified Dockerfile: Dockerfile".to_string(),
            )));
            return events;
        };

        if let Some(message) = failure {
            events.push(Ok(BuildEvent::Output(" ---> Running in 4f2a\n".to_string())));
            events.push(Ok(BuildEvent::Error(message)));
            return events;
        }

        self.lock().images.insert(
            request.tag.clone(),
            MockImage {
                tag: request.tag.clone(),
                labels: request.labels,
                dockerfile,
                context_entries: entries,
            },
        );
        events.push(Ok(BuildEvent::Output(format!(
            "Successfully tagged {}\n",
            request.tag
        ))));
        events
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.check_available()
    }

    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, EngineResult<BuildEvent>> {
        let engine = self.clone();
        stream::once(engine.run_build(request))
            .flat_map(stream::iter)
            .boxed()
    }

    async fn remove_image(&self, tag: &str) -> EngineResult<()> {
        self.check_available()?;
        match self.lock().images.remove(tag) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("No such image: {}", tag))),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        self.check_available()?;
        let mut state = self.lock();

        if !state.images.contains_key(&spec.image) {
            return Err(EngineError::NotFound(format!(
                "No such image: {}",
                spec.image
            )));
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::Conflict(format!(
                "container name {} is already in use",
                spec.name
            )));
        }

        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        debug!("Mock engine created container {}", id);

        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                labels: spec.labels.clone(),
                running: false,
                memory_bytes: spec.memory_bytes,
                cpu_period: spec.cpu_period,
                cpu_quota: spec.cpu_quota,
                restart_policy: spec.restart_policy,
                logs: Vec::new(),
            },
        );

        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;

        if container.running {
            return Err(EngineError::NotModified);
        }
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> EngineResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;

        if !container.running {
            return Err(EngineError::NotModified);
        }
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.check_available()?;
        match self.lock().containers.remove(id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("No such container: {}", id))),
        }
    }

    async fn list_containers(&self, key: &str, value: &str) -> EngineResult<Vec<ContainerSummary>> {
        self.check_available()?;
        Ok(self
            .lock()
            .containers
            .values()
            .filter(|c| c.labels.get(key).map(String::as_str) == Some(value))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                image: c.image.clone(),
                labels: c.labels.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerDetails> {
        self.check_available()?;
        let state = self.lock();
        let c = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;

        Ok(ContainerDetails {
            id: c.id.clone(),
            image: c.image.clone(),
            running: c.running,
            memory_bytes: Some(c.memory_bytes),
            cpu_period: Some(c.cpu_period),
            cpu_quota: Some(c.cpu_quota),
            restart_policy: Some(c.restart_policy),
        })
    }

    async fn container_logs(
        &self,
        id: &str,
        tail: usize,
        max_bytes: usize,
    ) -> EngineResult<Vec<u8>> {
        self.check_available()?;
        let state = self.lock();
        let c = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;

        let lines: Vec<&[u8]> = c.logs.split_inclusive(|b| *b == b'\n').collect();
        let start = lines.len().saturating_sub(tail);
        let mut output: Vec<u8> = lines[start..].concat();

        if output.len() > max_bytes {
            let excess = output.len() - max_bytes;
            output.drain(..excess);
        }
        Ok(output)
    }
}

/// Extract the Dockerfile and the entry list from a gzip tar context
fn unpack_context(context: &[u8]) -> std::io::Result<(Option<String>, Vec<String>)> {
    let mut archive = tar::Archive::new(GzDecoder::new(context));
    let mut dockerfile = None;
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();

        if path == "Dockerfile" {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            dockerfile = Some(content);
        }
        entries.push(path);
    }

    Ok((dockerfile, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(image: &str, name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            labels: HashMap::from([("k".to_string(), "v".to_string())]),
            memory_bytes: 1024,
            cpu_period: 100_000,
            cpu_quota: 50_000,
            restart_policy: RestartPolicy::Always,
        }
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let engine = MockEngine::new();
        let result = engine.create_container(&spec("missing:latest", "c")).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_stop_report_not_modified() {
        let engine = MockEngine::new();
        engine.lock().images.insert(
            "img".to_string(),
            MockImage {
                tag: "img".to_string(),
                labels: HashMap::new(),
                dockerfile: String::new(),
                context_entries: Vec::new(),
            },
        );

        let id = engine.create_container(&spec("img", "c")).await.unwrap();
        engine.start_container(&id).await.unwrap();
        assert!(matches!(
            engine.start_container(&id).await,
            Err(EngineError::NotModified)
        ));

        engine.stop_container(&id, Duration::ZERO).await.unwrap();
        assert!(matches!(
            engine.stop_container(&id, Duration::ZERO).await,
            Err(EngineError::NotModified)
        ));
    }

    #[tokio::test]
    async fn test_logs_tail() {
        let engine = MockEngine::new();
        engine.lock().images.insert(
            "img".to_string(),
            MockImage {
                tag: "img".to_string(),
                labels: HashMap::new(),
                dockerfile: String::new(),
                context_entries: Vec::new(),
            },
        );
        let id = engine.create_container(&spec("img", "c")).await.unwrap();
        engine.push_logs(&id, b"one\ntwo\nthree\n");

        let out = engine.container_logs(&id, 2, 1024).await.unwrap();
        assert_eq!(out, b"two\nthree\n");

        let capped = engine.container_logs(&id, 10, 6).await.unwrap();
        assert_eq!(capped, b"three\n");
    }

    #[tokio::test]
    async fn test_unavailable() {
        let engine = MockEngine::new();
        engine.set_unavailable(true);
        assert!(matches!(engine.ping().await, Err(EngineError::Unavailable(_))));
        assert!(matches!(
            engine.list_containers("k", "v").await,
            Err(EngineError::Unavailable(_))
        ));
    }
}
