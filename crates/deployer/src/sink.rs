//! Status persistence callback
//!
//! The orchestrator has no database of its own. Every created record and every
//! status transition is handed to a [`StatusSink`]; deletions are announced
//! the same way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bothost_common::{Deployment, DeploymentId, DeploymentStatus};

#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Persist the current state of a deployment
    async fn save(&self, deployment: &Deployment) -> anyhow::Result<()>;

    /// Forget a deleted deployment
    async fn remove(&self, id: &DeploymentId) -> anyhow::Result<()>;
}

/// Sink keeping records in memory, with the status history of each
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<HashMap<DeploymentId, Deployment>>,
    history: Mutex<HashMap<DeploymentId, Vec<DeploymentStatus>>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, id: &DeploymentId) -> Option<Deployment> {
        lock(&self.records).get(id).cloned()
    }

    pub fn all(&self) -> Vec<Deployment> {
        lock(&self.records).values().cloned().collect()
    }

    /// Distinct statuses a deployment was saved with, in order
    pub fn history(&self, id: &DeploymentId) -> Vec<DeploymentStatus> {
        lock(&self.history).get(id).cloned().unwrap_or_default()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("memory sink is failing");
        }
        Ok(())
    }
}

#[async_trait]
impl StatusSink for MemorySink {
    async fn save(&self, deployment: &Deployment) -> anyhow::Result<()> {
        self.check()?;

        let mut history = lock(&self.history);
        let statuses = history.entry(deployment.id.clone()).or_default();
        if statuses.last() != Some(&deployment.status) {
            statuses.push(deployment.status);
        }

        lock(&self.records).insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn remove(&self, id: &DeploymentId) -> anyhow::Result<()> {
        self.check()?;
        lock(&self.records).remove(id);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
