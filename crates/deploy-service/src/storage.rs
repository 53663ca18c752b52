//! Redis storage for deployment records

use anyhow::{Context, Result};
use async_trait::async_trait;
use bothost_common::{Deployment, DeploymentId};
use deployer::StatusSink;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

const ALL_KEY: &str = "deploy:all";

fn deployment_key(id: &str) -> String {
    format!("deploy:deployment:{}", id)
}

fn owner_key(owner_id: &str) -> String {
    format!("deploy:owner:{}", owner_id)
}

/// Storage backend for deployment records
#[derive(Clone)]
pub struct Storage {
    conn: ConnectionManager,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Store a deployment and index it under its owner
    pub async fn save_deployment(&self, deployment: &Deployment) -> Result<()> {
        let json = serde_json::to_string(deployment)
            .context("Failed to serialize deployment")?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set(deployment_key(deployment.id.as_str()), json)
            .sadd(owner_key(&deployment.owner_id), deployment.id.as_str())
            .sadd(ALL_KEY, deployment.id.as_str())
            .query_async::<_, ()>(&mut conn)
            .await
            .context("Failed to store deployment")?;

        debug!("Stored deployment: {} status: {}", deployment.id, deployment.status);
        Ok(())
    }

    /// Get a deployment by ID
    pub async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(deployment_key(id)).await?;

        match json {
            Some(data) => {
                let deployment: Deployment = serde_json::from_str(&data)
                    .context("Failed to deserialize deployment")?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// Remove a deployment and its index entries
    pub async fn delete_deployment(&self, id: &str) -> Result<()> {
        let owner = self.get_deployment(id).await?.map(|d| d.owner_id);

        let mut pipe = redis::pipe();
        pipe.atomic().del(deployment_key(id)).srem(ALL_KEY, id);
        if let Some(owner) = owner {
            pipe.srem(owner_key(&owner), id);
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .context("Failed to delete deployment")?;

        debug!("Deleted deployment: {}", id);
        Ok(())
    }

    /// Every stored deployment, for restoring state at startup.
    ///
    /// Index entries whose record is gone or unreadable are skipped.
    pub async fn load_all(&self) -> Result<Vec<Deployment>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(ALL_KEY).await?;

        let mut deployments = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_deployment(&id).await {
                Ok(Some(deployment)) => deployments.push(deployment),
                Ok(None) => {
                    warn!("Dropping index entry without record: {}", id);
                    let _: () = conn.srem(ALL_KEY, &id).await?;
                }
                Err(e) => warn!("Skipping unreadable deployment {}: {:#}", id, e),
            }
        }

        info!("Loaded {} deployments from Redis", deployments.len());
        Ok(deployments)
    }
}

#[async_trait]
impl StatusSink for Storage {
    async fn save(&self, deployment: &Deployment) -> Result<()> {
        self.save_deployment(deployment).await
    }

    async fn remove(&self, id: &DeploymentId) -> Result<()> {
        self.delete_deployment(id.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bothost_common::{DeploymentStatus, ResourceProfile};

    #[test]
    fn test_key_layout() {
        assert_eq!(deployment_key("abc"), "deploy:deployment:abc");
        assert_eq!(owner_key("u1"), "deploy:owner:u1");
    }

    /// Needs a local Redis: `cargo test -p deploy-service -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_round_trip_against_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let storage = Storage::new(&url).await.unwrap();

        let mut deployment = Deployment::new(
            DeploymentId::generate(),
            "storage-test-owner".to_string(),
            "https://github.com/example/bot.git".to_string(),
            ResourceProfile::new(128, 0.5).unwrap(),
        );
        storage.save(&deployment).await.unwrap();

        deployment.mark_failed("boom".to_string()).unwrap();
        storage.save(&deployment).await.unwrap();

        let loaded = storage
            .get_deployment(deployment.id.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Failed);
        assert!(storage
            .load_all()
            .await
            .unwrap()
            .iter()
            .any(|d| d.id == deployment.id));

        storage.remove(&deployment.id).await.unwrap();
        assert!(storage
            .get_deployment(deployment.id.as_str())
            .await
            .unwrap()
            .is_none());
        assert!(storage
            .load_all()
            .await
            .unwrap()
            .iter()
            .all(|d| d.id != deployment.id));
    }
}
