//! Redis-backed job store.
//!
//! Records are stored as JSON under `{prefix}:job:{id}`; the correlation token
//! index lives under `{prefix}:token:{token}` and is claimed with `SET NX` so a
//! token maps to at most one job.

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use vsum_models::{CorrelationToken, JobId, ProcessingJob};

use crate::error::{StoreError, StoreResult};
use crate::store::{check_write, JobStore};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for all keys
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vsum".to_string(),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("STORE_KEY_PREFIX").unwrap_or_else(|_| "vsum".to_string()),
        }
    }
}

/// Job store client.
pub struct RedisJobStore {
    client: redis::Client,
    config: StoreConfig,
}

impl RedisJobStore {
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        Self::new(StoreConfig::from_env())
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.config.key_prefix, id)
    }

    fn token_key(&self, token: &CorrelationToken) -> String {
        format!("{}:token:{}", self.config.key_prefix, token)
    }

    async fn connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &JobId,
    ) -> StoreResult<Option<ProcessingJob>> {
        let payload: Option<String> = conn.get(self.job_key(id)).await?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: &ProcessingJob) -> StoreResult<()> {
        check_write(None, job)?;
        let mut conn = self.connection().await?;

        let token_key = self.token_key(&job.correlation_token);
        let claimed: bool = conn.set_nx(&token_key, job.id.as_str()).await?;
        if !claimed {
            let owner: Option<String> = conn.get(&token_key).await?;
            if owner.as_deref() != Some(job.id.as_str()) {
                warn!(job_id = %job.id, "Correlation token already mapped to another job");
                return Err(StoreError::TokenInUse(job.correlation_token.to_string()));
            }
        }

        let payload = serde_json::to_string(job)?;
        let created: bool = conn.set_nx(self.job_key(&job.id), payload).await?;
        if !created {
            // Only release the token if this call claimed it
            if claimed {
                conn.del::<_, ()>(&token_key).await?;
            }
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }

        info!(job_id = %job.id, "Created job record");
        Ok(())
    }

    async fn get(&self, id: &JobId) -> StoreResult<Option<ProcessingJob>> {
        let mut conn = self.connection().await?;
        self.load(&mut conn, id).await
    }

    async fn find_by_token(&self, token: &CorrelationToken) -> StoreResult<Option<ProcessingJob>> {
        let mut conn = self.connection().await?;
        let id: Option<String> = conn.get(self.token_key(token)).await?;
        match id {
            Some(id) => self.load(&mut conn, &JobId::from_string(id)).await,
            None => Ok(None),
        }
    }

    async fn save(&self, job: &ProcessingJob) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let previous = self
            .load(&mut conn, &job.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job.id.clone()))?;
        check_write(Some(&previous), job)?;

        let payload = serde_json::to_string(job)?;
        conn.set::<_, _, ()>(self.job_key(&job.id), payload).await?;

        debug!(job_id = %job.id, stage = %job.stage, progress = job.progress, "Saved job record");
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let store = RedisJobStore::new(StoreConfig::default()).unwrap();
        assert_eq!(store.job_key(&JobId::from_string("v1")), "vsum:job:v1");
        assert_eq!(
            store.token_key(&CorrelationToken::parse("abc").unwrap()),
            "vsum:token:abc"
        );
    }
}
