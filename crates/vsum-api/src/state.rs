//! Application state.

use std::sync::Arc;

use vsum_pipeline::{Dispatcher, Orchestrator, PipelineConfig};
use vsum_queue::JobQueue;
use vsum_store::{JobStore, RedisJobStore};

use crate::auth::JwtVerifier;
use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<dyn JobStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<JwtVerifier>,
    /// Queue checked by the readiness probe; absent in single-process setups
    pub queue: Option<Arc<JobQueue>>,
}

impl AppState {
    /// Assemble state from already-built collaborators.
    pub fn new(
        config: ApiConfig,
        store: Arc<dyn JobStore>,
        orchestrator: Arc<Orchestrator>,
        auth: JwtVerifier,
        queue: Option<Arc<JobQueue>>,
    ) -> Self {
        Self {
            config,
            store,
            orchestrator,
            auth: Arc::new(auth),
            queue,
        }
    }

    /// Create application state backed by Redis.
    pub async fn from_env(config: ApiConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let secret = config
            .jwt_secret
            .clone()
            .ok_or("JWT_SECRET must be set")?;
        let auth = JwtVerifier::new(
            &secret,
            config.jwt_issuer.as_deref(),
            config.jwt_audience.as_deref(),
        );

        let store: Arc<dyn JobStore> = Arc::new(RedisJobStore::from_env()?);
        let queue = Arc::new(JobQueue::from_env()?);
        queue.init().await?;

        let dispatcher: Arc<dyn Dispatcher> = queue.clone();
        let orchestrator = Orchestrator::new(store.clone(), dispatcher, PipelineConfig::from_env());

        Ok(Self::new(config, store, Arc::new(orchestrator), auth, Some(queue)))
    }
}
