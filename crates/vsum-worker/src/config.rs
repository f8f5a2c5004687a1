//! Worker configuration.

use std::time::Duration;

/// Command lines of the external stage programs.
#[derive(Debug, Clone, Default)]
pub struct StageCommands {
    pub transcript: Option<String>,
    pub analysis: Option<String>,
    pub keyframes: Option<String>,
    pub upload: Option<String>,
    pub summary: Option<String>,
}

impl StageCommands {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            transcript: var("STAGE_TRANSCRIPT_CMD"),
            analysis: var("STAGE_ANALYSIS_CMD"),
            keyframes: var("STAGE_KEYFRAMES_CMD"),
            upload: var("STAGE_UPLOAD_CMD"),
            summary: var("STAGE_SUMMARY_CMD"),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum stages running at once
    pub max_concurrent_stages: usize,
    /// How long a consume call blocks waiting for messages
    pub poll_block: Duration,
    /// How often idle deliveries are claimed
    pub claim_interval: Duration,
    /// Minimum idle time before a delivery can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Timeout of one external stage program
    pub stage_timeout: Duration,
    /// Port of the Prometheus scrape endpoint, disabled when unset
    pub metrics_port: Option<u16>,
    pub commands: StageCommands,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 4,
            poll_block: Duration::from_secs(1),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300), // 5 minutes
            shutdown_timeout: Duration::from_secs(30),
            stage_timeout: Duration::from_secs(1800),
            metrics_port: None,
            commands: StageCommands::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let secs = |name: &str, default: u64| {
            Duration::from_secs(
                std::env::var(name)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(default),
            )
        };

        Self {
            max_concurrent_stages: std::env::var("WORKER_MAX_STAGES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
            poll_block: Duration::from_millis(
                std::env::var("WORKER_POLL_BLOCK_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            claim_interval: secs("WORKER_CLAIM_INTERVAL_SECS", 30),
            claim_min_idle: secs("WORKER_CLAIM_MIN_IDLE_SECS", 300),
            shutdown_timeout: secs("WORKER_SHUTDOWN_TIMEOUT", 30),
            stage_timeout: secs("WORKER_STAGE_TIMEOUT", 1800),
            metrics_port: std::env::var("WORKER_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            commands: StageCommands::from_env(),
        }
    }
}
