//! Trigger queue using Redis Streams.
//!
//! The stream gives at-least-once delivery: a message stays pending in the
//! consumer group until acked, and idle pending messages are reclaimed by
//! other workers.

use std::time::Duration;

use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::message::PipelineMessage;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for pipeline messages
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Deliveries allowed before a message is dead-lettered
    pub max_deliveries: u32,
    /// Idempotency key lifetime
    pub dedup_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vsum:pipeline".to_string(),
            consumer_group: "vsum:workers".to_string(),
            dlq_stream_name: "vsum:dlq".to_string(),
            max_deliveries: 5,
            dedup_ttl: Duration::from_secs(3600),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            stream_name: std::env::var("QUEUE_STREAM")
                .unwrap_or_else(|_| "vsum:pipeline".to_string()),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or_else(|_| "vsum:workers".to_string()),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM")
                .unwrap_or_else(|_| "vsum:dlq".to_string()),
            max_deliveries: std::env::var("QUEUE_MAX_DELIVERIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            dedup_ttl: Duration::from_secs(
                std::env::var("QUEUE_DEDUP_TTL")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
        }
    }
}

/// Claims the idempotency key (when `ARGV[4]` is `1`) and appends the entry.
/// A failed append releases the key before the error is returned.
const ENQUEUE_SCRIPT: &str = r#"
if ARGV[4] == '1' then
    if not redis.call('SET', KEYS[2], '1', 'NX', 'EX', ARGV[3]) then
        return false
    end
end
local id = redis.pcall('XADD', KEYS[1], '*', 'message', ARGV[1], 'key', ARGV[2])
if type(id) == 'table' and id.err then
    if ARGV[4] == '1' then
        redis.call('DEL', KEYS[2])
    end
    return id
end
return id
"#;

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Stream entry ID, used for ack
    pub message_id: String,
    pub message: PipelineMessage,
    /// Times the entry has been delivered, including this one
    pub deliveries: u32,
}

/// Trigger queue client.
#[derive(Debug)]
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new queue client.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    fn dedup_key(&self, message: &PipelineMessage) -> String {
        format!("{}:dedup:{}", self.config.stream_name, message.idempotency_key())
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        // Create consumer group (ignore error if already exists)
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Enqueue a message.
    ///
    /// Returns the stream entry ID, or `None` when an identical message was
    /// enqueued within the dedup window. Claiming the idempotency key and
    /// appending to the stream happen in one script, so a failed append never
    /// leaves the key behind to swallow the next attempt.
    pub async fn enqueue(&self, message: &PipelineMessage) -> QueueResult<Option<String>> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message)?;
        let dedup_key = self.dedup_key(message);

        let message_id: Option<String> = redis::Script::new(ENQUEUE_SCRIPT)
            .key(&self.config.stream_name)
            .key(&dedup_key)
            .arg(&payload)
            .arg(message.idempotency_key())
            .arg(self.config.dedup_ttl.as_secs().max(1))
            .arg(if message.deduplicated() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;

        match &message_id {
            Some(id) => info!(
                job_id = %message.job_id(),
                kind = message.kind(),
                "Enqueued message {}",
                id
            ),
            None => debug!(key = %dedup_key, "Duplicate message suppressed"),
        }

        Ok(message_id)
    }

    /// Acknowledge a message and remove it from the stream.
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged message: {}", message_id);
        Ok(())
    }

    /// Move a message to the dead letter queue.
    pub async fn dlq(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        let payload = serde_json::to_string(&delivery.message)?;

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("message")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(&delivery.message_id).await?;

        warn!(
            job_id = %delivery.message.job_id(),
            kind = delivery.message.kind(),
            "Moved message {} to DLQ: {}",
            delivery.message_id,
            error
        );
        Ok(())
    }

    /// Get queue length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

    /// Get DLQ length.
    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(&self.config.dlq_stream_name).await?;
        Ok(len)
    }

    /// Read new messages for this consumer.
    pub async fn consume(
        &self,
        consumer_name: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;

        let result: Option<redis::streams::StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let mut deliveries = Vec::new();
        for stream_key in result.map(|r| r.keys).unwrap_or_default() {
            for entry in stream_key.ids {
                if let Some(delivery) = self.parse_entry(&entry, 1).await {
                    debug!("Consumed {} message {}", delivery.message.kind(), delivery.message_id);
                    deliveries.push(delivery);
                }
            }
        }

        Ok(deliveries)
    }

    /// Claim pending messages that have been idle for too long.
    ///
    /// This handles messages held by crashed workers. Each returned delivery
    /// carries the stream's own delivery counter.
    pub async fn claim_pending(
        &self,
        consumer_name: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;

        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(min_idle_ms);
        for p in &pending.ids {
            cmd.arg(&p.id);
        }
        let claimed: redis::streams::StreamClaimReply = cmd.query_async(&mut conn).await?;

        let mut deliveries = Vec::new();
        for entry in claimed.ids {
            // XCLAIM increments the delivery counter
            let deliveries_so_far = pending
                .ids
                .iter()
                .find(|p| p.id == entry.id)
                .map(|p| p.times_delivered as u32 + 1)
                .unwrap_or(1);

            if let Some(delivery) = self.parse_entry(&entry, deliveries_so_far).await {
                info!(
                    job_id = %delivery.message.job_id(),
                    deliveries = delivery.deliveries,
                    "Claimed pending message {}",
                    delivery.message_id
                );
                deliveries.push(delivery);
            }
        }

        Ok(deliveries)
    }

    /// Deliveries allowed before dead-lettering.
    pub fn max_deliveries(&self) -> u32 {
        self.config.max_deliveries
    }

    async fn parse_entry(&self, entry: &redis::streams::StreamId, deliveries: u32) -> Option<Delivery> {
        let message_id = entry.id.clone();

        let Some(redis::Value::BulkString(payload)) = entry.map.get("message") else {
            warn!("Stream entry {} has no message payload", message_id);
            self.ack(&message_id).await.ok();
            return None;
        };

        let payload_str = String::from_utf8_lossy(payload);
        match serde_json::from_str::<PipelineMessage>(&payload_str) {
            Ok(message) => Some(Delivery {
                message_id,
                message,
                deliveries,
            }),
            Err(e) => {
                warn!("Failed to parse message payload: {}", e);
                // Ack the malformed message to prevent reprocessing
                self.ack(&message_id).await.ok();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.stream_name, "vsum:pipeline");
        assert_eq!(config.max_deliveries, 5);
        assert_eq!(config.dedup_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_client_creation_does_not_connect() {
        let queue = tokio_test::assert_ok!(JobQueue::new(QueueConfig::default()));
        assert_eq!(queue.max_deliveries(), 5);
        assert_eq!(queue.config().dlq_stream_name, "vsum:dlq");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = QueueConfig {
            redis_url: "not a url".to_string(),
            ..QueueConfig::default()
        };
        tokio_test::assert_err!(JobQueue::new(config));
    }
}
