use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::task::TaskMessage;
use crate::services::connection::{ConnectionError, RedisConnector};

const DEFINITIONS_KEY: &str = "queues:definitions";

/// Pop the queue head into the processing list and lease it, in one step.
/// KEYS: queue, processing, leases. ARGV: lease deadline (ms).
static CLAIM_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local raw = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
        if raw then
            redis.call('ZADD', KEYS[3], ARGV[1], raw)
        end
        return raw
        ",
    )
});

/// Remove an in-flight entry and its lease. Only when the entry was still
/// in flight, push ARGV[2] onto KEYS[3] (if given). Returns 1 or 0.
/// KEYS: processing, leases, [destination]. ARGV: tag, [payload].
static SETTLE_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
        redis.call('ZREM', KEYS[2], ARGV[1])
        if removed == 1 and KEYS[3] then
            redis.call('LPUSH', KEYS[3], ARGV[2])
        end
        return removed
        ",
    )
});

/// In-flight entries whose lease ran out, plus entries with no lease at all.
/// KEYS: processing, leases. ARGV: now (ms).
static EXPIRED_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
        for _, raw in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
            if not redis.call('ZSCORE', KEYS[2], raw) then
                table.insert(expired, raw)
            end
        end
        return expired
        ",
    )
});

/// Shape of a queue. Every declarer must use the same definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    pub durable: bool,
}

impl QueueDefinition {
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Persistent,
    Transient,
}

/// Wire form of a queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub attempt: u32,
    #[serde(default)]
    pub mode: DeliveryMode,
    pub enqueued_at: DateTime<Utc>,
    pub body: String,
}

impl Envelope {
    pub fn new(body: String, mode: DeliveryMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt: 1,
            mode,
            enqueued_at: Utc::now(),
            body,
        }
    }

    /// Read a stored message. Anything that is not an envelope is taken as a
    /// raw body from a producer that does not wrap its messages.
    pub fn from_wire(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::new(raw.to_string(), DeliveryMode::Persistent))
    }

    /// Copy for the next delivery attempt, with a fresh identity.
    pub fn redelivery(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt: self.attempt.saturating_add(1),
            mode: self.mode,
            enqueued_at: Utc::now(),
            body: self.body.clone(),
        }
    }

    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One claimed message. Must be settled with `ack` or `reject`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    /// Exact stored form, used to locate the in-flight entry.
    pub tag: String,
    pub attempt: u32,
    pub body: String,
}

impl Delivery {
    pub fn from_wire(queue: &str, raw: String) -> Self {
        let envelope = Envelope::from_wire(&raw);
        Self {
            queue: queue.to_string(),
            tag: raw,
            attempt: envelope.attempt,
            body: envelope.body,
        }
    }
}

/// Durable, at-least-once task channel.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Create the queue if missing. Idempotent for identical definitions.
    async fn declare(&self, definition: &QueueDefinition) -> Result<(), QueueError>;

    /// Append a task to the queue tail.
    async fn publish(
        &self,
        queue: &str,
        task: &TaskMessage,
        mode: DeliveryMode,
    ) -> Result<(), PublishError>;

    /// Claim the next undelivered message, if any.
    async fn claim(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    /// Permanently remove a claimed message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a claimed message to the queue tail, or discard it as poison.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Return claims whose lease ran out (consumer crashed or lost its
    /// connection) to the queue. Returns how many were returned.
    async fn requeue_expired(&self, queue: &str) -> Result<usize, QueueError>;

    /// Number of messages waiting to be claimed.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed reliable queue.
///
/// Claiming moves a message into `<queue>:processing` and records a lease
/// deadline in `<queue>:leases`; settling removes both.
pub struct RedisTaskQueue {
    connector: Arc<RedisConnector>,
    visibility_timeout: Duration,
    publish_timeout: Duration,
}

fn processing_key(queue: &str) -> String {
    format!("{queue}:processing")
}

fn leases_key(queue: &str) -> String {
    format!("{queue}:leases")
}

pub fn dead_letter_key(queue: &str) -> String {
    format!("{queue}:dead")
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl RedisTaskQueue {
    pub fn new(
        connector: Arc<RedisConnector>,
        visibility_timeout: Duration,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            visibility_timeout,
            publish_timeout,
        }
    }

    pub fn from_config(connector: Arc<RedisConnector>, config: &AppConfig) -> Self {
        Self::new(
            connector,
            Duration::from_secs(config.visibility_timeout_secs),
            Duration::from_secs(config.publish_timeout_secs),
        )
    }

    async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
        let queue = queue.to_string();
        self.connector
            .run(|mut conn| {
                let queue = queue.clone();
                let payload = payload.clone();
                async move { conn.lpush::<_, _, ()>(queue, payload).await }
            })
            .await?;
        Ok(())
    }

    /// Remove an in-flight entry and, in the same script, push `forward`
    /// onto its destination. Nothing is pushed when the entry was already
    /// settled or reclaimed by a reaper.
    async fn settle(
        &self,
        delivery: &Delivery,
        forward: Option<(String, String)>,
    ) -> Result<(), QueueError> {
        let processing = processing_key(&delivery.queue);
        let leases = leases_key(&delivery.queue);
        let removed: i64 = self
            .connector
            .run(|mut conn| {
                let mut invocation = SETTLE_SCRIPT.key(processing.as_str());
                invocation.key(leases.as_str()).arg(delivery.tag.as_str());
                if let Some((destination, payload)) = &forward {
                    invocation.key(destination.as_str()).arg(payload.as_str());
                }
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        if removed == 0 {
            return Err(QueueError::UnknownDelivery(delivery.queue.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn declare(&self, definition: &QueueDefinition) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(definition)?;
        let name = definition.name.clone();
        let existing: String = self
            .connector
            .run(|mut conn| {
                let name = name.clone();
                let encoded = encoded.clone();
                async move {
                    let _: bool = conn.hset_nx(DEFINITIONS_KEY, &name, &encoded).await?;
                    conn.hget(DEFINITIONS_KEY, &name).await
                }
            })
            .await?;

        let existing: QueueDefinition = serde_json::from_str(&existing)?;
        if existing != *definition {
            return Err(QueueError::IncompatibleDeclaration {
                queue: definition.name.clone(),
                existing,
            });
        }
        tracing::debug!(queue = %definition.name, durable = definition.durable, "Queue declared");
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        task: &TaskMessage,
        mode: DeliveryMode,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_string(task).map_err(QueueError::Serialize)?;
        let payload = Envelope::new(body, mode)
            .to_wire()
            .map_err(QueueError::Serialize)?;
        tokio::time::timeout(self.publish_timeout, self.push(queue, payload))
            .await
            .map_err(|_| PublishError::Timeout(self.publish_timeout))??;
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let processing = processing_key(queue);
        let leases = leases_key(queue);
        let deadline = now_millis() + self.visibility_timeout.as_millis() as i64;
        // Not replayed: a lost reply may hide a claim that already happened,
        // and that entry is leased, so the reaper returns it.
        let raw: Option<String> = self
            .connector
            .run_once(|mut conn| async move {
                CLAIM_SCRIPT
                    .key(queue)
                    .key(processing.as_str())
                    .key(leases.as_str())
                    .arg(deadline)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        Ok(raw.map(|raw| Delivery::from_wire(queue, raw)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, None).await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let envelope = Envelope::from_wire(&delivery.tag);
        let forward = if requeue {
            (delivery.queue.clone(), envelope.redelivery().to_wire()?)
        } else {
            (dead_letter_key(&delivery.queue), delivery.tag.clone())
        };
        self.settle(delivery, Some(forward)).await
    }

    async fn requeue_expired(&self, queue: &str) -> Result<usize, QueueError> {
        let processing = processing_key(queue);
        let leases = leases_key(queue);
        let now = now_millis();
        let expired: Vec<String> = self
            .connector
            .run(|mut conn| {
                let mut invocation = EXPIRED_SCRIPT.key(processing.as_str());
                invocation.key(leases.as_str()).arg(now);
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        let mut returned = 0;
        for tag in expired {
            let delivery = Delivery::from_wire(queue, tag);
            match self.reject(&delivery, true).await {
                Ok(()) => {
                    tracing::warn!(queue = %queue, attempt = delivery.attempt, "Lease expired, returned message to queue");
                    returned += 1;
                }
                // settled or reclaimed since the scan
                Err(QueueError::UnknownDelivery(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(returned)
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let queue = queue.to_string();
        let depth = self
            .connector
            .run(|mut conn| {
                let queue = queue.clone();
                async move { conn.llen(queue).await }
            })
            .await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.connector.ping().await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Broker connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue {queue} already declared with a different definition: {existing:?}")]
    IncompatibleDeclaration {
        queue: String,
        existing: QueueDefinition,
    },

    #[error("Unknown delivery on queue {0}")]
    UnknownDelivery(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Connection(ConnectionError::Redis(e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
