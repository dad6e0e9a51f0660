use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::task::{QueueTier, TaskMessage};
use crate::services::queue::{DeliveryMode, PublishError, QueueDefinition, TaskQueue};

/// Advisory completion estimate returned to callers.
pub const ESTIMATED_COMPLETION: &str = "30-60 seconds";

/// Accepted submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: String,
    pub tier: QueueTier,
}

/// Turns uploads into queued tasks, one message per upload.
pub struct Submitter {
    queue: Arc<dyn TaskQueue>,
    normal: QueueDefinition,
    priority: Option<QueueDefinition>,
    declared: OnceCell<()>,
    /// Bounds queue declaration, which a submission may wait on.
    declare_timeout: Duration,
}

impl Submitter {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        normal: QueueDefinition,
        priority: Option<QueueDefinition>,
    ) -> Self {
        Self {
            queue,
            normal,
            priority,
            declared: OnceCell::new(),
            declare_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_declare_timeout(mut self, declare_timeout: Duration) -> Self {
        self.declare_timeout = declare_timeout;
        self
    }

    pub fn from_config(queue: Arc<dyn TaskQueue>, config: &AppConfig) -> Self {
        let priority = config
            .priority_enabled
            .then(|| QueueDefinition::durable(&config.priority_queue_name));
        Self::new(queue, QueueDefinition::durable(&config.queue_name), priority)
            .with_declare_timeout(Duration::from_secs(config.publish_timeout_secs))
    }

    /// Queue a tier maps to. Priority falls back to normal when disabled.
    pub fn queue_for(&self, tier: QueueTier) -> &QueueDefinition {
        match (tier, &self.priority) {
            (QueueTier::Priority, Some(priority)) => priority,
            _ => &self.normal,
        }
    }

    /// Declare every queue this gateway publishes to. Runs once per process;
    /// a timed out attempt is retried by the next submission.
    pub async fn declare_queues(&self) -> Result<(), PublishError> {
        let declare = self.declared.get_or_try_init(|| async {
            self.queue.declare(&self.normal).await?;
            if let Some(priority) = &self.priority {
                self.queue.declare(priority).await?;
            }
            Ok::<_, PublishError>(())
        });
        tokio::time::timeout(self.declare_timeout, declare)
            .await
            .map_err(|_| PublishError::Timeout(self.declare_timeout))??;
        Ok(())
    }

    /// Enqueue an image under a fresh task id.
    pub async fn submit(
        &self,
        image_bytes: &[u8],
        filename: &str,
        content_type: Option<&str>,
        tier: QueueTier,
    ) -> Result<Submission, PublishError> {
        self.declare_queues().await?;

        let task = TaskMessage {
            task_id: Uuid::new_v4().to_string(),
            image_data: base64::engine::general_purpose::STANDARD.encode(image_bytes),
            filename: filename.to_string(),
            content_type: content_type.map(str::to_string),
        };
        let queue = self.queue_for(tier);
        self.queue
            .publish(&queue.name, &task, DeliveryMode::Persistent)
            .await?;

        metrics::counter!("analysis_tasks_submitted_total", "tier" => tier.to_string()).increment(1);
        tracing::info!(
            task_id = %task.task_id,
            queue = %queue.name,
            filename = %task.filename,
            bytes = image_bytes.len(),
            "Task submitted"
        );

        Ok(Submission {
            task_id: task.task_id,
            tier,
        })
    }
}
