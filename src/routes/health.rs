use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::queue::TaskQueue;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub broker: ComponentHealth,
    pub cache: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_check<E>(result: Result<(), E>, start: std::time::Instant) -> Self {
        match result {
            Ok(()) => ComponentHealth {
                status: "ok".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(_) => ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            },
        }
    }
}

/// Pending messages across `queues`, or `None` if any depth read failed.
pub async fn total_depth(queue: &dyn TaskQueue, queues: &[String]) -> Option<u64> {
    let mut depth = 0;
    for name in queues {
        match queue.depth(name).await {
            Ok(pending) => depth += pending,
            Err(e) => {
                tracing::warn!(queue = %name, error = %e, "Could not read queue depth");
                return None;
            }
        }
    }
    Some(depth)
}

/// GET /api/health: health check with broker and cache status.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let broker_start = std::time::Instant::now();
    let broker = ComponentHealth::from_check(state.queue.health_check().await, broker_start);

    let cache_start = std::time::Instant::now();
    let cache = ComponentHealth::from_check(state.results.health_check().await, cache_start);

    // A failed read keeps the previous gauge value
    if let Some(depth) = total_depth(state.queue.as_ref(), &state.queue_names).await {
        metrics::gauge!("analysis_queue_depth").set(depth as f64);
    }

    let all_healthy = broker.status == "ok" && cache.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        service: "food-analysis-backend".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { broker, cache },
    };

    (status_code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::models::task::TaskMessage;
    use crate::services::connection::ConnectionError;
    use crate::services::memory::MemoryTaskQueue;
    use crate::services::queue::{
        Delivery, DeliveryMode, PublishError, QueueDefinition, QueueError,
    };

    /// Memory queue whose depth reads fail for one queue name.
    struct UnreadableDepth {
        inner: MemoryTaskQueue,
        broken: &'static str,
    }

    #[async_trait]
    impl TaskQueue for UnreadableDepth {
        async fn declare(&self, definition: &QueueDefinition) -> Result<(), QueueError> {
            self.inner.declare(definition).await
        }

        async fn publish(
            &self,
            queue: &str,
            task: &TaskMessage,
            mode: DeliveryMode,
        ) -> Result<(), PublishError> {
            self.inner.publish(queue, task, mode).await
        }

        async fn claim(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
            self.inner.claim(queue).await
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
            self.inner.ack(delivery).await
        }

        async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
            self.inner.reject(delivery, requeue).await
        }

        async fn requeue_expired(&self, queue: &str) -> Result<usize, QueueError> {
            self.inner.requeue_expired(queue).await
        }

        async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
            if queue == self.broken {
                let lost = redis::RedisError::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                ));
                return Err(QueueError::Connection(ConnectionError::Redis(lost)));
            }
            self.inner.depth(queue).await
        }

        async fn health_check(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_total_depth_sums_every_queue() {
        let queue = UnreadableDepth {
            inner: MemoryTaskQueue::default(),
            broken: "broken",
        };
        queue.inner.push_raw("normal", "a");
        queue.inner.push_raw("normal", "b");
        queue.inner.push_raw("priority", "c");

        let depth = total_depth(&queue, &names(&["priority", "normal"])).await;
        assert_eq!(depth, Some(3));
    }

    #[tokio::test]
    async fn test_failed_depth_read_reports_nothing_instead_of_zero() {
        let queue = UnreadableDepth {
            inner: MemoryTaskQueue::default(),
            broken: "broken",
        };
        queue.inner.push_raw("normal", "a");

        assert_eq!(total_depth(&queue, &names(&["normal", "broken"])).await, None);
        assert_eq!(total_depth(&queue, &names(&["broken"])).await, None);
    }
}
