//! Task processing state machine.
//!
//! `Received -> Decoding -> Analyzing -> Parsing -> Persisting -> Acknowledged`
//!
//! Every delivery ends in exactly one [`Disposition`]. Malformed payloads are
//! discarded, retryable backend and store failures are requeued, and
//! terminal backend failures are persisted as `error` results so pollers get
//! an answer.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::Display;

use crate::config::AppConfig;
use crate::models::analysis::AnalysisResult;
use crate::models::task::TaskMessage;
use crate::services::analysis::AnalysisBackend;
use crate::services::consumer::{DeliveryHandler, Disposition};
use crate::services::decode::{decode_image, DecodedImage};
use crate::services::parser::parse_nutrition;
use crate::services::queue::Delivery;
use crate::services::results::ResultStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Received,
    Decoding,
    Analyzing,
    Parsing,
    Persisting,
    Acknowledged,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub result_ttl: Duration,
    pub analysis_timeout: Duration,
    /// Deliveries of one task before retryable failures become final.
    pub max_deliveries: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(3600),
            analysis_timeout: Duration::from_secs(120),
            max_deliveries: 5,
        }
    }
}

impl From<&AppConfig> for WorkerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            result_ttl: config.result_ttl(),
            analysis_timeout: Duration::from_secs(config.analysis_timeout_secs),
            max_deliveries: config.max_deliveries.max(1),
        }
    }
}

/// Owns the analysis backend and the result store for one worker process.
pub struct Worker {
    backend: Arc<dyn AnalysisBackend>,
    results: Arc<dyn ResultStore>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        backend: Arc<dyn AnalysisBackend>,
        results: Arc<dyn ResultStore>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            backend,
            results,
            settings,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Run one delivery through every stage.
    pub async fn process(&self, delivery: &Delivery) -> Disposition {
        tracing::info!(
            queue = %delivery.queue,
            attempt = delivery.attempt,
            stage = %Stage::Received,
            "Delivery received"
        );

        let (task, image) = match self.decode(delivery) {
            Some(decoded) => decoded,
            None => return Disposition::Discard,
        };

        let result = match self.analyze(&task, &image).await {
            Ok(text) => {
                let nutrition = parse_nutrition(&text, self.backend.default_confidence());
                tracing::info!(
                    task_id = %task.task_id,
                    stage = %Stage::Parsing,
                    food = %nutrition.food_name,
                    calories = nutrition.calories_kcal,
                    protein = nutrition.protein_g,
                    carbs = nutrition.carbs_g,
                    fat = nutrition.fat_g,
                    confidence = nutrition.confidence_pct,
                    "Analysis parsed"
                );
                AnalysisResult::completed(
                    &task.task_id,
                    &task.filename,
                    nutrition,
                    text,
                    self.backend.name(),
                )
            }
            Err(Failure::Retryable(reason)) => {
                return self.retry_or_give_up(delivery, &task, reason).await;
            }
            Err(Failure::Terminal(reason)) => {
                tracing::warn!(task_id = %task.task_id, error = %reason, "Analysis failed, storing error result");
                AnalysisResult::failed(&task.task_id, &task.filename, self.backend.name(), reason)
            }
        };

        if let Err(e) = self.persist(&result).await {
            return self
                .retry_or_give_up(delivery, &task, format!("result store write failed: {e}"))
                .await;
        }

        tracing::info!(
            task_id = %task.task_id,
            stage = %Stage::Acknowledged,
            status = %result.status,
            "Task processed"
        );
        Disposition::Ack
    }

    fn decode(&self, delivery: &Delivery) -> Option<(TaskMessage, DecodedImage)> {
        let task: TaskMessage = match serde_json::from_str(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(queue = %delivery.queue, stage = %Stage::Decoding, error = %e, "Malformed task message, discarding");
                return None;
            }
        };

        match decode_image(&task.image_data) {
            Ok(image) => {
                tracing::debug!(
                    task_id = %task.task_id,
                    stage = %Stage::Decoding,
                    width = image.width,
                    height = image.height,
                    format = ?image.format,
                    "Image decoded"
                );
                Some((task, image))
            }
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, stage = %Stage::Decoding, error = %e, "Undecodable image payload, discarding");
                None
            }
        }
    }

    async fn analyze(&self, task: &TaskMessage, image: &DecodedImage) -> Result<String, Failure> {
        tracing::info!(
            task_id = %task.task_id,
            stage = %Stage::Analyzing,
            backend = %self.backend.name(),
            filename = %task.filename,
            "Starting analysis"
        );
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.settings.analysis_timeout, self.backend.analyze(image)).await;
        let elapsed = start.elapsed();
        metrics::histogram!("analysis_backend_seconds").record(elapsed.as_secs_f64());

        match outcome {
            Err(_) => Err(Failure::Retryable(format!(
                "analysis timed out after {:?}",
                self.settings.analysis_timeout
            ))),
            Ok(Err(e)) if e.is_retryable() => Err(Failure::Retryable(e.to_string())),
            Ok(Err(e)) => Err(Failure::Terminal(e.to_string())),
            Ok(Ok(text)) => {
                tracing::info!(
                    task_id = %task.task_id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Analysis complete"
                );
                Ok(text)
            }
        }
    }

    async fn persist(&self, result: &AnalysisResult) -> Result<(), crate::services::results::StoreError> {
        tracing::debug!(task_id = %result.task_id, stage = %Stage::Persisting, "Storing result");
        self.results
            .put(&result.task_id, result, self.settings.result_ttl)
            .await
            .inspect_err(|e| {
                tracing::error!(task_id = %result.task_id, stage = %Stage::Persisting, error = %e, "Failed to store result");
            })
    }

    /// Requeue unless this was the last allowed delivery; then store an
    /// error result (best effort) and discard.
    async fn retry_or_give_up(
        &self,
        delivery: &Delivery,
        task: &TaskMessage,
        reason: String,
    ) -> Disposition {
        if delivery.attempt < self.settings.max_deliveries {
            tracing::warn!(
                task_id = %task.task_id,
                attempt = delivery.attempt,
                error = %reason,
                "Retryable failure, requeueing"
            );
            return Disposition::Requeue;
        }

        tracing::error!(
            task_id = %task.task_id,
            attempt = delivery.attempt,
            error = %reason,
            "Delivery limit reached, giving up"
        );
        let result = AnalysisResult::failed(
            &task.task_id,
            &task.filename,
            self.backend.name(),
            format!("gave up after {} deliveries: {reason}", delivery.attempt),
        );
        if let Err(e) = self.persist(&result).await {
            tracing::error!(
                task_id = %task.task_id,
                attempt = delivery.attempt,
                error = %e,
                "Could not store error result, discarding without one"
            );
        }
        Disposition::Discard
    }
}

enum Failure {
    Retryable(String),
    Terminal(String),
}

#[async_trait]
impl DeliveryHandler for Worker {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        self.process(delivery).await
    }
}
