use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::models::analysis::{AnalysisResult, ResultRecord};
use crate::services::connection::{ConnectionError, RedisConnector};

/// Key-value store of task outcomes with per-entry expiry.
///
/// A missing entry is never an error: callers read it as "still processing".
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Write (or overwrite) the result for `task_id`, resetting its expiry.
    async fn put(
        &self,
        task_id: &str,
        result: &AnalysisResult,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<AnalysisResult>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

pub fn result_key(task_id: &str) -> String {
    format!("analysis:{task_id}")
}

/// Redis result cache storing [`ResultRecord`] JSON under `analysis:<task_id>`.
pub struct RedisResultStore {
    connector: Arc<RedisConnector>,
}

impl RedisResultStore {
    pub fn new(connector: Arc<RedisConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn put(
        &self,
        task_id: &str,
        result: &AnalysisResult,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&ResultRecord::from(result))?;
        let key = result_key(task_id);
        // SETEX rejects a zero expiry
        let seconds = ttl.as_secs().max(1);
        self.connector
            .run(|mut conn| {
                let key = key.clone();
                let payload = payload.clone();
                async move { conn.set_ex::<_, _, ()>(key, payload, seconds).await }
            })
            .await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<AnalysisResult>, StoreError> {
        let key = result_key(task_id);
        let payload: Option<String> = self
            .connector
            .run(|mut conn| {
                let key = key.clone();
                async move { conn.get(key).await }
            })
            .await?;

        match payload {
            Some(payload) => {
                let record: ResultRecord = serde_json::from_str(&payload)?;
                Ok(Some(record.into()))
            }
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.connector.ping().await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Result cache connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Result cache unavailable: {0}")]
    Unavailable(String),
}
