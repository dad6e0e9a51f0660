//! Pluggable image analysis backends.
//!
//! A backend turns a decoded image into free-form nutrition text. Which one
//! a worker loads is decided by configuration at startup.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use strum::{Display, EnumString};

use crate::config::AppConfig;
use crate::services::decode::DecodedImage;

pub mod hosted;
pub mod local;

pub use hosted::HostedVisionBackend;
pub use local::LocalModelBackend;

/// Fields searched, in order, when a backend answers with an object.
const ANSWER_FIELDS: &[&str] = &["answer", "response", "text", "content"];

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Name recorded on every result this backend produces.
    fn name(&self) -> &str;

    /// Confidence reported when the answer does not state one.
    fn default_confidence(&self) -> f64;

    async fn analyze(&self, image: &DecodedImage) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// Hosted vision API (OpenAI-compatible chat completions)
    #[default]
    Hosted,
    /// Locally served vision-language model
    Local,
}

/// Build the backend selected in configuration.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn AnalysisBackend>, BackendError> {
    let backend: Arc<dyn AnalysisBackend> = match config.analysis_backend {
        BackendKind::Hosted => Arc::new(HostedVisionBackend::new(
            config.openai_api_key.as_deref().unwrap_or_default(),
            &config.openai_base_url,
            &config.openai_model,
        )?),
        BackendKind::Local => Arc::new(LocalModelBackend::new(
            &config.local_model_url,
            &config.local_model_name,
        )?),
    };
    Ok(backend)
}

/// Reduce a backend answer to plain text. Strings pass through; objects are
/// searched for the first known answer field.
pub fn normalize_answer(value: &serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::String(text) => Some(text.trim().to_string()),
        serde_json::Value::Object(map) => ANSWER_FIELDS
            .iter()
            .find_map(|field| map.get(*field))
            .and_then(normalize_answer),
        _ => None,
    };
    text.filter(|text| !text.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend not configured: {0}")]
    Config(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Transient backend failure: {0}")]
    Transient(String),

    #[error("Backend could not analyze the image: {0}")]
    Rejected(String),

    #[error("Backend answer could not be read: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Whether another delivery of the same task may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::Transient(_)
        )
    }

    /// Classify a transport error.
    pub fn from_http(e: reqwest::Error) -> Self {
        if e.is_connect() {
            BackendError::Unavailable(e.to_string())
        } else if e.is_timeout() || e.is_request() {
            BackendError::Transient(e.to_string())
        } else if e.is_decode() {
            BackendError::Malformed(e.to_string())
        } else {
            BackendError::Transient(e.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            BackendError::Transient(detail)
        } else {
            BackendError::Rejected(detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dictionary_answers_are_normalized() {
        assert_eq!(
            normalize_answer(&json!({"answer": " Food: Soup "})).as_deref(),
            Some("Food: Soup")
        );
        assert_eq!(
            normalize_answer(&json!({"response": "Calories: 10"})).as_deref(),
            Some("Calories: 10")
        );
        assert_eq!(
            normalize_answer(&json!({"answer": {"text": "nested"}})).as_deref(),
            Some("nested")
        );
        assert_eq!(normalize_answer(&json!("plain")).as_deref(), Some("plain"));
        assert_eq!(normalize_answer(&json!({"other": "x"})), None);
        assert_eq!(normalize_answer(&json!({"answer": "  "})), None);
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(BackendError::from_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(BackendError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!BackendError::from_status(StatusCode::BAD_REQUEST, "bad image").is_retryable());
        assert!(!BackendError::Malformed("x".into()).is_retryable());
    }

    #[test]
    fn test_backend_kind_parses_from_config_strings() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!(BackendKind::Hosted.to_string(), "hosted");
    }
}
