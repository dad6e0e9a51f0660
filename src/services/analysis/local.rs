use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{normalize_answer, AnalysisBackend, BackendError};
use crate::services::decode::DecodedImage;

const PROMPT: &str = concat!(
    "Identify the food in this image and estimate its nutrition. Answer with:\n",
    "Food: <dish>\nCalories: <number> kcal\nProtein: <number> g\n",
    "Carbohydrates: <number> g\nFat: <number> g\nFiber: <number> g\n",
    "Confidence: <number>%"
);

/// Error text that means the accelerator ran out of resources.
const ACCELERATOR_ERRORS: &[&str] = &[
    "out of memory",
    "cuda",
    "cudamalloc",
    "insufficient memory",
    "gpu",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Vision-language model served locally over an Ollama-style generate API.
///
/// Runs on the accelerator first; after a resource error it retries on CPU
/// and stays there for the life of the process.
pub struct LocalModelBackend {
    http: Client,
    base_url: String,
    model: String,
    name: String,
    cpu_only: AtomicBool,
}

fn is_accelerator_error(detail: &str) -> bool {
    let lowered = detail.to_lowercase();
    ACCELERATOR_ERRORS.iter().any(|marker| lowered.contains(marker))
}

impl LocalModelBackend {
    pub fn new(base_url: &str, model: &str) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            name: format!("local:{model}"),
            cpu_only: AtomicBool::new(false),
        })
    }

    fn request_body(&self, image: &DecodedImage, cpu_only: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": PROMPT,
            "images": [image.base64],
            "stream": false,
        });
        if cpu_only {
            body["options"] = serde_json::json!({ "num_gpu": 0 });
        }
        body
    }

    async fn generate(&self, image: &DecodedImage, cpu_only: bool) -> Result<String, BackendError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&self.request_body(image, cpu_only))
            .send()
            .await
            .map_err(BackendError::from_http)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status == StatusCode::NOT_FOUND {
                // model not pulled or still loading
                return Err(BackendError::Unavailable(text));
            }
            if is_accelerator_error(&text) {
                return Err(BackendError::Transient(format!("accelerator: {text}")));
            }
            return Err(BackendError::from_status(status, &text));
        }

        let value: serde_json::Value = response.json().await.map_err(BackendError::from_http)?;
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            if is_accelerator_error(error) {
                return Err(BackendError::Transient(format!("accelerator: {error}")));
            }
            return Err(BackendError::Rejected(error.to_string()));
        }
        normalize_answer(&value)
            .ok_or_else(|| BackendError::Malformed("model reply has no answer text".to_string()))
    }
}

#[async_trait]
impl AnalysisBackend for LocalModelBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_confidence(&self) -> f64 {
        85.0
    }

    async fn analyze(&self, image: &DecodedImage) -> Result<String, BackendError> {
        if self.cpu_only.load(Ordering::Relaxed) {
            return self.generate(image, true).await;
        }

        match self.generate(image, false).await {
            Err(BackendError::Transient(detail)) if is_accelerator_error(&detail) => {
                tracing::warn!(model = %self.model, error = %detail, "Accelerator failed, falling back to CPU");
                self.cpu_only.store(true, Ordering::Relaxed);
                self.generate(image, true).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn image() -> DecodedImage {
        DecodedImage {
            bytes: vec![],
            format: ImageFormat::Png,
            width: 1,
            height: 1,
            base64: "aW1n".to_string(),
        }
    }

    #[test]
    fn test_cpu_request_disables_gpu_layers() {
        let backend = LocalModelBackend::new("http://localhost:11434/", "llava").unwrap();
        let gpu = backend.request_body(&image(), false);
        let cpu = backend.request_body(&image(), true);

        assert!(gpu.get("options").is_none());
        assert_eq!(cpu["options"]["num_gpu"], 0);
        assert_eq!(cpu["images"][0], "aW1n");
        assert_eq!(backend.name(), "local:llava");
    }

    #[test]
    fn test_accelerator_error_detection() {
        assert!(is_accelerator_error("CUDA error: out of memory"));
        assert!(!is_accelerator_error("model 'llava' not found"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_retryable() {
        let backend = LocalModelBackend::new("http://127.0.0.1:9", "llava").unwrap();
        let err = backend.analyze(&image()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
