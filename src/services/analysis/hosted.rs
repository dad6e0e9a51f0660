use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{AnalysisBackend, BackendError};
use crate::services::decode::DecodedImage;

const SYSTEM_PROMPT: &str = concat!(
    "You are a nutritionist who estimates nutrition facts from photos of food. ",
    "Only analyze food. When you see food, always give a nutrition estimate ",
    "using exactly the requested format."
);

const USER_PROMPT: &str = concat!(
    "Analyze this food photo. Identify the foods, estimate the visible portion ",
    "and give the approximate TOTAL nutrition values.\n\n",
    "Required format (fill in numbers):\n",
    "Food: [detailed description of the dish]\n",
    "Calories: [number] kcal\n",
    "Protein: [number] g\n",
    "Carbohydrates: [number] g\n",
    "Fat: [number] g\n",
    "Fiber: [number] g\n",
    "Confidence: [number between 60 and 95]%\n\n",
    "Always give numbers, estimate when unsure, and add nothing beyond the format."
);

const SIMPLE_PROMPT: &str = concat!(
    "This is a photo of food. Please give:\n\n",
    "Food: [name of the dish]\n",
    "Calories: [number] kcal\n",
    "Protein: [number] g\n",
    "Carbohydrates: [number] g\n",
    "Fat: [number] g\n",
    "Fiber: [number] g\n",
    "Confidence: 75%\n\n",
    "Give estimated values based on what you see."
);

/// Answers starting like these are refusals, not analyses.
const REFUSAL_PHRASES: &[&str] = &[
    "sorry",
    "cannot",
    "can't help",
    "unable to",
    "not able",
    "lo siento",
    "no puedo",
    "no es posible",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Client for an OpenAI-compatible vision chat-completions API.
pub struct HostedVisionBackend {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    name: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub fn is_refusal(answer: &str) -> bool {
    let lowered = answer.to_lowercase();
    REFUSAL_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}

impl HostedVisionBackend {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Result<Self, BackendError> {
        if api_key.trim().is_empty() {
            return Err(BackendError::Config(
                "OPENAI_API_KEY is required for the hosted backend".to_string(),
            ));
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            name: format!("hosted:{model}"),
        })
    }

    fn request_body(&self, image: &DecodedImage, prompt: &str, with_system: bool) -> serde_json::Value {
        let user = serde_json::json!({
            "role": "user",
            "content": [
                { "type": "text", "text": prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": image.data_uri(), "detail": "high" }
                }
            ]
        });
        let messages = if with_system {
            serde_json::json!([{ "role": "system", "content": SYSTEM_PROMPT }, user])
        } else {
            serde_json::json!([user])
        };

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": 500,
            "temperature": 0.3
        })
    }

    async fn complete(&self, body: &serde_json::Value) -> Result<String, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(BackendError::from_http)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &text));
        }

        let chat: ChatResponse = response.json().await.map_err(BackendError::from_http)?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| BackendError::Malformed("response has no answer text".to_string()))
    }
}

#[async_trait]
impl AnalysisBackend for HostedVisionBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_confidence(&self) -> f64 {
        90.0
    }

    async fn analyze(&self, image: &DecodedImage) -> Result<String, BackendError> {
        tracing::debug!(model = %self.model, format = ?image.format, "Requesting hosted vision analysis");
        let answer = self
            .complete(&self.request_body(image, USER_PROMPT, true))
            .await?;

        if !is_refusal(&answer) {
            return Ok(answer);
        }

        tracing::warn!(model = %self.model, "Model refused the image, retrying with a simplified prompt");
        let retry = self
            .complete(&self.request_body(image, SIMPLE_PROMPT, false))
            .await?;
        if is_refusal(&retry) {
            return Err(BackendError::Rejected(retry));
        }
        Ok(retry)
    }
}
