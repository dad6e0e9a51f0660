//! Test fixtures: images, task messages and a scripted analysis backend
#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use food_analysis::models::task::TaskMessage;
use food_analysis::services::analysis::{AnalysisBackend, BackendError};
use food_analysis::services::decode::DecodedImage;

/// 1x1 transparent PNG.
pub const PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8DwHwAFBQIAX8jx0gAAAABJRU5ErkJggg==";

/// Backend text from the Spanish-labelled sample meal.
pub const SALAD_ANSWER: &str = "Comida: Ensalada, Calorías: 200 kcal, Proteínas: 10 g";

pub fn pixel_png_bytes() -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(PIXEL_PNG)
        .expect("fixture image is valid base64")
}

pub fn task(task_id: &str, image_data: &str) -> TaskMessage {
    TaskMessage {
        task_id: task_id.to_string(),
        image_data: image_data.to_string(),
        filename: "photo.jpg".to_string(),
        content_type: Some("image/png".to_string()),
    }
}

/// One scripted backend reply.
#[derive(Debug, Clone)]
pub enum Step {
    Answer(String),
    /// Backend unreachable; worth another delivery.
    Unavailable,
    /// Backend refused the image for good.
    Rejected,
    /// Never answers within any sane timeout.
    Hang,
}

/// Backend replaying a fixed script, then repeating `fallback`.
pub struct ScriptedBackend {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<usize>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            calls: Mutex::new(0),
        }
    }

    pub fn answering(text: &str) -> Self {
        Self::new(Vec::new(), Step::Answer(text.to_string()))
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_confidence(&self) -> f64 {
        85.0
    }

    async fn analyze(&self, _image: &DecodedImage) -> Result<String, BackendError> {
        *self.calls.lock().unwrap() += 1;
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Answer(text) => Ok(text),
            Step::Unavailable => Err(BackendError::Unavailable("connection refused".to_string())),
            Step::Rejected => Err(BackendError::Rejected("HTTP 400: unsupported image".to_string())),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(String::new())
            }
        }
    }
}
