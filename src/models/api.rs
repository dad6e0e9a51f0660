use serde::{Deserialize, Serialize};

/// Query string accepted by the submission endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    #[serde(default)]
    pub priority: bool,
}

/// Response after submitting an image for analysis.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub message: String,
    pub estimated_completion: String,
}

/// Response while a task has no stored result yet.
#[derive(Debug, Serialize)]
pub struct ProcessingResponse {
    pub task_id: String,
    pub status: String,
    pub message: String,
}
