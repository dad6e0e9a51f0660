use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Task message placed on the queue by the gateway.
///
/// `image_data` is base64 text, optionally carrying a scheme prefix such as
/// `data:image/png;base64,` ahead of the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub task_id: String,
    pub image_data: String,
    #[serde(default = "default_filename")]
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_filename() -> String {
    "unknown".to_string()
}

/// Queue tier a task is published to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueTier {
    #[default]
    Normal,
    Priority,
}
