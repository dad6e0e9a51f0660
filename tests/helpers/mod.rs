//! Test helper utilities for E2E testing against a running gateway
#![allow(dead_code)]

use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

/// Response from POST /api/analyze-food
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
    pub message: String,
    pub estimated_completion: String,
}

/// Upload image bytes to the analyze endpoint
pub async fn upload_food_image(
    client: &reqwest::Client,
    base_url: &str,
    image_bytes: Vec<u8>,
    filename: &str,
    priority: bool,
) -> Result<SubmitResponse, Box<dyn std::error::Error>> {
    let form = multipart::Form::new().part(
        "image",
        multipart::Part::bytes(image_bytes)
            .file_name(filename.to_string())
            .mime_str("image/png")?,
    );

    let response = client
        .post(format!("{}/api/analyze-food", base_url))
        .query(&[("priority", priority)])
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Upload failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<SubmitResponse>().await?)
}

/// Poll the result endpoint until a stored result appears (with timeout)
pub async fn poll_result(
    client: &reqwest::Client,
    base_url: &str,
    task_id: &str,
    timeout_secs: u64,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/results/{}", base_url, task_id))
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::OK => return Ok(response.json().await?),
            reqwest::StatusCode::ACCEPTED => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!("  ... still processing (attempt {}/{})", attempt, max_attempts);
                }
                sleep(Duration::from_millis(500)).await;
            }
            status => {
                let error_text = response.text().await?;
                return Err(format!("Result check failed with {}: {}", status, error_text).into());
            }
        }
    }

    Err(format!("Task did not complete within {} seconds", timeout_secs).into())
}
