//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. Redis running (broker and result cache)
//! 2. Gateway running on configured port
//! 3. Worker process running with a reachable analysis backend
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:5000)

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;

/// Get base URL from env or default to localhost
fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:5000".to_string())
}

#[tokio::test]
#[ignore] // Requires running gateway and infrastructure
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/health", base_url))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );

    let body: serde_json::Value = response.json().await.expect("Health body is JSON");
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "food-analysis-backend");

    println!("✓ Health check passed");
}

#[tokio::test]
#[ignore] // Requires running gateway and infrastructure
async fn test_e2e_rejects_non_image_upload() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let result = upload_food_image(&client, &base_url, b"plain text".to_vec(), "notes.txt", false).await;
    assert!(result.is_err(), "Non-image upload must be rejected");

    println!("✓ Non-image upload rejected");
}

#[tokio::test]
#[ignore] // Requires running gateway and infrastructure
async fn test_e2e_unknown_task_reads_as_processing() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/results/{}", base_url, uuid::Uuid::new_v4()))
        .send()
        .await
        .expect("Result request failed");

    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "processing");
}

#[tokio::test]
#[ignore] // Requires running gateway, worker and analysis backend
async fn test_e2e_submit_and_poll() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let submitted = upload_food_image(&client, &base_url, pixel_png_bytes(), "pixel.png", false)
        .await
        .expect("Failed to upload image");
    println!("Submitted task {}", submitted.task_id);
    assert_eq!(submitted.estimated_completion, "30-60 seconds");

    let result = poll_result(&client, &base_url, &submitted.task_id, 120)
        .await
        .expect("Task did not complete");

    assert_eq!(result["task_id"], submitted.task_id.as_str());
    let status = result["status"].as_str().unwrap_or_default();
    assert!(status == "completed" || status == "error", "Unexpected status: {status}");

    let confidence = result["confidence"]["value"].as_f64().unwrap_or(-1.0);
    assert!((0.0..=100.0).contains(&confidence), "Confidence out of range: {confidence}");
    assert!(result["calories"]["value"].as_f64().unwrap_or(-1.0) >= 0.0);

    println!(
        "  ✓ {} - {} ({} kcal)",
        submitted.task_id, result["food_name"], result["calories"]["value"]
    );
}

#[tokio::test]
#[ignore] // Requires running gateway, worker and analysis backend
async fn test_e2e_concurrent_mixed_priority_uploads() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let uploads = [false, true, false, true].map(|priority| {
        let client = &client;
        let base_url = &base_url;
        async move {
            let submitted =
                upload_food_image(client, base_url, pixel_png_bytes(), "pixel.png", priority).await?;
            let result = poll_result(client, base_url, &submitted.task_id, 180).await?;
            Ok::<_, Box<dyn std::error::Error>>((submitted.task_id, result))
        }
    });

    // Wait for all uploads to complete
    let results = futures::future::join_all(uploads).await;

    let mut completed = 0;
    for result in results {
        match result {
            Ok((task_id, body)) => {
                println!("  ✓ {} finished with status: {}", task_id, body["status"]);
                assert_eq!(body["task_id"], task_id.as_str());
                completed += 1;
            }
            Err(e) => println!("  ✗ Upload/processing error: {}", e),
        }
    }

    assert!(
        completed > 0,
        "At least one concurrent upload should complete successfully"
    );

    println!("\n  ✓ Successfully processed {} concurrent uploads", completed);
}
