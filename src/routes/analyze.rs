use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::app_state::AppState;
use crate::models::analysis::ResultRecord;
use crate::models::api::{ProcessingResponse, SubmitQuery, SubmitResponse};
use crate::models::task::QueueTier;
use crate::services::gateway::ESTIMATED_COMPLETION;

const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

fn has_allowed_extension(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// POST /api/analyze-food: Upload a food image for analysis.
pub async fn submit_analysis(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, StatusCode> {
    let mut upload: Option<(String, Option<String>, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        if field.name() == Some("image") {
            let filename = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().map(str::to_string);
            let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
            upload = Some((filename, content_type, data.to_vec()));
        }
    }

    let (filename, content_type, image_bytes) = upload.ok_or(StatusCode::BAD_REQUEST)?;
    if filename.is_empty() || !has_allowed_extension(&filename) {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Validate image format using the `image` crate
    image::guess_format(&image_bytes).map_err(|_| StatusCode::BAD_REQUEST)?;

    let tier = if query.priority {
        QueueTier::Priority
    } else {
        QueueTier::Normal
    };

    let submission = state
        .submitter
        .submit(&image_bytes, &filename, content_type.as_deref(), tier)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, filename = %filename, "Failed to enqueue analysis task");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    Ok(Json(SubmitResponse {
        task_id: submission.task_id,
        message: "Image submitted for analysis".to_string(),
        estimated_completion: ESTIMATED_COMPLETION.to_string(),
    }))
}

/// GET /api/results/{task_id}: Poll for an analysis result.
pub async fn get_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, StatusCode> {
    let result = state.results.get(&task_id).await.map_err(|e| {
        tracing::error!(task_id = %task_id, error = %e, "Failed to read result");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(match result {
        Some(result) => (StatusCode::OK, Json(ResultRecord::from(&result))).into_response(),
        None => (
            StatusCode::ACCEPTED,
            Json(ProcessingResponse {
                task_id,
                status: "processing".to_string(),
                message: "Analysis in progress".to_string(),
            }),
        )
            .into_response(),
    })
}
