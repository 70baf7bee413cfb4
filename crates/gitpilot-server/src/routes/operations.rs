use axum::extract::State;
use axum::Json;
use gitpilot_core::types::OperationRequest;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/operations: validate and enqueue an operation.
///
/// Validation failures are answered with 400 and create no session.
pub async fn submit_operation(
    State(app): State<AppState>,
    Json(request): Json<OperationRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = app.coordinator.submit(request)?;
    Ok(Json(serde_json::json!({ "sessionId": id })))
}
