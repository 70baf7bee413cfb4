use axum::extract::State;
use axum::Json;
use gitpilot_core::types::QueueStatus;

use crate::state::AppState;

/// GET /api/status: per-state counts and every retained session.
pub async fn get_status(State(app): State<AppState>) -> Json<QueueStatus> {
    Json(app.coordinator.status())
}
