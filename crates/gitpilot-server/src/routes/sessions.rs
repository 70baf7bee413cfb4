use axum::extract::{Path, State};
use axum::Json;
use gitpilot_core::types::Session;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/sessions/:id: full session with its progress log and result.
pub async fn get_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, AppError> {
    Ok(Json(app.coordinator.session(&id)?))
}

/// POST /api/sessions/:id/cancel: request cancellation.
///
/// Unknown and already-terminal sessions answer `accepted: false` rather
/// than an error.
pub async fn cancel_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let accepted = app.coordinator.cancel(&id);
    Json(serde_json::json!({ "accepted": accepted }))
}
