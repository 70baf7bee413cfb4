use axum::extract::{Path, Query, State};
use axum::Json;
use gitpilot_core::types::OperationOptions;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/repositories/:id/context/commit: staged changes and their preview.
pub async fn commit_context(
    State(app): State<AppState>,
    Path(repo): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctx = app.coordinator.commit_context(&repo).await?;
    Ok(Json(serde_json::json!({
        "context": ctx,
        "files": ctx.file_list(),
        "preview": ctx.preview(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct PushQuery {
    pub remote: Option<String>,
    pub branch: Option<String>,
}

/// GET /api/repositories/:id/context/push: push target and unpushed commits.
pub async fn push_context(
    State(app): State<AppState>,
    Path(repo): Path<String>,
    Query(query): Query<PushQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let options = OperationOptions {
        remote: query.remote.filter(|r| !r.trim().is_empty()),
        branch: query.branch.filter(|b| !b.trim().is_empty()),
        ..Default::default()
    };
    let ctx = app.coordinator.push_context(&repo, &options).await?;
    Ok(Json(serde_json::json!({
        "context": ctx,
        "preview": ctx.preview(),
    })))
}
