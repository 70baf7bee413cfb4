use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gitpilot_core::error::GitPilotError;

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(GitPilotError::validation(msg).into())
    }

    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<GitPilotError>() {
            Some(GitPilotError::Validation(_) | GitPilotError::InvalidConfig(_)) => {
                StatusCode::BAD_REQUEST
            }
            Some(GitPilotError::SessionNotFound(_) | GitPilotError::UnknownRepository(_)) => {
                StatusCode::NOT_FOUND
            }
            // Only reachable from submit after shutdown has begun.
            Some(GitPilotError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: GitPilotError) -> StatusCode {
        AppError(err.into()).into_response().status()
    }

    #[test]
    fn validation_maps_to_400() {
        assert_eq!(
            status_of(GitPilotError::validation("Commit message cannot be empty")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(GitPilotError::InvalidConfig("max_concurrent".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn missing_things_map_to_404() {
        assert_eq!(
            status_of(GitPilotError::SessionNotFound("s".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(GitPilotError::UnknownRepository("r".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn command_failure_maps_to_500() {
        let err = GitPilotError::Command {
            command: "git status".into(),
            stderr: "fatal: not a git repository".into(),
        };
        assert_eq!(status_of(err), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn foreign_error_maps_to_500() {
        let response = AppError(anyhow::anyhow!("boom")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn closed_coordinator_maps_to_503() {
        assert_eq!(status_of(GitPilotError::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn body_is_json() {
        let response = AppError::bad_request("nope").into_response();
        let ct = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .expect("should have content-type");
        assert!(ct.to_str().unwrap().contains("application/json"));
    }
}
