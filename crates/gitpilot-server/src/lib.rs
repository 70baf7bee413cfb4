pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use gitpilot_core::Coordinator;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::AccessConfig;

/// How long shutdown waits for cancelled sessions to release their permits.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the axum Router with all API routes and middleware, serving
/// loopback hosts only. Available for integration testing.
pub fn build_router(coordinator: Coordinator) -> Router {
    build_router_with_access(coordinator, AccessConfig::local_only())
}

/// Build the router behind the given access policy. Used by `serve()`.
pub fn build_router_with_access(coordinator: Coordinator, access: AccessConfig) -> Router {
    let app_state = state::AppState::new(coordinator);

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| {
            auth::is_loopback_origin(origin)
        }))
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Real-time observers
        .route("/api/events", get(routes::events::sse_events))
        .route("/api/ws", get(routes::ws::ws_upgrade))
        // Operations
        .route(
            "/api/operations",
            post(routes::operations::submit_operation),
        )
        .route("/api/status", get(routes::status::get_status))
        .route("/api/sessions/{id}", get(routes::sessions::get_session))
        .route(
            "/api/sessions/{id}/cancel",
            post(routes::sessions::cancel_session),
        )
        // Context previews
        .route(
            "/api/repositories/{id}/context/commit",
            get(routes::context::commit_context),
        )
        .route(
            "/api/repositories/{id}/context/push",
            get(routes::context::push_context),
        )
        .layer(middleware::from_fn_with_state(
            Arc::new(access),
            auth::access_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Start the gitpilot server on `host:port`.
pub async fn serve(
    coordinator: Coordinator,
    host: &str,
    port: u16,
    access: AccessConfig,
    open_browser: bool,
) -> anyhow::Result<()> {
    if !auth::is_loopback_authority(host) && access.token.is_none() {
        tracing::warn!(
            host = %host,
            "listening beyond loopback without a token; only local Host headers are served"
        );
    }
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    serve_on(coordinator, listener, access, open_browser).await
}

/// Start the gitpilot server on a pre-bound listener.
///
/// Unlike `serve`, this accepts a `TcpListener` that was already bound so the
/// caller can read the actual port before starting (useful when `port = 0` and
/// the OS picks a free port).
pub async fn serve_on(
    coordinator: Coordinator,
    listener: tokio::net::TcpListener,
    access: AccessConfig,
    open_browser: bool,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router_with_access(coordinator.clone(), access);

    tracing::info!(
        repositories = ?coordinator.repository_ids(),
        max_concurrent = coordinator.max_concurrent(),
        "gitpilot listening on http://localhost:{actual_port}"
    );

    if open_browser {
        let url = format!("http://localhost:{actual_port}");
        let _ = open::that(&url);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await?;
    Ok(())
}

/// Resolve on Ctrl-C after every session has been cancelled and observer
/// streams have ended, so open SSE and WebSocket connections do not hold the
/// server open.
async fn shutdown_signal(coordinator: Coordinator) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
    coordinator.shutdown(SHUTDOWN_TIMEOUT).await;
}
