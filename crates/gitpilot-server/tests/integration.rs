use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use gitpilot_core::testing::{FakeAgent, FakeGit};
use gitpilot_core::{Coordinator, CoordinatorSettings};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A coordinator over fake collaborators with repositories `a` and `b`.
fn coordinator(max_concurrent: usize, git: FakeGit, agent: FakeAgent) -> Coordinator {
    Coordinator::new(
        CoordinatorSettings {
            max_concurrent,
            history_limit: 50,
            hold_timeout: Duration::from_secs(60),
        },
        ["a", "b"]
            .iter()
            .map(|r| (r.to_string(), PathBuf::from(format!("/repos/{r}"))))
            .collect(),
        Arc::new(git),
        Arc::new(agent),
    )
}

fn slow_git() -> FakeGit {
    FakeGit::new()
        .with_remotes(&["origin"])
        .with_mutation_delay(Duration::from_millis(200))
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .header("host", "localhost:3142")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("host", "localhost:3142")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn push_body(repo: &str) -> serde_json::Value {
    json!({ "kind": "push", "repositoryContextId": repo })
}

// ---------------------------------------------------------------------------
// Operations and status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_pushes_with_ceiling_two() {
    let c = coordinator(2, slow_git(), FakeAgent::succeeding());
    let app = gitpilot_server::build_router(c.clone());

    let mut ids = Vec::new();
    for repo in ["a", "b", "a"] {
        let (status, body) = post_json(app.clone(), "/api/operations", push_body(repo)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        ids.push(body["sessionId"].as_str().unwrap().to_string());
    }

    let (status, body) = get(app.clone(), "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["counts"]["running"], 2);
    assert_eq!(body["counts"]["queued"], 1);
    assert_eq!(body["sessions"].as_array().unwrap().len(), 3);
    assert_eq!(body["sessions"][0]["kind"], "push");

    for id in &ids {
        c.wait(id).await.unwrap();
    }
    let (_, body) = get(app, "/api/status").await;
    assert_eq!(body["counts"]["succeeded"], 3);
    assert_eq!(body["counts"]["running"], 0);
}

#[tokio::test]
async fn blank_commit_message_is_rejected_without_a_session() {
    let c = coordinator(2, FakeGit::new(), FakeAgent::succeeding());
    let app = gitpilot_server::build_router(c);

    let (status, body) = post_json(
        app.clone(),
        "/api/operations",
        json!({
            "kind": "commit",
            "repositoryContextId": "a",
            "options": { "message": "   " }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Commit message cannot be empty");

    let (_, body) = get(app, "/api/status").await;
    assert_eq!(body["sessions"].as_array().unwrap().len(), 0);
    assert_eq!(body["counts"]["queued"], 0);
}

#[tokio::test]
async fn unknown_repository_is_404() {
    let app = gitpilot_server::build_router(coordinator(2, FakeGit::new(), FakeAgent::succeeding()));
    let (status, body) = post_json(app, "/api/operations", push_body("missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn unknown_kind_is_a_client_error() {
    let app = gitpilot_server::build_router(coordinator(2, FakeGit::new(), FakeAgent::succeeding()));
    let (status, _) = post_json(
        app,
        "/api/operations",
        json!({ "kind": "rebase", "repositoryContextId": "a" }),
    )
    .await;
    assert!(status.is_client_error(), "got {status}");
}

#[tokio::test]
async fn direct_commit_session_detail() {
    let git = FakeGit::new().with_staged(&["src/lib.rs"]);
    let c = coordinator(2, git.clone(), FakeAgent::succeeding());
    let app = gitpilot_server::build_router(c.clone());

    let (_, body) = post_json(
        app.clone(),
        "/api/operations",
        json!({
            "kind": "commit",
            "repositoryContextId": "a",
            "options": { "message": "fix: handle empty input" }
        }),
    )
    .await;
    let id = body["sessionId"].as_str().unwrap().to_string();
    c.wait(&id).await.unwrap();

    let (status, body) = get(app, &format!("/api/sessions/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id);
    assert_eq!(body["state"], "succeeded");
    assert_eq!(body["result"]["success"], true);
    assert_eq!(body["result"]["payload"]["commitHash"], git.head_hash());
    assert_eq!(git.commit_messages(), vec!["fix: handle empty input"]);
}

#[tokio::test]
async fn missing_session_is_404() {
    let app = gitpilot_server::build_router(coordinator(2, FakeGit::new(), FakeAgent::succeeding()));
    let (status, body) = get(app, "/api/sessions/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_queued_session_never_runs_it() {
    let git = FakeGit::new().with_staged(&["x"]);
    let agent = FakeAgent::hanging();
    let c = coordinator(1, git, agent.clone());
    let app = gitpilot_server::build_router(c.clone());

    let commit = json!({ "kind": "commit", "repositoryContextId": "a" });
    let (_, running) = post_json(app.clone(), "/api/operations", commit.clone()).await;
    let (_, queued) = post_json(app.clone(), "/api/operations", commit).await;
    let running = running["sessionId"].as_str().unwrap().to_string();
    let queued = queued["sessionId"].as_str().unwrap().to_string();

    let (status, body) = post_json(
        app.clone(),
        &format!("/api/sessions/{queued}/cancel"),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);

    let (_, body) = get(app.clone(), &format!("/api/sessions/{queued}")).await;
    assert_eq!(body["state"], "cancelled");
    assert!(body["startedAt"].is_null());

    let (_, body) = post_json(app.clone(), &format!("/api/sessions/{running}/cancel"), json!({})).await;
    assert_eq!(body["accepted"], true);
    c.wait(&running).await.unwrap();
    assert!(agent.runs() <= 1);

    // Terminal now; a second cancel is not accepted.
    let (_, body) = post_json(app, &format!("/api/sessions/{running}/cancel"), json!({})).await;
    assert_eq!(body["accepted"], false);
}

#[tokio::test]
async fn cancel_unknown_session_is_not_accepted() {
    let app = gitpilot_server::build_router(coordinator(2, FakeGit::new(), FakeAgent::succeeding()));
    let (status, body) = post_json(app, "/api/sessions/ghost/cancel", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);
}

// ---------------------------------------------------------------------------
// Context previews
// ---------------------------------------------------------------------------

#[tokio::test]
async fn commit_context_includes_preview() {
    let git = FakeGit::new().with_staged(&["src/main.rs", "README.md"]);
    let app = gitpilot_server::build_router(coordinator(2, git, FakeAgent::succeeding()));

    let (status, body) = get(app, "/api/repositories/a/context/commit").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["context"]["branch"], "main");
    assert_eq!(body["context"]["stagedFiles"].as_array().unwrap().len(), 2);
    let files = body["files"].as_str().unwrap();
    for path in ["src/main.rs", "README.md"] {
        assert_eq!(files.matches(path).count(), 1, "{path}");
    }
    let preview = body["preview"].as_str().unwrap();
    let (head, excerpt) = preview.split_once("Diff:\n").unwrap();
    assert!(head.ends_with(files));
    assert!(excerpt.contains("diff --git a/src/main.rs b/src/main.rs"));
}

#[tokio::test]
async fn push_context_rejects_option_shaped_remote() {
    let git = FakeGit::new().with_remotes(&["origin"]);
    let app = gitpilot_server::build_router(coordinator(2, git, FakeAgent::succeeding()));
    let (status, body) = get(app, "/api/repositories/a/context/push?remote=--receive-pack%3Dx").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Invalid remote"));
}

#[tokio::test]
async fn push_context_honours_remote_query() {
    let git = FakeGit::new().with_remotes(&["upstream", "origin"]).with_ahead(2);
    let app = gitpilot_server::build_router(coordinator(2, git, FakeAgent::succeeding()));

    let (_, body) = get(app.clone(), "/api/repositories/a/context/push").await;
    assert_eq!(body["context"]["remote"], "origin");
    assert_eq!(body["context"]["aheadCount"], 2);
    assert_eq!(body["context"]["hasUpstream"], false);

    let (_, body) = get(app.clone(), "/api/repositories/a/context/push?remote=custom").await;
    assert_eq!(body["context"]["remote"], "custom");

    let (status, _) = get(app, "/api/repositories/zzz/context/push").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Access
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_local_host_cannot_submit() {
    let c = coordinator(2, slow_git(), FakeAgent::succeeding());
    let app = gitpilot_server::build_router(c.clone());

    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/api/operations")
        .header("host", "attacker.example:3142")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(
            serde_json::to_vec(&push_body("a")).unwrap(),
        ))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(c.status().counts.total(), 0);
}

#[tokio::test]
async fn token_admits_non_local_host() {
    let c = coordinator(2, FakeGit::new(), FakeAgent::succeeding());
    let app = gitpilot_server::build_router_with_access(
        c,
        gitpilot_server::auth::AccessConfig::with_token("s3cret"),
    );
    let req = axum::http::Request::builder()
        .uri("/api/status")
        .header("host", "10.0.0.5:3142")
        .header("authorization", "Bearer s3cret")
        .body(axum::body::Body::empty())
        .unwrap();
    assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn cors_preflight_only_allows_loopback_origins() {
    let app = gitpilot_server::build_router(coordinator(2, FakeGit::new(), FakeAgent::succeeding()));
    let preflight = |origin: &'static str| {
        axum::http::Request::builder()
            .method("OPTIONS")
            .uri("/api/operations")
            .header("host", "localhost:3142")
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(axum::body::Body::empty())
            .unwrap()
    };

    let evil = app.clone().oneshot(preflight("https://evil.example")).await.unwrap();
    assert!(evil
        .headers()
        .get("access-control-allow-origin")
        .is_none());

    let local = app.oneshot(preflight("http://localhost:5173")).await.unwrap();
    assert_eq!(
        local.headers().get("access-control-allow-origin").unwrap(),
        "http://localhost:5173"
    );
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sse_streams_state_envelopes_until_shutdown() {
    let c = coordinator(2, FakeGit::new().with_remotes(&["origin"]), FakeAgent::succeeding());
    let app = gitpilot_server::build_router(c.clone());

    let req = axum::http::Request::builder()
        .uri("/api/events")
        .header("host", "127.0.0.1:3142")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let ct = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(ct.starts_with("text/event-stream"), "{ct}");

    let id = c.submit(gitpilot_core::types::OperationRequest::new(
        gitpilot_core::types::OperationKind::Push,
        "a",
    ))
    .unwrap();

    let mut body = response.into_body();
    let mut text = String::new();
    while !text.contains("\"succeeded\"") {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("no SSE frame within 2s")
            .expect("stream ended early")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            text.push_str(&String::from_utf8_lossy(&data));
        }
    }
    assert!(text.contains("event: session.state"));
    assert!(text.contains(&id));

    c.shutdown(Duration::from_secs(1)).await;
    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(frame) = body.frame().await {
            frame.unwrap();
        }
    })
    .await;
    assert!(ended.is_ok(), "SSE stream still open after shutdown");
}

#[tokio::test]
async fn submit_after_shutdown_is_503() {
    let c = coordinator(2, FakeGit::new(), FakeAgent::succeeding());
    c.shutdown(Duration::from_millis(100)).await;
    let app = gitpilot_server::build_router(c);
    let (status, _) = post_json(app, "/api/operations", push_body("a")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

async fn raw_get(addr: std::net::SocketAddr, host: &str, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn serve_on_answers_local_and_gates_remote_hosts() {
    let c = coordinator(2, FakeGit::new(), FakeAgent::succeeding());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(gitpilot_server::serve_on(
        c,
        listener,
        gitpilot_server::auth::AccessConfig::local_only(),
        false,
    ));

    let local = raw_get(addr, &format!("localhost:{}", addr.port()), "/api/status").await;
    assert!(local.starts_with("HTTP/1.1 200"), "{local}");
    assert!(local.contains("\"counts\""), "{local}");

    let rebound = raw_get(addr, "rebind.attacker.example", "/api/status").await;
    assert!(rebound.starts_with("HTTP/1.1 401"), "{rebound}");

    server.abort();
}
