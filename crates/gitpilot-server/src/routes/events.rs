use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use tokio_stream::StreamExt as _;

use crate::state::AppState;

/// GET /api/events: SSE stream of broadcaster envelopes.
///
/// Each SSE event is named after the envelope's `event` and carries the
/// whole envelope as its data. The stream ends when the server shuts down.
pub async fn sse_events(State(app): State<AppState>) -> impl axum::response::IntoResponse {
    let observer = app.coordinator.subscribe();
    let stream = observer.map(|frame| {
        Ok::<Event, Infallible>(Event::default().event(frame.event.as_str()).data(frame.json.as_str()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
