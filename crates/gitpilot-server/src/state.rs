use gitpilot_core::Coordinator;

/// Shared application state passed to all route handlers.
///
/// The coordinator owns every piece of mutable state (queue, lock table,
/// observers); handlers only hold a cheap clone of it.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }
}
