use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

/// Allowance for multipart framing and descriptive fields on top of the file bytes
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    // The upload pipeline enforces the file size limit itself; the body
    // limit only bounds whatever surrounds the file part.
    let upload_limit = match state.config.files.max_file_size {
        0 => DefaultBodyLimit::disable(),
        max => DefaultBodyLimit::max(
            usize::try_from(max)
                .unwrap_or(usize::MAX)
                .saturating_add(MULTIPART_OVERHEAD),
        ),
    };

    Router::new()
        // Files
        .route("/files", get(handlers::list_files))
        .route(
            "/files",
            post(handlers::create_file).layer(upload_limit),
        )
        .route(
            "/files/:id",
            get(handlers::get_file).delete(handlers::delete_file),
        )
        .route("/files/:id/content", get(handlers::download_file))
        .route("/files/:id/metadata", patch(handlers::update_metadata))
        .route("/files/:id/tags", post(handlers::add_tags))
        .route("/files/:id/permissions", put(handlers::set_permissions))
        .route(
            "/files/:id/versions",
            post(handlers::create_version).layer(upload_limit),
        )
        .route("/files/:id/progress", get(handlers::get_progress))
        .route("/stats", get(handlers::stats))
        // Internal
        .route("/_internal/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;

    #[test]
    fn router_builds_without_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let _router = create_router(test_state(&dir));
    }
}
