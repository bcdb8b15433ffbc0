use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Liveness probe; deliberately unauthenticated.
async fn liveness() -> &'static str {
    "ok"
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(liveness))
}
