//! Reconciliation routes: snapshot the in-flight sync, kick off a new one.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use berth_core::progress::SyncSnapshot;

use crate::auth::Authenticated;
use crate::error::ApiResult;
use crate::state::AppState;
use crate::sync;

/// Point-in-time view of the most recent reconciliation.
async fn get_sync(
    _auth: Authenticated,
    State(state): State<AppState>,
) -> ApiResult<Json<SyncSnapshot>> {
    Ok(Json(state.progress.snapshot()))
}

/// Kick off a reconciliation when none is running. Replies 202 either way;
/// `GET /sync` is how callers follow the outcome.
async fn create_sync(
    _auth: Authenticated,
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, &'static str)> {
    if !state.progress.request() {
        return Ok((StatusCode::ACCEPTED, "Sync already in progress"));
    }
    tokio::spawn(sync::perform_sync(state));
    Ok((StatusCode::ACCEPTED, "Sync started"))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/sync", get(get_sync).post(create_sync))
}
