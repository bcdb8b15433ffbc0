//! On-demand diff route.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use berth_core::diff::Delta;

use crate::auth::Authenticated;
use crate::error::ApiResult;
use crate::state::AppState;

/// Compute the delta between the catalogue and the host without applying
/// anything.
async fn get_diff(_auth: Authenticated, State(state): State<AppState>) -> ApiResult<Json<Delta>> {
    let mut session = state.pool.take();
    let delta = session.diff().await?;
    Ok(Json(delta))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/diff", get(get_diff))
}
