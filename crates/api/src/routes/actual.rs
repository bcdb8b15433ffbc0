//! Actual-state route.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use berth_core::model::ActualState;

use crate::auth::Authenticated;
use crate::error::ApiResult;
use crate::state::AppState;

/// Probe and return the host's observable state.
async fn list_actual(
    _auth: Authenticated,
    State(state): State<AppState>,
) -> ApiResult<Json<ActualState>> {
    let mut session = state.pool.take();
    let desired = session.read_desired_state().await?;
    let actual = session.read_actual_state(&desired).await?;
    Ok(Json(actual))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/actual", get(list_actual))
}
