//! Secret management routes.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::auth::Authenticated;
use crate::error::ApiResult;
use crate::extract::Body;
use crate::state::AppState;

/// List the known secret keys; values never leave the host.
async fn list_secrets(_auth: Authenticated, State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    let mut session = state.pool.take();
    let keys = session.list_secret_keys().await?;
    Ok(Json(keys))
}

/// Merge-insert a map of key/value pairs and persist the bag.
async fn create_secrets(
    _auth: Authenticated,
    State(state): State<AppState>,
    Body(entries): Body<BTreeMap<String, String>>,
) -> ApiResult<StatusCode> {
    let mut session = state.pool.take();
    session.set_secrets(entries).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Remove the listed keys, then truncate-and-rewrite the table.
async fn delete_secrets(
    _auth: Authenticated,
    State(state): State<AppState>,
    Body(keys): Body<Vec<String>>,
) -> ApiResult<StatusCode> {
    let mut session = state.pool.take();
    session.delete_secrets(&keys).await?;
    Ok(StatusCode::ACCEPTED)
}

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/secrets",
        get(list_secrets).post(create_secrets).delete(delete_secrets),
    )
}
