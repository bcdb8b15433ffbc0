//! Host health routes: disk usage and on-demand pruning.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::Authenticated;
use crate::error::{ApiError, ApiResult};
use crate::extract::Body;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthReport {
    #[serde(rename = "diskUsagePercent")]
    disk_usage_percent: u8,
}

#[derive(Debug, Deserialize)]
struct HealthRequest {
    #[serde(default)]
    action: String,
}

/// Report usage of the container-storage partition.
async fn get_health(
    _auth: Authenticated,
    State(state): State<AppState>,
) -> ApiResult<Json<HealthReport>> {
    let session = state.pool.take();
    let disk_usage_percent = session.read_disk_usage().await?;
    Ok(Json(HealthReport { disk_usage_percent }))
}

/// Perform a host maintenance action. Only `prune` is recognized.
async fn post_health(
    _auth: Authenticated,
    State(state): State<AppState>,
    Body(request): Body<HealthRequest>,
) -> ApiResult<&'static str> {
    match request.action.as_str() {
        "prune" => {
            let session = state.pool.take();
            session.prune().await;
            Ok("ok")
        }
        "" => Err(ApiError::BadRequest("\"action\" is required".into())),
        other => Err(ApiError::BadRequest(format!(
            "unrecognized health action: {other}"
        ))),
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(get_health).post(post_health))
}
