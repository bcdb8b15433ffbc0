//! Desired-unit catalogue routes.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use berth_core::builder::DesiredUnitBuilder;
use berth_core::model::{ContainerSpec, DesiredState, DesiredUnit};
use berth_db::repositories::UnitRepo;
use serde::Deserialize;

use crate::auth::Authenticated;
use crate::error::{ApiError, ApiResult};
use crate::extract::Body;
use crate::state::AppState;

/// Container fields accepted on unit creation and update.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContainerPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    image_name: String,
    #[serde(default)]
    image_tag: String,
}

impl ContainerPayload {
    fn is_empty(&self) -> bool {
        self.name.is_empty() && self.image_name.is_empty() && self.image_tag.is_empty()
    }
}

/// Full unit payload for `POST /desired` and `PUT /desired/{id}`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitPayload {
    path: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    container: ContainerPayload,
    #[serde(default)]
    secrets: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    ports: BTreeMap<u16, u16>,
    #[serde(default)]
    volumes: BTreeMap<String, String>,
    #[serde(rename = "calendar", default)]
    schedule: Option<String>,
}

impl UnitPayload {
    /// Run the payload through the validating builder, then check its
    /// secret keys against the session's bag.
    async fn into_unit(
        self,
        session: &mut berth_engine::SessionLease,
    ) -> ApiResult<DesiredUnit> {
        let mut builder = DesiredUnitBuilder::new(session.paths().clone())
            .path(&self.path)?
            .kind_name(&self.type_name)?
            .secrets(self.secrets)
            .env(self.env)
            .ports(self.ports)
            .volumes(self.volumes)?
            .schedule(self.schedule);
        if !self.container.is_empty() {
            builder = builder.container(ContainerSpec {
                name: self.container.name,
                image_name: self.container.image_name,
                image_tag: self.container.image_tag,
                ..ContainerSpec::default()
            });
        }
        let unit = builder.build()?;
        session.validate_secret_keys(&unit.secrets).await?;
        Ok(unit)
    }
}

/// List the catalogue.
async fn list_desired(
    _auth: Authenticated,
    State(state): State<AppState>,
) -> ApiResult<Json<DesiredState>> {
    let session = state.pool.take();
    let units = UnitRepo::list(session.db()).await?;
    Ok(Json(DesiredState {
        units,
        files: BTreeMap::new(),
    }))
}

/// Validate and insert a new desired unit.
async fn create_desired(
    _auth: Authenticated,
    State(state): State<AppState>,
    Body(payload): Body<UnitPayload>,
) -> ApiResult<(StatusCode, Json<DesiredUnit>)> {
    let mut session = state.pool.take();
    let unit = payload.into_unit(&mut session).await?;
    let stored = UnitRepo::insert(session.db(), &unit).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// Validate and overwrite an existing desired unit.
async fn update_desired(
    _auth: Authenticated,
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Body(payload): Body<UnitPayload>,
) -> ApiResult<Json<DesiredUnit>> {
    let mut session = state.pool.take();
    let unit = payload.into_unit(&mut session).await?;
    match UnitRepo::update(session.db(), id, &unit).await? {
        Some(stored) => Ok(Json(stored)),
        None => Err(ApiError::NotFound(format!("no desired unit with id {id}"))),
    }
}

/// Remove a desired unit from the catalogue.
async fn delete_desired(
    _auth: Authenticated,
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<StatusCode> {
    let session = state.pool.take();
    if UnitRepo::delete(session.db(), id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no desired unit with id {id}")))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/desired", get(list_desired).post(create_desired))
        .route("/desired/{id}", put(update_desired).delete(delete_desired))
}
