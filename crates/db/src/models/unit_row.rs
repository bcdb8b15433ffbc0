//! Row mapping for the `desired_units` table.

use std::collections::BTreeMap;

use berth_core::model::{ContainerSpec, DesiredUnit, UnitType};
use serde::de::DeserializeOwned;

/// Raw `desired_units` row. Collection columns stay as JSONB values until
/// [`UnitRow::into_desired_unit`] decodes them, so one malformed column
/// degrades to an empty collection instead of aborting the whole load.
#[derive(Debug, sqlx::FromRow)]
pub struct UnitRow {
    pub id: i32,
    pub path: String,
    #[sqlx(rename = "type")]
    pub kind: i32,
    pub container_name: String,
    pub container_image_name: String,
    pub container_image_tag: String,
    pub secrets: serde_json::Value,
    pub env: serde_json::Value,
    pub ports: serde_json::Value,
    pub volumes: serde_json::Value,
    pub schedule: Option<String>,
}

impl UnitRow {
    /// Decode the row into the domain model.
    ///
    /// Returns `None` only when the type column is unrecognized; malformed
    /// JSONB columns are warned about and replaced by empty collections. A
    /// row with an empty image name and tag loads with no container.
    pub fn into_desired_unit(self) -> Option<DesiredUnit> {
        let Some(kind) = UnitType::from_i32(self.kind) else {
            tracing::warn!(
                path = %self.path,
                raw_type = self.kind,
                "Unrecognized unit type in desired_units row; skipping.",
            );
            return None;
        };

        let container = if self.container_image_name.is_empty() && self.container_image_tag.is_empty()
        {
            None
        } else {
            Some(ContainerSpec {
                name: self.container_name,
                image_name: self.container_image_name,
                image_tag: self.container_image_tag,
                ..ContainerSpec::default()
            })
        };

        Some(DesiredUnit {
            id: Some(self.id),
            path: self.path.clone(),
            kind,
            container,
            secrets: decode_column(&self.path, "secrets", self.secrets),
            env: decode_column(&self.path, "env", self.env),
            ports: decode_column(&self.path, "ports", self.ports),
            volumes: decode_column(&self.path, "volumes", self.volumes),
            schedule: self.schedule.filter(|s| !s.is_empty()),
        })
    }
}

fn decode_column<T: DeserializeOwned + Default>(
    path: &str,
    column: &str,
    value: serde_json::Value,
) -> T {
    match serde_json::from_value(value) {
        Ok(decoded) => decoded,
        Err(err) => {
            tracing::warn!(
                path,
                column,
                error = %err,
                "Malformed JSONB column in desired_units row; treating as empty.",
            );
            T::default()
        }
    }
}

/// Encode the collection columns of a unit for insert/update binds.
pub fn collection_columns(
    unit: &DesiredUnit,
) -> (
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
) {
    (
        serde_json::to_value(&unit.secrets).unwrap_or_else(|_| serde_json::json!([])),
        serde_json::to_value(&unit.env).unwrap_or_else(|_| serde_json::json!({})),
        serde_json::to_value(&unit.ports).unwrap_or_else(|_| serde_json::json!({})),
        serde_json::to_value(&unit.volumes).unwrap_or_else(|_| serde_json::json!({})),
    )
}
