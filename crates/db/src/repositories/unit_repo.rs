//! Repository for the `desired_units` table.

use berth_core::model::DesiredUnit;

use crate::models::unit_row::{collection_columns, UnitRow};
use crate::DbPool;

/// Column list for `desired_units` queries.
const COLUMNS: &str = "\
    id, path, type, container_name, container_image_name, container_image_tag, \
    secrets, env, ports, volumes, schedule";

/// Validated CRUD over desired units.
///
/// Inputs are [`DesiredUnit`] values that already passed the builder; this
/// layer only translates to and from rows.
pub struct UnitRepo;

impl UnitRepo {
    /// Load every desired unit, ordered by id. Rows that fail to decode are
    /// warned about and skipped.
    pub async fn list(pool: &DbPool) -> Result<Vec<DesiredUnit>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM desired_units ORDER BY id ASC");
        let rows = sqlx::query_as::<_, UnitRow>(&query).fetch_all(pool).await?;
        Ok(rows.into_iter().filter_map(UnitRow::into_desired_unit).collect())
    }

    /// Insert a new desired unit and return it with its assigned id.
    pub async fn insert(pool: &DbPool, unit: &DesiredUnit) -> Result<DesiredUnit, sqlx::Error> {
        let (secrets, env, ports, volumes) = collection_columns(unit);
        let (container_name, image_name, image_tag) = container_columns(unit);
        let query = format!(
            "INSERT INTO desired_units \
                (path, type, container_name, container_image_name, container_image_tag, \
                 secrets, env, ports, volumes, schedule) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, UnitRow>(&query)
            .bind(&unit.path)
            .bind(unit.kind.as_i32())
            .bind(container_name)
            .bind(image_name)
            .bind(image_tag)
            .bind(secrets)
            .bind(env)
            .bind(ports)
            .bind(volumes)
            .bind(unit.schedule.as_deref().unwrap_or_default())
            .fetch_one(pool)
            .await?;
        Ok(row
            .into_desired_unit()
            .expect("freshly inserted row decodes"))
    }

    /// Overwrite an existing desired unit. Returns the stored unit, or
    /// `None` when the id does not exist.
    pub async fn update(
        pool: &DbPool,
        id: i32,
        unit: &DesiredUnit,
    ) -> Result<Option<DesiredUnit>, sqlx::Error> {
        let (secrets, env, ports, volumes) = collection_columns(unit);
        let (container_name, image_name, image_tag) = container_columns(unit);
        let query = format!(
            "UPDATE desired_units SET \
                path = $2, type = $3, container_name = $4, \
                container_image_name = $5, container_image_tag = $6, \
                secrets = $7, env = $8, ports = $9, volumes = $10, schedule = $11 \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, UnitRow>(&query)
            .bind(id)
            .bind(&unit.path)
            .bind(unit.kind.as_i32())
            .bind(container_name)
            .bind(image_name)
            .bind(image_tag)
            .bind(secrets)
            .bind(env)
            .bind(ports)
            .bind(volumes)
            .bind(unit.schedule.as_deref().unwrap_or_default())
            .fetch_optional(pool)
            .await?;
        Ok(row.and_then(UnitRow::into_desired_unit))
    }

    /// Remove a desired unit. Returns true when a row was deleted.
    pub async fn delete(pool: &DbPool, id: i32) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM desired_units WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn container_columns(unit: &DesiredUnit) -> (String, String, String) {
    match &unit.container {
        Some(container) => (
            container.name.clone(),
            container.image_name.clone(),
            container.image_tag.clone(),
        ),
        None => (String::new(), String::new(), String::new()),
    }
}
