//! Catalogue schema bootstrap.

use crate::DbPool;

/// Create the two catalogue tables when they do not exist yet.
///
/// The `secrets` table carries no uniqueness constraint: key uniqueness is
/// enforced by the in-memory bag, and delete-then-rewrite persistence relies
/// on plain inserts.
pub async fn ensure_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS secrets (
            key        TEXT  NOT NULL,
            ciphertext BYTEA NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS desired_units (
            id                   SERIAL PRIMARY KEY,
            path                 TEXT    NOT NULL,
            type                 INTEGER NOT NULL,
            container_name       TEXT    NOT NULL,
            container_image_name TEXT    NOT NULL,
            container_image_tag  TEXT    NOT NULL,
            secrets              JSONB   NOT NULL,
            env                  JSONB   NOT NULL,
            ports                JSONB   NOT NULL,
            volumes              JSONB   NOT NULL,
            schedule             TEXT
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}
