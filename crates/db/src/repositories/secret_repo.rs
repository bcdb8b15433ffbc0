//! Repository for the `secrets` table.
//!
//! Values are stored as envelope ciphertext; this layer seals and opens them
//! through the decoder ring on the way in and out.

use berth_core::secrets::{DecoderRing, SecretBag};

use crate::DbPool;

/// Persistence for the secret bag.
pub struct SecretRepo;

impl SecretRepo {
    /// Load and decrypt every secret row into a bag.
    ///
    /// A row that fails to decrypt, or whose plaintext is not UTF-8, is
    /// warned about and skipped; a corrupt row never takes down the load.
    pub async fn load(pool: &DbPool, ring: &DecoderRing) -> Result<SecretBag, sqlx::Error> {
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT key, ciphertext FROM secrets")
                .fetch_all(pool)
                .await?;

        let mut bag = SecretBag::new();
        for (key, ciphertext) in rows {
            let plaintext = match ring.decrypt(&ciphertext).await {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    tracing::warn!(key, error = %err, "Unable to decrypt secret row; skipping.");
                    continue;
                }
            };
            match String::from_utf8(plaintext) {
                Ok(value) => bag.set(key, value),
                Err(_) => {
                    tracing::warn!(key, "Secret plaintext is not UTF-8; skipping.");
                }
            }
        }
        Ok(bag)
    }

    /// Encrypt and persist the bag.
    ///
    /// Every value is sealed under its own data key before the transaction
    /// opens. With `truncate` set the table is cleared first, which is how
    /// deleted secrets leave the store. A value that fails to encrypt is
    /// warned about and its row skipped while the rest commit.
    pub async fn save(
        pool: &DbPool,
        ring: &DecoderRing,
        bag: &SecretBag,
        truncate: bool,
    ) -> Result<(), sqlx::Error> {
        let mut rows: Vec<(String, Vec<u8>)> = Vec::with_capacity(bag.len());
        for (key, value) in bag.iter() {
            match ring.encrypt(value.as_bytes()).await {
                Ok(ciphertext) => rows.push((key.to_string(), ciphertext)),
                Err(err) => {
                    tracing::warn!(key, error = %err, "Unable to encrypt secret; skipping row.");
                }
            }
        }

        let mut tx = pool.begin().await?;
        if truncate {
            sqlx::query("DELETE FROM secrets").execute(&mut *tx).await?;
        }
        for (key, ciphertext) in &rows {
            sqlx::query("INSERT INTO secrets (key, ciphertext) VALUES ($1, $2)")
                .bind(key)
                .bind(ciphertext)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::debug!(count = rows.len(), truncate, "Secret rows persisted.");
        Ok(())
    }
}
