//! `berth set-secrets`: merge a JSON file of key/value pairs into the bag.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use berth_db::repositories::SecretRepo;

use crate::context;

pub async fn run(path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unable to load secrets file {}", path.display()))?;
    let incoming: BTreeMap<String, String> = serde_json::from_str(&raw)
        .with_context(|| format!("unable to parse secrets file {}", path.display()))?;

    let options = context::load_options()?;
    let db = context::connect_db(&options).await?;
    let ring = context::build_ring(&options).await?;

    tracing::info!("Loading and decrypting existing secrets.");
    let mut bag = SecretRepo::load(&db, &ring)
        .await
        .context("unable to load existing secrets")?;
    tracing::info!(count = bag.len(), "Secrets loaded successfully.");

    let added = incoming.len();
    for (key, value) in incoming {
        bag.set(key, value);
    }

    SecretRepo::save(&db, &ring, &bag, false)
        .await
        .context("unable to encrypt and save new secrets")?;
    tracing::info!(count = bag.len(), added, "Secrets added successfully.");
    Ok(())
}
