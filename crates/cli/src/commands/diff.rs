//! `berth diff`: print the computed delta without applying it.

use anyhow::{Context as _, Result};

use crate::context;

pub async fn run() -> Result<()> {
    let (_options, factory) = context::full_stack().await?;
    let mut session = factory.session();

    tracing::info!("Computing delta.");
    let delta = session.diff().await.context("unable to compute delta")?;

    let rendered =
        serde_json::to_string_pretty(&delta).context("unable to serialize delta as JSON")?;
    println!("{rendered}");
    Ok(())
}
