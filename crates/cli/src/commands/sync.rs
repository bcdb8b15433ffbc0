//! `berth sync`: one reconciliation from the command line.

use anyhow::{bail, Context as _, Result};
use berth_engine::ApplySettings;

use crate::context;

pub async fn run() -> Result<()> {
    let (options, factory) = context::full_stack().await?;
    let mut session = factory.session();

    let (delta, errs) = session.synchronize(&ApplySettings::default()).await;
    for err in &errs {
        tracing::warn!(error = %err, "Synchronization error.");
    }

    if let Some(webhook_url) = &options.slack_webhook_url {
        berth_api::notify::report_sync(webhook_url, delta.as_ref(), &errs).await;
    }

    let Some(delta) = delta else {
        bail!("synchronization produced no delta");
    };

    let rendered =
        serde_json::to_string_pretty(&delta).context("unable to serialize delta as JSON")?;
    println!("{rendered}");
    Ok(())
}
