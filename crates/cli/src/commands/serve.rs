//! `berth serve`: initial sync, then the HTTPS management API.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use berth_api::{router, server, state::AppState, telemetry};
use berth_core::progress::SyncProgress;
use berth_engine::{ApplySettings, SessionPool};

use crate::context;

/// Pre-connected sessions kept warm for API requests.
const POOL_LOW_WATER: usize = 2;

pub async fn run(
    cloudwatch_rx: tokio::sync::mpsc::UnboundedReceiver<telemetry::LogLine>,
) -> Result<()> {
    let (options, factory) = context::full_stack().await?;

    // Start mirroring logs to CloudWatch when a group is configured;
    // otherwise drop the receiver so the mirror layer's sends fail fast
    // instead of queueing for the lifetime of the server.
    if let Some(group) = options.cloudwatch_group.clone() {
        tokio::spawn(telemetry::run_shipper(
            options.aws_region.clone(),
            group,
            cloudwatch_rx,
        ));
    } else {
        drop(cloudwatch_rx);
    }

    let pool = SessionPool::new(factory, POOL_LOW_WATER);

    tracing::info!("Performing initial sync.");
    {
        let mut session = pool.take();
        let (delta, errs) = session.synchronize(&ApplySettings::default()).await;
        for err in &errs {
            tracing::warn!(error = %err, "Synchronization error.");
        }
        if !errs.is_empty() {
            bail!("unable to complete the initial synchronization");
        }
        if let Some(delta) = delta {
            tracing::debug!(delta = %delta, "Delta applied.");
        }
    }

    let state = AppState {
        pool,
        options: Arc::new(options.clone()),
        progress: Arc::new(SyncProgress::new()),
    };
    let app = router::build_router(state);

    server::serve(app, &options.listen_address, &berth_core::paths::Paths::default())
        .await
        .context("unable to serve the management API")?;
    Ok(())
}
