//! Background reconciliation driver for API-triggered syncs.

use berth_core::progress::Reporter;
use berth_engine::ApplySettings;

use crate::notify;
use crate::state::AppState;

/// Run one reconciliation to completion and publish the outcome.
///
/// The caller has already claimed the progress record via `request()`; this
/// function always releases it through `set_outcome`, success or not.
pub async fn perform_sync(state: AppState) {
    let reporter = Reporter::attached(state.progress.clone());
    let mut session = state.pool.take().with_reporter(reporter);

    let (delta, errs) = session.synchronize(&ApplySettings::default()).await;

    for err in &errs {
        tracing::warn!(error = %err, "Synchronization error.");
    }

    if let Some(webhook_url) = &state.options.slack_webhook_url {
        notify::report_sync(webhook_url, delta.as_ref(), &errs).await;
    }

    state.progress.set_outcome(delta, &errs);
}
