use std::sync::Arc;

use berth_core::progress::SyncProgress;
use berth_engine::SessionPool;

use crate::config::Options;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<SessionPool>,
    pub options: Arc<Options>,
    /// Process-wide record of the most recent reconciliation.
    pub progress: Arc<SyncProgress>,
}
