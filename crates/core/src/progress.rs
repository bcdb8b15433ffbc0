//! Process-wide record of the most recent reconciliation.
//!
//! One reconciliation runs at a time: [`SyncProgress::request`] atomically
//! claims the Idle state. While a run is in flight the [`Reporter`] carried
//! by the session lease appends a timeline entry for every operational log
//! line, and `GET /sync` renders point-in-time snapshots until the next run
//! replaces the record.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::Delta;
use crate::error::Error;

/// One timeline entry of an in-flight reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Unix timestamp of the entry, seconds.
    pub timestamp: i64,
    /// Milliseconds elapsed since the previous entry; zero for the first.
    pub elapsed: i64,
    pub message: String,
    /// Structured fields attached to the log line.
    pub fields: serde_json::Value,
}

#[derive(Debug, Default)]
struct Inner {
    in_progress: bool,
    reports: Vec<Report>,
    errors: Vec<String>,
    delta: Option<Delta>,
    last_report_at: Option<DateTime<Utc>>,
}

/// Serializable point-in-time view of the progress record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub in_progress: bool,
    pub reports: Vec<Report>,
    pub errors: Vec<String>,
    pub delta: Option<Delta>,
}

/// The progress record itself. One per process, guarded by a single mutex.
#[derive(Debug, Default)]
pub struct SyncProgress {
    inner: Mutex<Inner>,
}

impl SyncProgress {
    pub fn new() -> SyncProgress {
        SyncProgress::default()
    }

    /// Claim the record for a new reconciliation.
    ///
    /// Returns false without touching anything when a run is already in
    /// progress; returns true after resetting the timeline and transitioning
    /// Idle to Running.
    pub fn request(&self) -> bool {
        let mut inner = self.inner.lock().expect("sync progress mutex poisoned");
        if inner.in_progress {
            return false;
        }
        inner.in_progress = true;
        inner.reports = Vec::with_capacity(16);
        inner.errors = Vec::new();
        inner.delta = None;
        inner.last_report_at = None;
        true
    }

    /// Append a timeline entry, computing the elapsed gap from the previous
    /// entry.
    pub fn append_report(&self, message: &str, fields: serde_json::Value) {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("sync progress mutex poisoned");
        let elapsed = inner
            .last_report_at
            .map(|previous| (now - previous).num_milliseconds())
            .unwrap_or(0);
        inner.last_report_at = Some(now);
        inner.reports.push(Report {
            timestamp: now.timestamp(),
            elapsed,
            message: message.to_string(),
            fields,
        });
    }

    /// Terminate the run with errors. The record returns to Idle with the
    /// failure exposed until the next request.
    pub fn set_errors(&self, errors: &[Error]) {
        let mut inner = self.inner.lock().expect("sync progress mutex poisoned");
        inner.errors = errors.iter().map(|e| e.to_string()).collect();
        inner.in_progress = false;
    }

    /// Terminate the run with its applied delta.
    pub fn set_delta(&self, delta: Delta) {
        let mut inner = self.inner.lock().expect("sync progress mutex poisoned");
        inner.delta = Some(delta);
        inner.in_progress = false;
    }

    /// Terminate a partially-successful run: both the delta that was applied
    /// and the errors encountered along the way.
    pub fn set_outcome(&self, delta: Option<Delta>, errors: &[Error]) {
        let mut inner = self.inner.lock().expect("sync progress mutex poisoned");
        inner.delta = delta;
        inner.errors = errors.iter().map(|e| e.to_string()).collect();
        inner.in_progress = false;
    }

    /// Point-in-time copy for the API.
    pub fn snapshot(&self) -> SyncSnapshot {
        let inner = self.inner.lock().expect("sync progress mutex poisoned");
        SyncSnapshot {
            in_progress: inner.in_progress,
            reports: inner.reports.clone(),
            errors: inner.errors.clone(),
            delta: inner.delta.clone(),
        }
    }
}

/// Log hook handed to a session lease.
///
/// Every report is emitted as a `tracing` event and, when the reporter is
/// attached to a progress record, appended to its timeline. CLI runs use a
/// detached reporter and only log.
#[derive(Clone, Default)]
pub struct Reporter {
    progress: Option<Arc<SyncProgress>>,
}

impl Reporter {
    /// A reporter that only logs.
    pub fn detached() -> Reporter {
        Reporter::default()
    }

    /// A reporter that mirrors every entry into `progress`.
    pub fn attached(progress: Arc<SyncProgress>) -> Reporter {
        Reporter {
            progress: Some(progress),
        }
    }

    /// Record one operational step.
    pub fn report(&self, message: &str, fields: serde_json::Value) {
        tracing::info!(target: "berth::sync", fields = %fields, "{message}");
        if let Some(progress) = &self.progress {
            progress.append_report(message, fields);
        }
    }

    /// Record one operational step with no structured fields.
    pub fn note(&self, message: &str) {
        self.report(message, serde_json::Value::Null);
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("attached", &self.progress.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_claims_idle_exactly_once() {
        let progress = SyncProgress::new();
        assert!(progress.request());
        assert!(!progress.request());

        progress.set_delta(Delta::default());
        assert!(progress.request());
    }

    #[test]
    fn request_resets_the_previous_record() {
        let progress = SyncProgress::new();
        assert!(progress.request());
        progress.append_report("step one", serde_json::Value::Null);
        progress.set_errors(&[Error::Config("bad".into())]);

        assert!(progress.request());
        let snapshot = progress.snapshot();
        assert!(snapshot.in_progress);
        assert!(snapshot.reports.is_empty());
        assert!(snapshot.errors.is_empty());
        assert!(snapshot.delta.is_none());
    }

    #[test]
    fn reports_accumulate_in_order() {
        let progress = SyncProgress::new();
        assert!(progress.request());
        progress.append_report("first", serde_json::json!({"n": 1}));
        progress.append_report("second", serde_json::Value::Null);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.reports.len(), 2);
        assert_eq!(snapshot.reports[0].message, "first");
        assert_eq!(snapshot.reports[0].elapsed, 0);
        assert_eq!(snapshot.reports[1].message, "second");
        assert!(snapshot.reports[1].elapsed >= 0);
    }

    #[test]
    fn outcome_exposes_delta_and_errors_together() {
        let progress = SyncProgress::new();
        assert!(progress.request());
        progress.set_outcome(Some(Delta::default()), &[Error::Config("pull failed".into())]);

        let snapshot = progress.snapshot();
        assert!(!snapshot.in_progress);
        assert!(snapshot.delta.is_some());
        assert_eq!(snapshot.errors.len(), 1);
    }

    #[test]
    fn attached_reporter_feeds_the_timeline() {
        let progress = Arc::new(SyncProgress::new());
        assert!(progress.request());
        let reporter = Reporter::attached(Arc::clone(&progress));
        reporter.report("Reading desired state.", serde_json::json!({"units": 3}));
        reporter.note("Computing delta.");

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.reports.len(), 2);
        assert_eq!(snapshot.reports[1].message, "Computing delta.");

        // A detached reporter must not panic or record anywhere.
        Reporter::detached().note("ignored");
        assert_eq!(progress.snapshot().reports.len(), 2);
    }
}
