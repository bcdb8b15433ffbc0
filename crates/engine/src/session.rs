//! A session bundles every live connection one operation needs: the
//! catalogue pool, the decoder ring, the container runtime, and the init
//! system, plus a secret bag cached for the duration of a lease.
//!
//! Sessions are owned exclusively by one caller at a time and are not safe
//! for concurrent use; the pool in [`crate::pool`] hands them out.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_core::diff::{self, Delta};
use berth_core::model::{ActualState, DesiredState};
use berth_core::paths::Paths;
use berth_core::progress::Reporter;
use berth_core::secrets::{DecoderRing, SecretBag};
use berth_core::{Error, Result};
use berth_db::repositories::{SecretRepo, UnitRepo};
use berth_db::DbPool;
use bollard::Docker;

use crate::apply::{self, ApplySettings};
use crate::docker;
use crate::probe;
use crate::systemd::InitSystem;

/// Disk usage percentage at which a prune is advised after a sync.
const PRUNE_ADVISORY_PERCENT: u8 = 70;

/// Everything required to mint sessions.
#[derive(Clone)]
pub struct SessionFactory {
    pub(crate) db: DbPool,
    pub(crate) ring: DecoderRing,
    pub(crate) docker: Docker,
    pub(crate) init: Arc<dyn InitSystem>,
    pub(crate) paths: Paths,
    pub(crate) argv0: String,
}

impl SessionFactory {
    pub fn new(
        db: DbPool,
        ring: DecoderRing,
        docker: Docker,
        init: Arc<dyn InitSystem>,
        paths: Paths,
        argv0: String,
    ) -> SessionFactory {
        SessionFactory {
            db,
            ring,
            docker,
            init,
            paths,
            argv0,
        }
    }

    /// Mint a fresh session with an empty secret cache and a detached
    /// reporter.
    pub fn session(&self) -> Session {
        Session {
            db: self.db.clone(),
            ring: self.ring.clone(),
            docker: self.docker.clone(),
            init: Arc::clone(&self.init),
            paths: self.paths.clone(),
            argv0: self.argv0.clone(),
            secrets: None,
            reporter: Reporter::detached(),
        }
    }
}

/// One caller's bundle of connections and cached secrets.
pub struct Session {
    pub(crate) db: DbPool,
    pub(crate) ring: DecoderRing,
    pub(crate) docker: Docker,
    pub(crate) init: Arc<dyn InitSystem>,
    pub(crate) paths: Paths,
    pub(crate) argv0: String,
    pub(crate) secrets: Option<SecretBag>,
    pub(crate) reporter: Reporter,
}

impl Session {
    pub fn db(&self) -> &DbPool {
        &self.db
    }

    pub fn ring(&self) -> &DecoderRing {
        &self.ring
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub fn init_system(&self) -> Arc<dyn InitSystem> {
        Arc::clone(&self.init)
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn argv0(&self) -> &str {
        &self.argv0
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Redirect this session's progress reports (per-lease logger).
    pub fn set_reporter(&mut self, reporter: Reporter) {
        self.reporter = reporter;
    }

    /// Drop per-lease state when a session returns to the pool.
    pub(crate) fn reset_lease_state(&mut self) {
        self.secrets = None;
        self.reporter = Reporter::detached();
    }

    // ── Secrets ──────────────────────────────────────────────────────────

    /// The secret bag, loaded from the catalogue on first use and cached
    /// for the rest of the lease.
    pub async fn secrets(&mut self) -> Result<&SecretBag> {
        if self.secrets.is_none() {
            tracing::debug!("Loading secrets from the catalogue.");
            let bag = SecretRepo::load(&self.db, &self.ring)
                .await
                .map_err(Error::db)?;
            self.secrets = Some(bag);
        }
        Ok(self.secrets.as_ref().expect("secret cache just populated"))
    }

    /// Enumerate the known secret keys.
    pub async fn list_secret_keys(&mut self) -> Result<Vec<String>> {
        Ok(self.secrets().await?.keys())
    }

    /// Fail when any of the requested keys is not loaded in the bag.
    pub async fn validate_secret_keys(&mut self, keys: &[String]) -> Result<()> {
        let bag = self.secrets().await?;
        let missing: Vec<&str> = keys
            .iter()
            .map(String::as_str)
            .filter(|key| !bag.has(key))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "unrecognized secret keys: {}",
                missing.join(", ")
            )))
        }
    }

    /// Add or overwrite many secrets, then persist the bag.
    pub async fn set_secrets(&mut self, entries: BTreeMap<String, String>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.secrets().await?;
        let bag = self.secrets.as_mut().expect("secret cache populated");
        for (key, value) in entries {
            bag.set(key, value);
        }
        SecretRepo::save(&self.db, &self.ring, bag, false)
            .await
            .map_err(Error::db)
    }

    /// Remove many secrets, then truncate-and-rewrite the table so the
    /// deleted rows disappear from the store.
    pub async fn delete_secrets(&mut self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.secrets().await?;
        let bag = self.secrets.as_mut().expect("secret cache populated");
        for key in keys {
            bag.delete(key);
        }
        SecretRepo::save(&self.db, &self.ring, bag, true)
            .await
            .map_err(Error::db)
    }

    // ── State reads ──────────────────────────────────────────────────────

    /// Desired state: catalogue units plus the TLS file contents derived
    /// from the secret bag.
    pub async fn read_desired_state(&mut self) -> Result<DesiredState> {
        let units = UnitRepo::list(&self.db).await.map_err(Error::db)?;
        let paths = self.paths.clone();
        let files = self.secrets().await?.desired_tls_files(&paths)?;
        Ok(DesiredState { units, files })
    }

    /// Resolve image ids and provenance for the desired units. Aggregates
    /// per-image errors; units without a resolvable image keep `None`.
    pub async fn resolve_images(&self, desired: &mut DesiredState) -> Vec<Error> {
        docker::resolve_image_ids(&self.docker, desired).await
    }

    /// Actual state: on-disk unit files, running-container image ids for
    /// the desired units that name a container, and the TLS files.
    pub async fn read_actual_state(&self, desired: &DesiredState) -> Result<ActualState> {
        let mut units = probe::read_unit_files(&self.paths).await?;

        for actual in &mut units {
            let named_container = desired
                .units
                .iter()
                .find(|unit| unit.unit_name() == actual.unit_name())
                .and_then(|unit| unit.container.as_ref())
                .filter(|container| !container.name.is_empty());
            if let Some(container) = named_container {
                actual.image_id = docker::running_image_id(&self.docker, &container.name).await?;
            }
        }

        let files = probe::read_tls_files(&self.paths).await?;
        Ok(ActualState { units, files })
    }

    /// Usage percentage of the container-storage partition.
    pub async fn read_disk_usage(&self) -> Result<u8> {
        probe::read_disk_usage(&self.paths).await
    }

    /// Remove stopped containers and dangling images.
    pub async fn prune(&self) {
        docker::prune(&self.docker).await;
    }

    /// Read both sides and compute the delta without applying anything.
    ///
    /// Image-resolution failures are logged and the diff proceeds with the
    /// ids that are known.
    pub async fn diff(&mut self) -> Result<Delta> {
        let mut desired = self.read_desired_state().await?;
        for err in self.resolve_images(&mut desired).await {
            tracing::warn!(error = %err, "Unable to resolve an image id for the diff.");
        }
        let actual = self.read_actual_state(&desired).await?;
        self.secrets().await?;
        let bag = self.secrets.as_ref().expect("secret cache populated");
        Ok(diff::compute(&desired, &actual, bag, &self.paths, &self.argv0))
    }

    // ── Reconciliation ───────────────────────────────────────────────────

    /// Bring the host to the desired state.
    ///
    /// Pull and resolution errors accumulate without aborting: the delta is
    /// computed with whatever image ids are known, applied, and returned
    /// alongside every error encountered. Only a failure to read state at
    /// all aborts with no delta.
    pub async fn synchronize(&mut self, settings: &ApplySettings) -> (Option<Delta>, Vec<Error>) {
        let mut errs = Vec::new();

        self.reporter.note("Reading desired state.");
        let mut desired = match self.read_desired_state().await {
            Ok(desired) => desired,
            Err(err) => return (None, vec![err]),
        };

        self.reporter.note("Pulling referenced images.");
        errs.extend(docker::pull_all_images(&self.docker, &desired, &self.reporter).await);

        self.reporter.note("Reading updated container images.");
        errs.extend(self.resolve_images(&mut desired).await);

        self.reporter.note("Reading actual state.");
        let actual = match self.read_actual_state(&desired).await {
            Ok(actual) => actual,
            Err(err) => {
                errs.push(err);
                return (None, errs);
            }
        };

        self.reporter.note("Computing delta.");
        if let Err(err) = self.secrets().await {
            errs.push(err);
            return (None, errs);
        }
        let bag = self.secrets.as_ref().expect("secret cache populated");
        let delta = diff::compute(&desired, &actual, bag, &self.paths, &self.argv0);
        self.reporter.report(
            "Applying delta.",
            serde_json::json!({
                "add": delta.units_to_add.len(),
                "change": delta.units_to_change.len(),
                "restart": delta.units_to_restart.len(),
                "remove": delta.units_to_remove.len(),
                "files": delta.files_to_write.len(),
            }),
        );

        errs.extend(apply::apply(&delta, self, settings).await);

        match self.read_disk_usage().await {
            Ok(usage) if usage >= PRUNE_ADVISORY_PERCENT => {
                tracing::warn!(usage, "Disk is getting full: prune advised.");
            }
            Ok(usage) => {
                tracing::info!(usage, "No prune necessary yet.");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Unable to read disk usage.");
            }
        }

        (Some(delta), errs)
    }
}
