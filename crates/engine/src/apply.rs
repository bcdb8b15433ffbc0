//! Execution of a delta against the filesystem, the container runtime's
//! unit files, and the init system.
//!
//! Phases run in a strict order: file writes land before any unit starts so
//! volume-mounted content is present; removals stop and disable before the
//! reload; the reload gates everything that needs systemd's refreshed view;
//! starts, restarts, and file removals follow; and a TLS rewrite exits the
//! process so systemd relaunches the coordinator under the new material.
//!
//! Individual failures accumulate and are returned together. Only a failed
//! reload aborts the remaining phases, because they would act on stale
//! unit-file state.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{chown, DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

use berth_core::diff::Delta;
use berth_core::model::DesiredUnit;
use berth_core::render::render_unit;
use berth_core::secrets::SecretBag;
use berth_core::{Error, Result};

use crate::session::Session;
use crate::systemd::InitSystem;

/// Ownership applied to files the applier writes. `None` leaves the
/// process's default ownership in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplySettings {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl ApplySettings {
    fn wants_chown(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }
}

/// Apply `delta` through the session's connections.
///
/// Returns every error encountered; an empty vector means the host now
/// matches the desired state. Exits the process with status 0 after a TLS
/// rewrite (phase 10).
pub async fn apply(delta: &Delta, session: &mut Session, settings: &ApplySettings) -> Vec<Error> {
    let errs = apply_phases(delta, session, settings).await;

    if delta.coordinator_restart_needed {
        tracing::info!("TLS material changed; restarting coordinator.");
        std::process::exit(0);
    }

    errs
}

/// Phases 1 through 9. Split from [`apply`] so the self-restart gate stays
/// at the outermost layer.
async fn apply_phases(
    delta: &Delta,
    session: &mut Session,
    settings: &ApplySettings,
) -> Vec<Error> {
    let mut errs = Vec::new();

    let init = session.init_system();
    let argv0 = session.argv0().to_string();
    let bag = match session.secrets().await {
        Ok(bag) => bag.clone(),
        Err(err) => {
            errs.push(err);
            return errs;
        }
    };

    let mut needs_reload = false;
    let mut restart_names: Vec<String> =
        Vec::with_capacity(delta.units_to_change.len() + delta.units_to_restart.len());

    // Phase 1: managed file writes.
    for (path, content) in delta.file_contents() {
        if let Err(err) = write_managed_file(path, content, settings) {
            errs.push(err);
            continue;
        }
        tracing::info!(path, "File content written.");
    }

    // Phase 2: create unit files for new units.
    for unit in &delta.units_to_add {
        needs_reload = true;
        if let Err(err) = write_unit_file(unit, &bag, &argv0, settings) {
            errs.push(err);
            continue;
        }
        tracing::info!(unit = unit.unit_name(), path = %unit.path, "Unit file created.");
    }

    // Phase 3: overwrite unit files for changed units and queue restarts.
    for unit in &delta.units_to_change {
        needs_reload = true;
        restart_names.push(unit.unit_name().to_string());
        if let Err(err) = write_unit_file(unit, &bag, &argv0, settings) {
            errs.push(err);
            continue;
        }
        tracing::info!(unit = unit.unit_name(), path = %unit.path, "Unit file modified.");
    }

    // Phase 4: queue restart-only units.
    restart_names.extend(
        delta
            .units_to_restart
            .iter()
            .map(|unit| unit.unit_name().to_string()),
    );

    // Phase 5: stop and disable units slated for removal.
    if delta.units_to_remove.is_empty() {
        tracing::debug!("No units to remove.");
    } else {
        let names: Vec<String> = delta
            .units_to_remove
            .iter()
            .map(|unit| unit.unit_name().to_string())
            .collect();

        errs.extend(
            fan_out(&names, |name| {
                let init = Arc::clone(&init);
                async move {
                    tracing::debug!(unit = %name, "Stopping unit.");
                    if let Err(err) = init.stop_unit(&name).await {
                        // Failed stop escalates to SIGKILL; the unit must
                        // not outlive its removal.
                        tracing::info!(unit = %name, "Killing unit.");
                        if let Err(kill_err) = init.kill_unit(&name, 9).await {
                            tracing::warn!(unit = %name, error = %kill_err, "Unable to kill unit.");
                        }
                        return Err(err);
                    }
                    Ok(())
                }
            })
            .await,
        );
        tracing::debug!(count = names.len(), "Units stopped or killed.");

        if let Err(err) = init.disable_unit_files(&names).await {
            errs.push(err);
        } else {
            tracing::debug!(count = names.len(), "Units disabled.");
        }
    }

    // Phase 6: reload. A failure here aborts the remainder, which depends
    // on systemd's refreshed view of the unit files.
    if needs_reload {
        tracing::debug!("Reloading systemd unit files.");
        if let Err(err) = init.daemon_reload().await {
            errs.push(err);
            return errs;
        }
    }

    // Phase 7: start and enable new units.
    if delta.units_to_add.is_empty() {
        tracing::debug!("No units to start and enable.");
    } else {
        let names: Vec<String> = delta
            .units_to_add
            .iter()
            .map(|unit| unit.unit_name().to_string())
            .collect();
        errs.extend(
            fan_out(&names, |name| {
                let init = Arc::clone(&init);
                async move {
                    tracing::debug!(unit = %name, "Starting unit.");
                    init.start_unit(&name).await
                }
            })
            .await,
        );
        tracing::info!(count = names.len(), "Units started.");

        let paths: Vec<String> = delta
            .units_to_add
            .iter()
            .map(|unit| unit.path.clone())
            .collect();
        if let Err(err) = init.enable_unit_files(&paths).await {
            errs.push(err);
        } else {
            tracing::info!(count = paths.len(), "Units enabled.");
        }
    }

    // Phase 8: restart changed and cycled units.
    if restart_names.is_empty() {
        tracing::debug!("No units to restart.");
    } else {
        errs.extend(
            fan_out(&restart_names, |name| {
                let init = Arc::clone(&init);
                async move {
                    tracing::debug!(unit = %name, "Restarting unit.");
                    init.restart_unit(&name).await
                }
            })
            .await,
        );
        tracing::info!(count = restart_names.len(), "Units restarted.");
    }

    // Phase 9: remove unit files for the stopped units.
    for unit in &delta.units_to_remove {
        if let Err(err) = std::fs::remove_file(&unit.path) {
            errs.push(Error::fs(&unit.path, err));
            continue;
        }
        tracing::info!(path = %unit.path, "Removed unit file.");
    }

    errs
}

/// Dispatch one task per name and drain exactly one completion each.
///
/// Every task posts a completion whether it succeeds or fails, and a failed
/// spawn-side dispatch posts the sentinel too, so the drain below never
/// waits on a completion that cannot arrive.
async fn fan_out<F, Fut>(names: &[String], task: F) -> Vec<Error>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Option<Error>>(names.len().max(1));
    for name in names {
        let tx = tx.clone();
        let fut = task(name.clone());
        tokio::spawn(async move {
            let outcome = fut.await.err();
            let _ = tx.send(outcome).await;
        });
    }
    drop(tx);

    let mut errs = Vec::new();
    while let Some(outcome) = rx.recv().await {
        if let Some(err) = outcome {
            errs.push(err);
        }
    }
    errs
}

/// Write a managed file: parents created 0750 and group-owned, content
/// written atomically 0600, then ownership applied.
fn write_managed_file(path: &str, content: &[u8], settings: &ApplySettings) -> Result<()> {
    let target = Path::new(path);
    if let Some(dir) = target.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(dir)
            .map_err(|e| Error::fs(dir, e))?;
        if settings.gid.is_some() {
            chown(dir, None, settings.gid).map_err(|e| Error::fs(dir, e))?;
        }
    }

    let staged = target.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&staged)
            .map_err(|e| Error::fs(&staged, e))?;
        file.write_all(content).map_err(|e| Error::fs(&staged, e))?;
    }
    std::fs::rename(&staged, target).map_err(|e| Error::fs(target, e))?;

    if settings.wants_chown() {
        chown(target, settings.uid, settings.gid).map_err(|e| Error::fs(target, e))?;
        tracing::info!(path, uid = settings.uid, gid = settings.gid, "File ownership modified.");
    }
    Ok(())
}

/// Render and write a unit file in place, mode 0644.
fn write_unit_file(
    unit: &DesiredUnit,
    bag: &SecretBag,
    argv0: &str,
    settings: &ApplySettings,
) -> Result<()> {
    let rendered = render_unit(unit, bag, argv0)?;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&unit.path)
        .map_err(|e| Error::fs(&unit.path, e))?;
    file.write_all(rendered.as_bytes())
        .map_err(|e| Error::fs(&unit.path, e))?;
    drop(file);

    if settings.wants_chown() {
        chown(Path::new(&unit.path), settings.uid, settings.gid)
            .map_err(|e| Error::fs(&unit.path, e))?;
        tracing::info!(
            path = %unit.path,
            uid = settings.uid,
            gid = settings.gid,
            "Unit file ownership modified.",
        );
    }
    Ok(())
}
