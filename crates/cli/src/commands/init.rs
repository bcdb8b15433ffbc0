//! `berth init`: one-time host bootstrap.
//!
//! Creates the catalogue schema, the service user and group, the managed
//! directories, and the message-bus and authorization policy files, then
//! runs a first synchronization owned by the created user.

use std::os::unix::fs::chown;
use std::path::Path;

use anyhow::{bail, Context as _, Result};
use berth_api::config::{DEFAULT_OPTIONS_PATH, OPTIONS_ENV_VAR};
use berth_core::paths::Paths;
use berth_engine::{docker, ApplySettings};
use tokio::process::Command;

use crate::context;

const GROUP_NAME: &str = "berth";
const USER_NAME: &str = "berth";

const DBUS_POLICY_PATH: &str = "/etc/dbus-1/system.d/berth.conf";
const POLKIT_RULES_PATH: &str = "/etc/polkit-1/rules.d/00-berth.rules";

/// System-bus policy allowing the service user to drive unit lifecycle
/// calls on the systemd manager.
const DBUS_POLICY: &str = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
<busconfig>
    <policy user="berth">
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="GetUnit" />
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="ListUnitFilesByPatterns" />
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="StartUnit" />
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="StopUnit" />
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="RestartUnit" />
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="ReloadOrRestartUnit" />
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="KillUnit" />
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="Reload" />
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="EnableUnitFiles" />
        <allow send_destination="org.freedesktop.systemd1" send_interface="org.freedesktop.systemd1.Manager" send_member="DisableUnitFiles" />
    </policy>
</busconfig>
"#;

/// Polkit rule allowing the service user to manage units without an
/// interactive authorization prompt.
const POLKIT_RULES: &str = r#"polkit.addRule(function(action, subject) {
    if (
        subject.user == "berth" &&
        (action.id == "org.freedesktop.systemd1.manage-units" ||
        action.id == "org.freedesktop.systemd1.manage-unit-files" ||
        action.id == "org.freedesktop.systemd1.reload-daemon")
    ) {
        return polkit.Result.YES;
    }
})
"#;

pub async fn run() -> Result<()> {
    let options = context::load_options()?;
    let db = context::connect_db(&options).await?;

    tracing::info!("Creating catalogue schema.");
    berth_db::ensure_schema(&db)
        .await
        .context("unable to create catalogue tables")?;

    let gid = ensure_group(GROUP_NAME).await?;
    let uid = ensure_user(USER_NAME, &[GROUP_NAME, "docker"]).await?;

    let paths = Paths::default();
    for dir in [
        Path::new(DEFAULT_OPTIONS_PATH).parent().unwrap_or(Path::new("/etc/berth")),
        paths.tls_dir.as_path(),
        paths.unit_dir.as_path(),
    ] {
        ensure_directory(dir, gid)?;
    }

    std::fs::write(DBUS_POLICY_PATH, DBUS_POLICY)
        .context("unable to write D-Bus policy file")?;
    tracing::debug!(path = DBUS_POLICY_PATH, "D-Bus permissions written.");

    std::fs::write(POLKIT_RULES_PATH, POLKIT_RULES)
        .context("unable to write polkit rules file")?;
    tracing::debug!(path = POLKIT_RULES_PATH, "Polkit permissions written.");

    install_options_file(gid)?;

    let ring = context::build_ring(&options).await?;
    let factory = context::build_factory(&options, db, ring)?;
    let mut session = factory.session();

    tracing::info!("Ensuring the container network exists.");
    docker::ensure_network(session.docker())
        .await
        .context("unable to ensure the container network")?;

    tracing::info!("Performing initial synchronization.");
    let settings = ApplySettings {
        uid: Some(uid),
        gid: Some(gid),
    };
    let (delta, errs) = session.synchronize(&settings).await;
    for err in &errs {
        tracing::warn!(error = %err, "Error encountered during synchronization.");
    }
    if !errs.is_empty() {
        bail!("unable to perform the initial synchronization");
    }
    if let Some(delta) = delta {
        tracing::debug!(delta = %delta, "Synchronization complete.");
    }

    tracing::info!("Initialization complete.");
    Ok(())
}

/// Look up a group id with getent; `None` when the group does not exist.
async fn get_group_id(name: &str) -> Result<Option<u32>> {
    let output = Command::new("getent")
        .args(["group", name])
        .output()
        .await
        .context("unable to query for existing group")?;
    if output.stdout.is_empty() {
        return Ok(None);
    }

    let entry = String::from_utf8_lossy(&output.stdout);
    let gid = entry
        .split(':')
        .nth(2)
        .and_then(|field| field.trim().parse().ok());
    match gid {
        Some(gid) => Ok(Some(gid)),
        None => bail!("unable to interpret getent output: {entry}"),
    }
}

async fn ensure_group(name: &str) -> Result<u32> {
    if let Some(gid) = get_group_id(name).await? {
        tracing::debug!(group = name, gid, "Group already exists.");
        return Ok(gid);
    }

    tracing::info!(group = name, "Creating group.");
    let status = Command::new("groupadd")
        .args(["--system", name])
        .status()
        .await
        .context("unable to execute groupadd")?;
    if !status.success() {
        bail!("groupadd {name} exited {}", status.code().unwrap_or(-1));
    }

    match get_group_id(name).await? {
        Some(gid) => Ok(gid),
        None => bail!("group {name} missing after creation"),
    }
}

/// Look up a user id; `None` when the user does not exist.
async fn get_user_id(name: &str) -> Result<Option<u32>> {
    let output = Command::new("id")
        .args(["-u", name])
        .output()
        .await
        .context("unable to query for existing user")?;
    let trimmed = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(trimmed.parse().ok())
}

async fn ensure_user(name: &str, groups: &[&str]) -> Result<u32> {
    if let Some(uid) = get_user_id(name).await? {
        tracing::debug!(user = name, uid, "User already exists.");
        return Ok(uid);
    }

    tracing::info!(user = name, "Creating user.");
    let status = Command::new("useradd")
        .args([
            "--system",
            "--no-create-home",
            "--shell",
            "/usr/sbin/nologin",
            "--groups",
            &groups.join(","),
            name,
        ])
        .status()
        .await
        .context("unable to execute useradd")?;
    if !status.success() {
        bail!("useradd {name} exited {}", status.code().unwrap_or(-1));
    }

    match get_user_id(name).await? {
        Some(uid) => Ok(uid),
        None => bail!("user {name} missing after creation"),
    }
}

fn ensure_directory(dir: &Path, gid: u32) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("unable to create directory {}", dir.display()))?;
    chown(dir, None, Some(gid))
        .with_context(|| format!("unable to change group of {}", dir.display()))?;
    tracing::debug!(dir = %dir.display(), gid, "Directory ensured.");
    Ok(())
}

/// Move the options file to its default location when it was loaded from
/// somewhere else, then fix its ownership and mode.
fn install_options_file(gid: u32) -> Result<()> {
    let current = std::env::var(OPTIONS_ENV_VAR).unwrap_or_else(|_| DEFAULT_OPTIONS_PATH.into());
    if current != DEFAULT_OPTIONS_PATH {
        std::fs::rename(&current, DEFAULT_OPTIONS_PATH).with_context(|| {
            format!("unable to move options file {current} to {DEFAULT_OPTIONS_PATH}")
        })?;
        tracing::info!(from = %current, to = DEFAULT_OPTIONS_PATH, "Options file installed.");
    } else {
        tracing::debug!(path = %current, "Options file already in place.");
    }

    chown(DEFAULT_OPTIONS_PATH, None, Some(gid))
        .context("unable to change options file ownership")?;
    let mut permissions = std::fs::metadata(DEFAULT_OPTIONS_PATH)
        .context("unable to stat options file")?
        .permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut permissions, 0o640);
    std::fs::set_permissions(DEFAULT_OPTIONS_PATH, permissions)
        .context("unable to change options file permissions")?;
    Ok(())
}
