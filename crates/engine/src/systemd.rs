//! Init-system client.
//!
//! The applier talks to systemd through the [`InitSystem`] trait; production
//! uses [`SystemctlClient`], which drives `systemctl` and waits for each job
//! to finish (systemd's "replace" job mode). Tests substitute a recording
//! implementation.

use async_trait::async_trait;
use berth_core::{Error, Result};
use tokio::process::Command;

/// Allowed unit name characters: alphanumeric, hyphen, underscore, dot, at.
/// Prevents argument injection through a unit name.
pub fn is_safe_unit_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '@')
}

/// The operations the applier needs from the init system.
#[async_trait]
pub trait InitSystem: Send + Sync {
    /// Start a unit and wait for the job to complete.
    async fn start_unit(&self, name: &str) -> Result<()>;

    /// Stop a unit and wait for the job to complete.
    async fn stop_unit(&self, name: &str) -> Result<()>;

    /// Restart a unit and wait for the job to complete.
    async fn restart_unit(&self, name: &str) -> Result<()>;

    /// Send a signal to a unit's processes.
    async fn kill_unit(&self, name: &str, signal: i32) -> Result<()>;

    /// Enable unit files in one batch call.
    async fn enable_unit_files(&self, paths: &[String]) -> Result<()>;

    /// Disable unit files in one batch call.
    async fn disable_unit_files(&self, names: &[String]) -> Result<()>;

    /// Reload systemd's view of the unit files on disk.
    async fn daemon_reload(&self) -> Result<()>;
}

/// `systemctl`-backed production implementation.
#[derive(Debug, Default, Clone)]
pub struct SystemctlClient;

impl SystemctlClient {
    pub fn new() -> SystemctlClient {
        SystemctlClient
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        tracing::debug!(?args, "Invoking systemctl.");
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::InitSystem(format!("unable to execute systemctl: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::InitSystem(format!(
                "systemctl {} exited {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status.code().unwrap_or(-1),
                stderr.trim(),
            )))
        }
    }

    fn checked<'a>(&self, name: &'a str) -> Result<&'a str> {
        if is_safe_unit_name(name) {
            Ok(name)
        } else {
            Err(Error::InitSystem(format!("invalid unit name: {name}")))
        }
    }
}

#[async_trait]
impl InitSystem for SystemctlClient {
    async fn start_unit(&self, name: &str) -> Result<()> {
        let name = self.checked(name)?;
        self.run(&["start", "--job-mode=replace", name]).await
    }

    async fn stop_unit(&self, name: &str) -> Result<()> {
        let name = self.checked(name)?;
        self.run(&["stop", "--job-mode=replace", name]).await
    }

    async fn restart_unit(&self, name: &str) -> Result<()> {
        let name = self.checked(name)?;
        self.run(&["restart", "--job-mode=replace", name]).await
    }

    async fn kill_unit(&self, name: &str, signal: i32) -> Result<()> {
        let name = self.checked(name)?;
        let signal = signal.to_string();
        self.run(&["kill", "-s", &signal, name]).await
    }

    async fn enable_unit_files(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["enable"];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args).await
    }

    async fn disable_unit_files(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        for name in names {
            self.checked(name)?;
        }
        let mut args = vec!["disable"];
        args.extend(names.iter().map(String::as_str));
        self.run(&args).await
    }

    async fn daemon_reload(&self) -> Result<()> {
        self.run(&["daemon-reload"]).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every call for assertion; optionally fails chosen operations.
    #[derive(Debug, Default)]
    pub struct RecordingInit {
        pub calls: Mutex<Vec<String>>,
        pub fail_stop: bool,
        pub fail_reload: bool,
        pub fail_restart_of: Option<String>,
    }

    impl RecordingInit {
        pub fn new() -> RecordingInit {
            RecordingInit::default()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl InitSystem for RecordingInit {
        async fn start_unit(&self, name: &str) -> Result<()> {
            self.record(format!("start {name}"));
            Ok(())
        }

        async fn stop_unit(&self, name: &str) -> Result<()> {
            self.record(format!("stop {name}"));
            if self.fail_stop {
                return Err(Error::InitSystem(format!("stop {name} refused")));
            }
            Ok(())
        }

        async fn restart_unit(&self, name: &str) -> Result<()> {
            self.record(format!("restart {name}"));
            if self.fail_restart_of.as_deref() == Some(name) {
                return Err(Error::InitSystem(format!("restart {name} refused")));
            }
            Ok(())
        }

        async fn kill_unit(&self, name: &str, signal: i32) -> Result<()> {
            self.record(format!("kill {name} sig={signal}"));
            Ok(())
        }

        async fn enable_unit_files(&self, paths: &[String]) -> Result<()> {
            self.record(format!("enable {}", paths.join(",")));
            Ok(())
        }

        async fn disable_unit_files(&self, names: &[String]) -> Result<()> {
            self.record(format!("disable {}", names.join(",")));
            Ok(())
        }

        async fn daemon_reload(&self) -> Result<()> {
            self.record("daemon-reload".to_string());
            if self.fail_reload {
                return Err(Error::InitSystem("daemon-reload refused".into()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_unit_names() {
        assert!(is_safe_unit_name("berth-web.service"));
        assert!(is_safe_unit_name("berth-nightly.timer"));
        assert!(is_safe_unit_name("getty@tty1.service"));
    }

    #[test]
    fn unsafe_unit_names() {
        assert!(!is_safe_unit_name(""));
        assert!(!is_safe_unit_name("web; rm -rf /"));
        assert!(!is_safe_unit_name("web service"));
        assert!(!is_safe_unit_name("--job-mode=fail"));
        assert!(!is_safe_unit_name(&"a".repeat(200)));
    }
}
