//! Coordinator configuration, loaded at startup from a strict JSON file.

use std::path::Path;

use berth_core::{Error, Result};
use serde::Deserialize;

/// Environment variable naming an alternate options file.
pub const OPTIONS_ENV_VAR: &str = "BERTH_OPTIONS";

/// Options file location when [`OPTIONS_ENV_VAR`] is unset.
pub const DEFAULT_OPTIONS_PATH: &str = "/etc/berth/options.json";

/// Coordinator-wide configuration options.
///
/// Unknown fields are rejected so a typo in the options file fails loudly
/// at startup instead of silently disabling a feature.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    /// `host:port` the HTTPS management API binds.
    pub listen_address: String,
    /// Postgres connection URL for the catalogue.
    pub database_url: String,
    /// Shared secret presented as the basic-auth password on every API
    /// request.
    pub auth_token: String,
    /// KMS master key id for the decoder ring.
    pub master_key_id: String,
    /// AWS region hosting the master key and the log group.
    pub aws_region: String,
    /// Docker Engine API version to pin; negotiated when absent.
    #[serde(default)]
    pub docker_api_version: Option<String>,
    /// The single origin allowed by CORS.
    pub allowed_origin: String,
    /// Chat webhook receiving reconciliation outcomes; disabled when unset.
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    /// CloudWatch log group receiving a copy of the logs; disabled when
    /// unset.
    #[serde(default)]
    pub cloudwatch_group: Option<String>,
}

impl Options {
    /// Load options from `$BERTH_OPTIONS`, else the default path.
    pub fn load() -> Result<Options> {
        let path =
            std::env::var(OPTIONS_ENV_VAR).unwrap_or_else(|_| DEFAULT_OPTIONS_PATH.to_string());
        tracing::info!(path, "Loading configuration options from file.");
        Self::load_from(Path::new(&path))
    }

    /// Load and validate options from one file.
    pub fn load_from(path: &Path) -> Result<Options> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("unable to read {}: {e}", path.display())))?;
        let options: Options = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("malformed options in {}: {e}", path.display())))?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("listen_address", &self.listen_address),
            ("database_url", &self.database_url),
            ("auth_token", &self.auth_token),
            ("master_key_id", &self.master_key_id),
            ("aws_region", &self.aws_region),
            ("allowed_origin", &self.allowed_origin),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }
}
