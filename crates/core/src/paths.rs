//! Fixed host layout shared by the probe, the differ, and the applier.
//!
//! Production code uses [`Paths::default`], which points at the real unit
//! directory and TLS directory. Tests point the same code at a scratch
//! directory, so nothing in the engine hard-codes a location.

use std::path::{Component, Path, PathBuf};

/// Basename prefix of every unit file managed by this coordinator.
pub const UNIT_PREFIX: &str = "berth-";

/// Registry prefix that desired container images must match.
pub const IMAGE_PREFIX: &str = "quay.io/berth/";

/// Reserved secret key holding the TLS certificate chain.
pub const KEY_TLS_CERTIFICATE: &str = "TLS_CERTIFICATE";

/// Reserved secret key holding the TLS private key.
pub const KEY_TLS_KEY: &str = "TLS_KEY";

/// Reserved secret key holding pre-generated DH parameters.
pub const KEY_TLS_DH_PARAMS: &str = "TLS_DH_PARAMS";

/// Host filesystem layout. One instance is threaded through every component
/// that touches the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Directory that holds systemd unit files.
    pub unit_dir: PathBuf,
    /// Directory that holds TLS material written from the secret bag.
    pub tls_dir: PathBuf,
    /// Partition whose usage is reported by the health endpoint.
    pub docker_partition: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            unit_dir: PathBuf::from("/etc/systemd/system"),
            tls_dir: PathBuf::from("/etc/ssl/berth"),
            docker_partition: PathBuf::from("/var/lib/docker"),
        }
    }
}

impl Paths {
    /// Path to the full certificate chain.
    pub fn tls_certificate(&self) -> PathBuf {
        self.tls_dir.join("fullchain.pem")
    }

    /// Path to the TLS private key.
    pub fn tls_key(&self) -> PathBuf {
        self.tls_dir.join("privkey.pem")
    }

    /// Path to the DH parameters file.
    pub fn tls_dh_params(&self) -> PathBuf {
        self.tls_dir.join("dhparams.pem")
    }

    /// The three reserved secret keys and the file each one feeds.
    pub fn tls_files(&self) -> [(&'static str, PathBuf); 3] {
        [
            (KEY_TLS_CERTIFICATE, self.tls_certificate()),
            (KEY_TLS_KEY, self.tls_key()),
            (KEY_TLS_DH_PARAMS, self.tls_dh_params()),
        ]
    }

    /// True if `path` is one of the three TLS file locations.
    pub fn is_tls_file(&self, path: &str) -> bool {
        self.tls_files()
            .iter()
            .any(|(_, tls_path)| Path::new(path) == tls_path)
    }

    /// True if `path` names a managed unit file: directly under the unit
    /// directory, basename beginning with [`UNIT_PREFIX`].
    pub fn is_managed_unit_path(&self, path: &str) -> bool {
        let path = Path::new(path);
        let parent_ok = path.parent() == Some(self.unit_dir.as_path());
        let name_ok = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(UNIT_PREFIX));
        parent_ok && name_ok
    }

    /// True if `host_path` lies under the TLS directory.
    pub fn is_under_tls_dir(&self, host_path: &str) -> bool {
        Path::new(host_path).starts_with(&self.tls_dir)
    }
}

/// Lexically normalize a path: collapse `.`, `..`, and repeated separators
/// without touching the filesystem.
pub fn lexical_clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let absolute = path.starts_with('/');
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..");
                }
            }
            Component::Normal(p) => parts.push(p.to_str().unwrap_or_default()),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Extract the logical unit name from a unit file path.
pub fn unit_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}
