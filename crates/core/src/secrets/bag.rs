//! In-memory set of decrypted secrets.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// Unordered mapping of secret keys to UTF-8 plaintext values.
///
/// The bag is the authority on key uniqueness; the `secrets` table itself
/// enforces none. Persistence lives in `berth-db` so the bag stays a plain
/// value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretBag {
    secrets: BTreeMap<String, String>,
}

impl SecretBag {
    pub fn new() -> SecretBag {
        SecretBag::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Insert or overwrite a secret.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(key.into(), value.into());
    }

    /// Remove a secret. Returns true when the key was present.
    pub fn delete(&mut self, key: &str) -> bool {
        self.secrets.remove(key).is_some()
    }

    /// Look up a secret, falling back to `default` when absent.
    pub fn get(&self, key: &str, default: &str) -> String {
        self.secrets
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Look up a secret that must be present.
    pub fn get_required(&self, key: &str) -> Result<&str> {
        self.secrets
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::MissingSecret(key.to_string()))
    }

    pub fn has(&self, key: &str) -> bool {
        self.secrets.contains_key(key)
    }

    /// Known keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.secrets.keys().cloned().collect()
    }

    /// Iterate `(key, value)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.secrets.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Map the three reserved TLS keys to the file contents expected at
    /// their fixed paths. Fails when any reserved key is absent.
    pub fn desired_tls_files(&self, paths: &Paths) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut desired = BTreeMap::new();
        for (key, path) in paths.tls_files() {
            let value = self.get_required(key)?;
            desired.insert(path.to_string_lossy().into_owned(), value.as_bytes().to_vec());
        }
        Ok(desired)
    }
}
