use std::path::PathBuf;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-level error taxonomy.
///
/// Each variant corresponds to one failure domain crossed by a
/// reconciliation: configuration, the KMS envelope, local crypto, the
/// catalogue database, builder validation, the secret bag, the container
/// runtime, the init system, the filesystem, and unit rendering.
/// `Transient` summarizes a partially-failed batch whose individual errors
/// were already reported.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("KMS request failed: {0}")]
    Kms(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Db(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing required secret [{0}]")]
    MissingSecret(String),

    #[error("Container runtime error: {0}")]
    ContainerRuntime(String),

    #[error("Init system error: {0}")]
    InitSystem(String),

    #[error("I/O error at {path}: {source}")]
    Fs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to render unit {unit}: {reason}")]
    Render { unit: String, reason: String },

    #[error("{failed} of {attempted} operations failed")]
    Transient { attempted: usize, failed: usize },
}

impl Error {
    /// Wrap a database error. The catalogue layer reports `sqlx::Error`
    /// directly; callers that cross into the engine convert here.
    pub fn db(err: impl std::fmt::Display) -> Self {
        Error::Db(err.to_string())
    }

    pub fn container(err: impl std::fmt::Display) -> Self {
        Error::ContainerRuntime(err.to_string())
    }

    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Fs {
            path: path.into(),
            source,
        }
    }

    pub fn render(unit: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Render {
            unit: unit.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failures of the envelope-encryption layer.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The byte slice cannot accommodate wrapped key + nonce + tag.
    #[error("Ciphertext too short: {0} bytes")]
    ShortCiphertext(usize),

    /// The KMS refused to unwrap the data key.
    #[error("KMS denied the unwrap request: {0}")]
    KmsDenied(String),

    /// AES-GCM authentication failed; the payload was tampered with or the
    /// wrong data key was recovered.
    #[error("Authentication tag mismatch")]
    AuthTagMismatch,

    /// The wrapped data key did not match the fixed envelope prefix length.
    #[error("Wrapped data key is {actual} bytes, expected {expected}")]
    EnvelopeMismatch { expected: usize, actual: usize },
}
