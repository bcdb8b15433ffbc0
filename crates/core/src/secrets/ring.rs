//! Envelope encryption over a cloud KMS master key.
//!
//! Each secret is sealed with its own 128-bit data key; the master key never
//! leaves the KMS. The wire format is `wrapped_key || nonce || gcm_ciphertext`
//! where the wrapped-key prefix has the fixed length of the KMS v1 envelope.

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Nonce};
use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;

use crate::error::{CryptoError, Error, Result};

/// Length of the KMS-wrapped data key prefix (KMS v1 envelope format).
pub const WRAPPED_KEY_LEN: usize = 168;

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Plaintext data key length (AES-128).
pub const DATA_KEY_LEN: usize = 16;

/// A freshly generated data key in both its plaintext and wrapped forms.
pub struct DataKey {
    pub plaintext: Vec<u8>,
    pub wrapped: Vec<u8>,
}

/// The seam between the envelope format and the key-management service.
///
/// Production uses [`KmsKeyService`]; tests substitute an in-memory
/// implementation so the envelope logic is exercised without AWS.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Mint a fresh data key under the master key.
    async fn generate_data_key(&self) -> Result<DataKey>;

    /// Recover the plaintext data key from its wrapped form.
    async fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<Vec<u8>>;
}

/// AWS KMS-backed key service.
pub struct KmsKeyService {
    client: aws_sdk_kms::Client,
    master_key_id: String,
}

impl KmsKeyService {
    /// Connect to KMS in the given region.
    pub async fn connect(master_key_id: &str, region: &str) -> KmsKeyService {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        KmsKeyService {
            client: aws_sdk_kms::Client::new(&config),
            master_key_id: master_key_id.to_string(),
        }
    }
}

#[async_trait]
impl KeyService for KmsKeyService {
    async fn generate_data_key(&self) -> Result<DataKey> {
        let output = self
            .client
            .generate_data_key()
            .key_id(&self.master_key_id)
            .key_spec(DataKeySpec::Aes128)
            .send()
            .await
            .map_err(|e| Error::Kms(e.to_string()))?;

        let plaintext = output
            .plaintext()
            .ok_or_else(|| Error::Kms("GenerateDataKey returned no plaintext".into()))?
            .as_ref()
            .to_vec();
        let wrapped = output
            .ciphertext_blob()
            .ok_or_else(|| Error::Kms("GenerateDataKey returned no ciphertext blob".into()))?
            .as_ref()
            .to_vec();
        Ok(DataKey { plaintext, wrapped })
    }

    async fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        let output = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(wrapped))
            .send()
            .await
            .map_err(|e| Error::Crypto(CryptoError::KmsDenied(e.to_string())))?;

        Ok(output
            .plaintext()
            .ok_or_else(|| Error::Kms("Decrypt returned no plaintext".into()))?
            .as_ref()
            .to_vec())
    }
}

/// Envelope encryption facade.
#[derive(Clone)]
pub struct DecoderRing {
    keys: Arc<dyn KeyService>,
}

impl DecoderRing {
    pub fn new(keys: Arc<dyn KeyService>) -> DecoderRing {
        DecoderRing { keys }
    }

    /// Seal `plaintext` under a fresh data key.
    ///
    /// Fails closed when the wrapped key does not match the fixed prefix
    /// length, since decryption splits the envelope at that offset.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let data_key = self.keys.generate_data_key().await?;
        if data_key.wrapped.len() != WRAPPED_KEY_LEN {
            return Err(CryptoError::EnvelopeMismatch {
                expected: WRAPPED_KEY_LEN,
                actual: data_key.wrapped.len(),
            }
            .into());
        }

        let cipher = Aes128Gcm::new_from_slice(&data_key.plaintext)
            .map_err(|_| Error::Kms("data key has the wrong length".into()))?;

        let nonce = Aes128Gcm::generate_nonce(OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Crypto(CryptoError::AuthTagMismatch))?;

        let mut envelope = data_key.wrapped;
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&sealed);
        Ok(envelope)
    }

    /// Open an envelope produced by [`DecoderRing::encrypt`].
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < WRAPPED_KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::ShortCiphertext(ciphertext.len()).into());
        }

        let (wrapped, rest) = ciphertext.split_at(WRAPPED_KEY_LEN);
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);

        let data_key = self.keys.unwrap_data_key(wrapped).await?;
        let cipher = Aes128Gcm::new_from_slice(&data_key)
            .map_err(|_| Error::Kms("data key has the wrong length".into()))?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| Error::Crypto(CryptoError::AuthTagMismatch))
    }

    /// Startup self-check: seal and open a probe value so a misconfigured
    /// master key or an envelope-format drift is caught before any secret is
    /// persisted.
    pub async fn verify_roundtrip(&self) -> Result<()> {
        let probe = b"berth-envelope-probe";
        let sealed = self.encrypt(probe).await?;
        let opened = self.decrypt(&sealed).await?;
        if opened != probe {
            return Err(CryptoError::EnvelopeMismatch {
                expected: WRAPPED_KEY_LEN,
                actual: sealed.len(),
            }
            .into());
        }
        Ok(())
    }
}
