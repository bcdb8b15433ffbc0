//! Secrets subsystem: the in-memory bag and the envelope-encryption ring.

mod bag;
mod ring;

pub use bag::SecretBag;
pub use ring::{DataKey, DecoderRing, KeyService, KmsKeyService, DATA_KEY_LEN, NONCE_LEN, TAG_LEN, WRAPPED_KEY_LEN};
