//! The shared secret pair established by pairing.

use serde::{Deserialize, Serialize};

use crate::crypto::hex_to_bytes;
use crate::error::{ProtocolError, Result};

/// Encryption and signing keys shared with one terminal.
///
/// Both keys are SHA-256 outputs carried as 64 character hex strings. The
/// decoded bytes are kept alongside so stamping a message does not re-decode
/// them. A `Secrets` value is never mutated: pairing, key rolling and
/// unpairing all replace it wholesale.
///
/// Serializes as `{"enc_key": "...", "hmac_key": "..."}` so callers can
/// persist it when the engine reports a change.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredSecrets", into = "StoredSecrets")]
pub struct Secrets {
    enc_key: String,
    hmac_key: String,
    enc_key_bytes: Vec<u8>,
    hmac_key_bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredSecrets {
    enc_key: String,
    hmac_key: String,
}

impl Secrets {
    /// Builds a secret pair from hex keys, rejecting malformed hex.
    pub fn new(enc_key: impl Into<String>, hmac_key: impl Into<String>) -> Result<Self> {
        let enc_key = enc_key.into().to_uppercase();
        let hmac_key = hmac_key.into().to_uppercase();

        let enc_key_bytes = hex_to_bytes(&enc_key)?;
        let hmac_key_bytes = hex_to_bytes(&hmac_key)?;
        if enc_key_bytes.is_empty() || hmac_key_bytes.is_empty() {
            return Err(ProtocolError::Encoding("secret keys must not be empty".to_string()));
        }

        Ok(Self {
            enc_key,
            hmac_key,
            enc_key_bytes,
            hmac_key_bytes,
        })
    }

    /// The encryption key as uppercase hex.
    pub fn enc_key(&self) -> &str {
        &self.enc_key
    }

    /// The signing key as uppercase hex.
    pub fn hmac_key(&self) -> &str {
        &self.hmac_key
    }

    pub fn enc_key_bytes(&self) -> &[u8] {
        &self.enc_key_bytes
    }

    pub fn hmac_key_bytes(&self) -> &[u8] {
        &self.hmac_key_bytes
    }
}

impl TryFrom<StoredSecrets> for Secrets {
    type Error = ProtocolError;

    fn try_from(stored: StoredSecrets) -> Result<Self> {
        Secrets::new(stored.enc_key, stored.hmac_key)
    }
}

impl From<Secrets> for StoredSecrets {
    fn from(secrets: Secrets) -> Self {
        Self {
            enc_key: secrets.enc_key,
            hmac_key: secrets.hmac_key,
        }
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("enc_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}
