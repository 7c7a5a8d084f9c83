//! Symmetric primitives used by the SPI message envelope.
//!
//! The terminal protocol fixes these choices:
//! - AES-CBC with PKCS7 padding and an all-zero IV, keyed with either a 16 or
//!   32 byte key. Ciphertext travels as uppercase hex.
//! - HMAC-SHA256 over the *hex text* of the ciphertext, also uppercase hex.
//!
//! The zero IV makes [`aes_encrypt`] deterministic. It exists only to speak the
//! terminal's wire format and must not be used to protect any other data.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size, which is also the IV length.
pub const AES_BLOCK_SIZE: usize = 16;

const ZERO_IV: [u8; AES_BLOCK_SIZE] = [0u8; AES_BLOCK_SIZE];

/// Encrypts `plaintext` and returns the ciphertext as uppercase hex.
pub fn aes_encrypt(key: &[u8], plaintext: &str) -> Result<String> {
    let data = plaintext.as_bytes();
    let ciphertext = match key.len() {
        16 => Aes128CbcEnc::new_from_slices(key, &ZERO_IV)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        32 => Aes256CbcEnc::new_from_slices(key, &ZERO_IV)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        n => {
            return Err(ProtocolError::Encryption(format!(
                "unsupported AES key length: {n} bytes"
            )))
        }
    };
    Ok(bytes_to_hex(&ciphertext))
}

/// Decrypts uppercase or lowercase hex ciphertext produced by [`aes_encrypt`].
pub fn aes_decrypt(key: &[u8], ciphertext_hex: &str) -> Result<String> {
    let ciphertext = hex::decode(ciphertext_hex)
        .map_err(|e| ProtocolError::Decryption(format!("ciphertext is not hex: {e}")))?;

    let plaintext = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, &ZERO_IV)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
        32 => Aes256CbcDec::new_from_slices(key, &ZERO_IV)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
        n => {
            return Err(ProtocolError::Decryption(format!(
                "unsupported AES key length: {n} bytes"
            )))
        }
    }
    .map_err(|_| ProtocolError::Decryption("invalid padding or block length".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|e| ProtocolError::Decryption(format!("plaintext is not utf-8: {e}")))
}

/// Computes HMAC-SHA256 of `message` and returns it as uppercase hex.
pub fn hmac_signature(key: &[u8], message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ProtocolError::Encryption(format!("hmac key rejected: {e}")))?;
    mac.update(message.as_bytes());
    Ok(bytes_to_hex(&mac.finalize().into_bytes()))
}

/// Checks a hex signature against `message`, ignoring hex letter case.
///
/// Malformed hex never verifies. Comparison is constant time.
pub fn verify_signature(key: &[u8], message: &str, signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// SHA-256 of raw bytes, as uppercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    bytes_to_hex(&Sha256::digest(data))
}

/// Encodes bytes as uppercase hex.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Decodes hex text (either case) into bytes.
pub fn hex_to_bytes(text: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(text)?)
}
