//! Secret rotation requested by the terminal.
//!
//! Each key is replaced by the SHA-256 of its raw bytes. The terminal applies
//! the same rule, so no key material crosses the wire.

use serde_json::json;

use crate::crypto::{hex_to_bytes, sha256_hex};
use crate::error::Result;
use crate::messages::{events, into_data, Message};
use crate::secrets::Secrets;

/// The rotated secrets and the confirmation to send back.
#[derive(Debug, Clone)]
pub struct KeyRollingResult {
    pub key_rolling_confirmation: Message,
    pub new_secrets: Secrets,
}

/// Derives the next secret pair and builds the `response_use_next_keys` reply.
pub fn perform_key_rolling(request: &Message, current: &Secrets) -> Result<KeyRollingResult> {
    let new_enc = sha256_hex(&hex_to_bytes(current.enc_key())?);
    let new_hmac = sha256_hex(&hex_to_bytes(current.hmac_key())?);

    let confirmation = Message::new(
        request.id.clone(),
        events::KEY_ROLL_RESPONSE,
        into_data(json!({"status": "confirmed"})),
        true,
    );

    Ok(KeyRollingResult {
        key_rolling_confirmation: confirmation,
        new_secrets: Secrets::new(new_enc, new_hmac)?,
    })
}
