//! Messages of the pairing handshake.
//!
//! ```text
//! POS                                   Terminal
//!  │ ── pair_request ───────────────────▶ │
//!  │ ◀────────────── key_request {A, A} ─ │
//!  │ ── key_response {B, B} ────────────▶ │   both sides now hold Secrets
//!  │ ◀─────────────────────── key_check ─ │   encrypted; HMAC gives the code
//!  │ ◀──────────── pair_response {ok?} ── │
//! ```
//!
//! The user confirms the code on both devices; see the client's pairing flow
//! for how the two confirmations converge.

use serde_json::{json, Value};

use crate::diffie_hellman::calculate_public_key_and_secret;
use crate::error::{ProtocolError, Result};
use crate::messages::{events, into_data, next_request_id, Message};
use crate::secrets::Secrets;

/// Number of HMAC hex characters shown to the user as the confirmation code.
pub const CONFIRMATION_CODE_LENGTH: usize = 6;

/// Step 1: asks the terminal to start pairing.
#[derive(Debug, Clone, Default)]
pub struct PairRequest;

impl PairRequest {
    pub fn to_message(&self) -> Message {
        Message::new(
            next_request_id("pr"),
            events::PAIR_REQUEST,
            into_data(json!({"padding": true})),
            false,
        )
    }
}

/// Step 2: the terminal's two public values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub request_id: String,
    pub a_enc: String,
    pub a_hmac: String,
}

impl KeyRequest {
    pub fn from_message(message: &Message) -> Result<Self> {
        let public_value = |key: &str| -> Result<String> {
            message
                .data_value(key)
                .and_then(|v| v.get("A"))
                .and_then(Value::as_str)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::MissingField {
                    event: message.event_name.clone(),
                    field: format!("{key}.A"),
                })
        };

        Ok(Self {
            request_id: message.id.clone(),
            a_enc: public_value("enc")?,
            a_hmac: public_value("hmac")?,
        })
    }
}

/// Step 3: our two public values, answered under the request's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResponse {
    pub request_id: String,
    pub b_enc: String,
    pub b_hmac: String,
}

impl KeyResponse {
    pub fn to_message(&self) -> Message {
        Message::new(
            self.request_id.clone(),
            events::KEY_RESPONSE,
            into_data(json!({
                "enc": {"B": self.b_enc},
                "hmac": {"B": self.b_hmac},
            })),
            false,
        )
    }
}

/// Step 4: the terminal proves it derived the same keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCheck {
    pub confirmation_code: String,
}

impl KeyCheck {
    /// Takes the confirmation code from the message's verified HMAC.
    pub fn from_message(message: &Message) -> Self {
        let confirmation_code = message
            .incoming_hmac()
            .map(|hmac| hmac.chars().take(CONFIRMATION_CODE_LENGTH).collect())
            .unwrap_or_default();
        Self { confirmation_code }
    }
}

/// Step 5: whether the user accepted the code on the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairResponse {
    pub success: bool,
}

impl PairResponse {
    pub fn from_message(message: &Message) -> Self {
        Self {
            success: message.data_bool("success", false),
        }
    }
}

/// Tells the terminal to forget our keys.
#[derive(Debug, Clone, Default)]
pub struct DropKeysRequest;

impl DropKeysRequest {
    pub fn to_message(&self) -> Message {
        Message::new(next_request_id("drpkys"), events::DROP_KEYS_ADVICE, None, true)
    }
}

/// Freshly negotiated secrets plus the reply that completes step 3.
#[derive(Debug, Clone)]
pub struct SecretsAndKeyResponse {
    pub secrets: Secrets,
    pub key_response: KeyResponse,
}

/// Runs both Diffie-Hellman exchanges for a key request.
pub fn generate_secrets_and_key_response(request: &KeyRequest) -> Result<SecretsAndKeyResponse> {
    let enc = calculate_public_key_and_secret(&request.a_enc)?;
    let hmac = calculate_public_key_and_secret(&request.a_hmac)?;

    Ok(SecretsAndKeyResponse {
        secrets: Secrets::new(enc.shared_secret, hmac.shared_secret)?,
        key_response: KeyResponse {
            request_id: request.request_id.clone(),
            b_enc: enc.my_public_key,
            b_hmac: hmac.my_public_key,
        },
    })
}
