//! SPI message envelope.
//!
//! Every frame on the wire is a JSON object in one of two shapes:
//!
//! ```text
//! {"message": {"id", "event", "data", "datetime", "pos_id"}}   plaintext
//! {"enc": HEX, "hmac": HEX, "pos_id": "..."}                   encrypted
//! ```
//!
//! The encrypted form carries the plaintext form, AES encrypted with the
//! session's encryption key and signed (over the ciphertext hex) with its
//! HMAC key. [`Message::to_json`] produces either form from a
//! [`MessageStamp`]; [`Message::from_json`] reverses it and reports integrity
//! failures as [`ParseOutcome`] variants rather than errors.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Local, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::{aes_decrypt, aes_encrypt, hmac_signature, verify_signature};
use crate::error::{ProtocolError, Result};
use crate::secrets::Secrets;

/// Format of the `datetime` field.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// JSON object carried in a message's `data` field.
pub type MessageData = Map<String, Value>;

// ============================================================================
// Event names
// ============================================================================

/// Event names, which act as the protocol's method names.
pub mod events {
    pub const PAIR_REQUEST: &str = "pair_request";
    pub const KEY_REQUEST: &str = "key_request";
    pub const KEY_RESPONSE: &str = "key_response";
    pub const KEY_CHECK: &str = "key_check";
    pub const PAIR_RESPONSE: &str = "pair_response";
    pub const DROP_KEYS_ADVICE: &str = "drop_keys";

    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";

    pub const PURCHASE_REQUEST: &str = "purchase";
    pub const PURCHASE_RESPONSE: &str = "purchase_response";
    pub const CANCEL_TRANSACTION_REQUEST: &str = "cancel_transaction";
    pub const GET_LAST_TRANSACTION_REQUEST: &str = "get_last_transaction";
    pub const GET_LAST_TRANSACTION_RESPONSE: &str = "last_transaction";
    pub const REFUND_REQUEST: &str = "refund";
    pub const REFUND_RESPONSE: &str = "refund_response";
    pub const SIGNATURE_REQUIRED: &str = "signature_required";
    pub const SIGNATURE_DECLINED: &str = "signature_decline";
    pub const SIGNATURE_ACCEPTED: &str = "signature_accept";
    pub const AUTH_CODE_REQUIRED: &str = "authorisation_code_required";
    pub const AUTH_CODE_ADVICE: &str = "authorisation_code_advice";

    pub const CASHOUT_ONLY_REQUEST: &str = "cash";
    pub const CASHOUT_ONLY_RESPONSE: &str = "cash_response";

    pub const MOTO_PURCHASE_REQUEST: &str = "moto_purchase";
    pub const MOTO_PURCHASE_RESPONSE: &str = "moto_purchase_response";

    pub const SETTLE_REQUEST: &str = "settle";
    pub const SETTLE_RESPONSE: &str = "settle_response";
    pub const SETTLEMENT_ENQUIRY_REQUEST: &str = "settlement_enquiry";
    pub const SETTLEMENT_ENQUIRY_RESPONSE: &str = "settlement_enquiry_response";

    pub const KEY_ROLL_REQUEST: &str = "request_use_next_keys";
    pub const KEY_ROLL_RESPONSE: &str = "response_use_next_keys";

    pub const ERROR: &str = "error";
    pub const INVALID_HMAC_SIGNATURE: &str = "_INVALID_SIGNATURE_";

    pub const PAY_AT_TABLE_GET_TABLE_CONFIG: &str = "get_table_config";
    pub const PAY_AT_TABLE_SET_TABLE_CONFIG: &str = "set_table_config";
    pub const PAY_AT_TABLE_GET_BILL_DETAILS: &str = "get_bill_details";
    pub const PAY_AT_TABLE_BILL_DETAILS: &str = "bill_details";
    pub const PAY_AT_TABLE_BILL_PAYMENT: &str = "bill_payment";

    pub const ACCOUNT_VERIFY_REQUEST: &str = "account_verify";
    pub const ACCOUNT_VERIFY_RESPONSE: &str = "account_verify_response";
    pub const PREAUTH_OPEN_REQUEST: &str = "preauth";
    pub const PREAUTH_OPEN_RESPONSE: &str = "preauth_response";
    pub const PREAUTH_TOPUP_REQUEST: &str = "preauth_topup";
    pub const PREAUTH_TOPUP_RESPONSE: &str = "preauth_topup_response";
    pub const PREAUTH_EXTEND_REQUEST: &str = "preauth_extend";
    pub const PREAUTH_EXTEND_RESPONSE: &str = "preauth_extend_response";
    pub const PREAUTH_PARTIAL_CANCELLATION_REQUEST: &str = "preauth_partial_cancellation";
    pub const PREAUTH_PARTIAL_CANCELLATION_RESPONSE: &str =
        "preauth_partial_cancellation_response";
    pub const PREAUTH_CANCELLATION_REQUEST: &str = "preauth_cancellation";
    pub const PREAUTH_CANCELLATION_RESPONSE: &str = "preauth_cancellation_response";
    pub const PREAUTH_COMPLETE_REQUEST: &str = "completion";
    pub const PREAUTH_COMPLETE_RESPONSE: &str = "completion_response";
}

/// Classification of a received message by its event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    KeyRequest,
    KeyCheck,
    PairResponse,
    DropKeysAdvice,
    PurchaseResponse,
    RefundResponse,
    CashoutOnlyResponse,
    MotoPurchaseResponse,
    SignatureRequired,
    AuthCodeRequired,
    GetLastTransactionResponse,
    SettleResponse,
    SettlementEnquiryResponse,
    Ping,
    Pong,
    KeyRollRequest,
    GetTableConfig,
    GetBillDetails,
    BillPayment,
    Error,
    AccountVerifyResponse,
    /// Any of the preauth family responses (open, topup, extend, cancel...).
    PreauthResponse,
    /// An event this client does not handle.
    Unknown(String),
}

impl InboundEvent {
    /// Maps an event name onto its kind. Never fails.
    pub fn classify(event_name: &str) -> Self {
        use events::*;
        match event_name {
            KEY_REQUEST => Self::KeyRequest,
            KEY_CHECK => Self::KeyCheck,
            PAIR_RESPONSE => Self::PairResponse,
            DROP_KEYS_ADVICE => Self::DropKeysAdvice,
            PURCHASE_RESPONSE => Self::PurchaseResponse,
            REFUND_RESPONSE => Self::RefundResponse,
            CASHOUT_ONLY_RESPONSE => Self::CashoutOnlyResponse,
            MOTO_PURCHASE_RESPONSE => Self::MotoPurchaseResponse,
            SIGNATURE_REQUIRED => Self::SignatureRequired,
            AUTH_CODE_REQUIRED => Self::AuthCodeRequired,
            GET_LAST_TRANSACTION_RESPONSE => Self::GetLastTransactionResponse,
            SETTLE_RESPONSE => Self::SettleResponse,
            SETTLEMENT_ENQUIRY_RESPONSE => Self::SettlementEnquiryResponse,
            PING => Self::Ping,
            PONG => Self::Pong,
            KEY_ROLL_REQUEST => Self::KeyRollRequest,
            PAY_AT_TABLE_GET_TABLE_CONFIG => Self::GetTableConfig,
            PAY_AT_TABLE_GET_BILL_DETAILS => Self::GetBillDetails,
            PAY_AT_TABLE_BILL_PAYMENT => Self::BillPayment,
            ERROR => Self::Error,
            ACCOUNT_VERIFY_RESPONSE => Self::AccountVerifyResponse,
            PREAUTH_OPEN_RESPONSE
            | PREAUTH_TOPUP_RESPONSE
            | PREAUTH_PARTIAL_CANCELLATION_RESPONSE
            | PREAUTH_EXTEND_RESPONSE
            | PREAUTH_COMPLETE_RESPONSE
            | PREAUTH_CANCELLATION_RESPONSE => Self::PreauthResponse,
            other => Self::Unknown(other.to_string()),
        }
    }
}

// ============================================================================
// Request ids
// ============================================================================

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique request id such as `prchs12`.
pub fn next_request_id(prefix: &str) -> String {
    let n = REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{n}")
}

// ============================================================================
// Message
// ============================================================================

/// Outcome reported by the terminal in a response's `success` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SuccessState {
    #[default]
    Unknown,
    Success,
    Failed,
}

/// Context used to stamp outgoing messages.
///
/// `secrets == None` forces plaintext even for messages that would normally
/// be encrypted.
#[derive(Debug, Clone)]
pub struct MessageStamp {
    pub pos_id: String,
    pub secrets: Option<Secrets>,
    /// Offset of the terminal's clock from ours, applied to `datetime`.
    pub server_time_delta: TimeDelta,
}

impl MessageStamp {
    pub fn new(pos_id: impl Into<String>, secrets: Option<Secrets>) -> Self {
        Self {
            pos_id: pos_id.into(),
            secrets,
            server_time_delta: TimeDelta::zero(),
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlates a request with its response.
    #[serde(default)]
    pub id: String,

    /// The event name, see [`events`].
    #[serde(rename = "event", default)]
    pub event_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<MessageData>,

    /// Local time plus server delta, set while stamping.
    #[serde(rename = "datetime", default, skip_serializing_if = "String::is_empty")]
    pub date_time_stamp: String,

    /// Only present on plaintext messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_id: Option<String>,

    #[serde(skip)]
    needs_encryption: bool,

    #[serde(skip)]
    incoming_hmac: Option<String>,

    #[serde(skip)]
    decrypted_json: Option<String>,
}

/// Wire shape covering both envelope forms.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MessageEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pos_id: Option<String>,
}

/// Result of parsing a received frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A message that was either plaintext or verified and decrypted.
    Parsed(Message),
    /// An encrypted frame arrived while no secrets were held.
    NoSecrets,
    /// The HMAC did not match the ciphertext.
    InvalidSignature,
    /// The frame, or its decrypted payload, was not a valid envelope.
    Unparseable(String),
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        event_name: impl Into<String>,
        data: Option<MessageData>,
        needs_encryption: bool,
    ) -> Self {
        Self {
            id: id.into(),
            event_name: event_name.into(),
            data,
            date_time_stamp: String::new(),
            pos_id: None,
            needs_encryption,
            incoming_hmac: None,
            decrypted_json: None,
        }
    }

    pub fn needs_encryption(&self) -> bool {
        self.needs_encryption
    }

    /// The verified HMAC this message arrived with, if it was encrypted.
    pub fn incoming_hmac(&self) -> Option<&str> {
        self.incoming_hmac.as_deref()
    }

    /// The plaintext JSON this message was parsed from.
    pub fn decrypted_json(&self) -> Option<&str> {
        self.decrypted_json.as_deref()
    }

    // ------------------------------------------------------------------------
    // Data accessors. Missing or mistyped keys yield defaults.
    // ------------------------------------------------------------------------

    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    pub fn data_string(&self, key: &str) -> String {
        match self.data_value(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    pub fn data_int(&self, key: &str) -> i64 {
        match self.data_value(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
            Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
            _ => 0,
        }
    }

    pub fn data_bool(&self, key: &str, default: bool) -> bool {
        match self.data_value(key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    /// Maps `data.success` onto a [`SuccessState`].
    pub fn success_state(&self) -> SuccessState {
        match self.data_value("success") {
            Some(Value::Bool(true)) => SuccessState::Success,
            Some(Value::Bool(false)) => SuccessState::Failed,
            _ => SuccessState::Unknown,
        }
    }

    pub fn error_reason(&self) -> String {
        self.data_string("error_reason")
    }

    pub fn error_detail(&self) -> String {
        self.data_string("error_detail")
    }

    /// How far the terminal's clock (from `datetime`) is ahead of ours.
    pub fn server_time_delta(&self) -> TimeDelta {
        NaiveDateTime::parse_from_str(&self.date_time_stamp, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|server| server - Local::now().naive_local())
            .unwrap_or_else(|_| TimeDelta::zero())
    }

    // ------------------------------------------------------------------------
    // Envelope codec
    // ------------------------------------------------------------------------

    /// Stamps and serializes this message for the wire.
    pub fn to_json(&self, stamp: &MessageStamp) -> Result<String> {
        let mut stamped = self.clone();
        stamped.date_time_stamp = (Local::now().naive_local() + stamp.server_time_delta)
            .format(DATE_TIME_FORMAT)
            .to_string();

        let secrets = match (&stamp.secrets, self.needs_encryption) {
            (Some(secrets), true) => secrets,
            _ => {
                stamped.pos_id = Some(stamp.pos_id.clone());
                let envelope = MessageEnvelope {
                    message: Some(stamped),
                    ..Default::default()
                };
                return Ok(serde_json::to_string(&envelope)?);
            }
        };

        let inner = serde_json::to_string(&MessageEnvelope {
            message: Some(stamped),
            ..Default::default()
        })?;
        let enc = aes_encrypt(secrets.enc_key_bytes(), &inner)?;
        let hmac = hmac_signature(secrets.hmac_key_bytes(), &enc)?;

        let envelope = MessageEnvelope {
            message: None,
            enc: Some(enc),
            hmac: Some(hmac),
            pos_id: Some(stamp.pos_id.clone()),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parses a received frame, verifying and decrypting it when encrypted.
    pub fn from_json(json: &str, secrets: Option<&Secrets>) -> ParseOutcome {
        let envelope: MessageEnvelope = match serde_json::from_str(json) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "received frame is not a message envelope");
                return ParseOutcome::Unparseable(json.to_string());
            }
        };

        if let Some(mut message) = envelope.message {
            message.decrypted_json = Some(json.to_string());
            return ParseOutcome::Parsed(message);
        }

        let Some(secrets) = secrets else {
            return ParseOutcome::NoSecrets;
        };

        let (Some(enc), Some(hmac)) = (envelope.enc, envelope.hmac) else {
            return ParseOutcome::Unparseable(json.to_string());
        };

        if !verify_signature(secrets.hmac_key_bytes(), &enc, &hmac) {
            return ParseOutcome::InvalidSignature;
        }

        let decrypted = match aes_decrypt(secrets.enc_key_bytes(), &enc) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(error = %e, "signed frame failed to decrypt");
                return ParseOutcome::Unparseable(enc);
            }
        };

        match serde_json::from_str::<MessageEnvelope>(&decrypted) {
            Ok(MessageEnvelope {
                message: Some(mut message),
                ..
            }) => {
                message.incoming_hmac = Some(hmac);
                message.decrypted_json = Some(decrypted);
                ParseOutcome::Parsed(message)
            }
            _ => ParseOutcome::Unparseable(decrypted),
        }
    }
}

/// Wraps a `json!` object literal as message data.
pub fn into_data(value: Value) -> Option<MessageData> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Fails with [`ProtocolError::MissingField`] unless `key` holds a non-empty string.
pub fn require_string(message: &Message, key: &str) -> Result<String> {
    let value = message.data_string(key);
    if value.is_empty() {
        return Err(ProtocolError::MissingField {
            event: message.event_name.clone(),
            field: key.to_string(),
        });
    }
    Ok(value)
}

/// Formats cents as `$X.XX` for display messages.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}${}.{:02}", abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ENC_KEY: &str = "11A1162B984FEF626ECC27C659A8B0EEAD5248CA867A6A87BEA72F8A8706109D";
    const HMAC_KEY: &str = "40510175845988F13F6162ED8526F0B09F73384467FA855E1E79B44A56562A58";
    const PONG_FRAME: &str = r#"{"enc": "819A6FF34A7656DBE5274AC44A28A48DD6D723FCEF12570E4488410B83A1504084D79BA9DF05C3CE58B330C6626EA5E9EB6BAAB3BFE95345A8E9834F183A1AB2F6158E8CDC217B4970E6331B4BE0FCAA","hmac": "21FB2315E2FB5A22857F21E48D3EEC0969AD24C0E8A99C56A37B66B9E503E1EF"}"#;

    fn secrets() -> Secrets {
        Secrets::new(ENC_KEY, HMAC_KEY).unwrap()
    }

    fn parsed(outcome: ParseOutcome) -> Message {
        match outcome {
            ParseOutcome::Parsed(message) => message,
            other => panic!("expected a parsed message, got {other:?}"),
        }
    }

    #[test]
    fn test_incoming_plaintext_message() {
        let json = r#"{"message": {"event": "event_x","id": "62","data": {"param1": "value1"}}}"#;
        let message = parsed(Message::from_json(json, None));

        assert_eq!(message.event_name, "event_x");
        assert_eq!(message.id, "62");
        assert_eq!(message.data_string("param1"), "value1");
        assert!(message.incoming_hmac().is_none());
    }

    #[test]
    fn test_incoming_plaintext_ignores_secrets() {
        let json = r#"{"message": {"event": "key_request","id": "1"}}"#;
        let message = parsed(Message::from_json(json, Some(&secrets())));
        assert_eq!(message.event_name, "key_request");
    }

    #[test]
    fn test_incoming_encrypted_message() {
        let message = parsed(Message::from_json(PONG_FRAME, Some(&secrets())));

        assert_eq!(message.event_name, "pong");
        assert_eq!(message.id, "2");
        assert_eq!(message.date_time_stamp, "2017-11-16T21:51:50.499");
        assert_eq!(
            message.incoming_hmac(),
            Some("21FB2315E2FB5A22857F21E48D3EEC0969AD24C0E8A99C56A37B66B9E503E1EF")
        );
        assert!(message.decrypted_json().unwrap().contains("pong"));
    }

    #[test]
    fn test_incoming_encrypted_bad_signature() {
        let tampered = PONG_FRAME.replace("E503E1EF", "E503E1EA");
        assert_eq!(
            Message::from_json(&tampered, Some(&secrets())),
            ParseOutcome::InvalidSignature
        );
    }

    #[test]
    fn test_any_hmac_digit_flip_is_detected() {
        let hmac = "21FB2315E2FB5A22857F21E48D3EEC0969AD24C0E8A99C56A37B66B9E503E1EF";
        for i in 0..hmac.len() {
            let original = hmac.as_bytes()[i];
            let flipped = if original == b'0' { '1' } else { '0' };
            let mut bad = hmac.to_string();
            bad.replace_range(i..i + 1, &flipped.to_string());

            let frame = PONG_FRAME.replace(hmac, &bad);
            assert_eq!(
                Message::from_json(&frame, Some(&secrets())),
                ParseOutcome::InvalidSignature,
                "flip at {i} went undetected"
            );
        }
    }

    #[test]
    fn test_incoming_encrypted_without_secrets() {
        assert_eq!(Message::from_json(PONG_FRAME, None), ParseOutcome::NoSecrets);
    }

    #[test]
    fn test_signed_garbage_is_unparseable() {
        let secrets = secrets();
        let enc = aes_encrypt(secrets.enc_key_bytes(), "definitely not json").unwrap();
        let hmac = hmac_signature(secrets.hmac_key_bytes(), &enc).unwrap();
        let frame = json!({"enc": enc, "hmac": hmac}).to_string();

        assert_eq!(
            Message::from_json(&frame, Some(&secrets)),
            ParseOutcome::Unparseable("definitely not json".to_string())
        );
    }

    #[test]
    fn test_non_envelope_is_unparseable() {
        assert!(matches!(
            Message::from_json("[1,2,3]", None),
            ParseOutcome::Unparseable(_)
        ));
        assert!(matches!(
            Message::from_json("{\"something\":\"else\"}", Some(&secrets())),
            ParseOutcome::Unparseable(_)
        ));
    }

    #[test]
    fn test_outgoing_plaintext_roundtrip() {
        let message = Message::new("77", "event_y", into_data(json!({"param1": "value1"})), false);
        let stamp = MessageStamp::new("BAR1", None);

        let json = message.to_json(&stamp).unwrap();
        let raw: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(raw["message"]["pos_id"], "BAR1");
        assert!(raw.get("enc").is_none());

        let reverted = parsed(Message::from_json(&json, None));
        assert_eq!(reverted.event_name, "event_y");
        assert_eq!(reverted.data_string("param1"), "value1");
    }

    #[test]
    fn test_outgoing_encrypted_roundtrip() {
        let message = Message::new("2", "ping", into_data(json!({"param1": "value1"})), true);
        let stamp = MessageStamp::new("BAR1", Some(secrets()));

        let json = message.to_json(&stamp).unwrap();
        let raw: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(raw["pos_id"], "BAR1");
        assert!(raw.get("message").is_none());

        let reverted = parsed(Message::from_json(&json, Some(&secrets())));
        assert_eq!(reverted.event_name, "ping");
        assert_eq!(reverted.id, "2");
        assert_eq!(reverted.data_string("param1"), "value1");
        assert!(reverted.pos_id.is_none());
    }

    #[test]
    fn test_encrypted_message_without_secrets_goes_plaintext() {
        let message = Message::new("3", "drop_keys", None, true);
        let json = message.to_json(&MessageStamp::new("BAR1", None)).unwrap();
        assert!(json.contains("\"message\""));
    }

    #[test]
    fn test_datetime_stamp_format() {
        let message = Message::new("4", "ping", None, false);
        let json = message.to_json(&MessageStamp::new("BAR1", None)).unwrap();
        let reverted = parsed(Message::from_json(&json, None));

        let stamp = &reverted.date_time_stamp;
        assert_eq!(stamp.len(), "2017-11-16T21:51:50.499".len());
        assert!(NaiveDateTime::parse_from_str(stamp, DATE_TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_server_time_delta_applied_to_stamp() {
        let mut stamp = MessageStamp::new("BAR1", None);
        stamp.server_time_delta = TimeDelta::hours(2);

        let json = Message::new("5", "ping", None, false).to_json(&stamp).unwrap();
        let reverted = parsed(Message::from_json(&json, None));
        let delta = reverted.server_time_delta();

        assert!(delta > TimeDelta::minutes(119));
        assert!(delta < TimeDelta::minutes(121));
    }

    #[test]
    fn test_server_time_delta_defaults_to_zero() {
        let message = Message::new("6", "pong", None, false);
        assert_eq!(message.server_time_delta(), TimeDelta::zero());
    }

    #[test]
    fn test_success_state() {
        let ok = Message::new("1", "x", into_data(json!({"success": true})), false);
        let failed = Message::new("1", "x", into_data(json!({"success": false})), false);
        let unknown = Message::new("1", "x", None, false);

        assert_eq!(ok.success_state(), SuccessState::Success);
        assert_eq!(failed.success_state(), SuccessState::Failed);
        assert_eq!(unknown.success_state(), SuccessState::Unknown);
    }

    #[test]
    fn test_accessors_tolerate_missing_fields() {
        let message = Message::new(
            "1",
            "x",
            into_data(json!({"amount": 1200, "text_amount": "35", "flag": true, "nested": {}})),
            false,
        );

        assert_eq!(message.data_int("amount"), 1200);
        assert_eq!(message.data_int("text_amount"), 35);
        assert_eq!(message.data_int("missing"), 0);
        assert_eq!(message.data_string("missing"), "");
        assert_eq!(message.data_string("nested"), "");
        assert!(message.data_bool("flag", false));
        assert!(message.data_bool("missing", true));
        assert_eq!(message.error_reason(), "");
        assert_eq!(message.error_detail(), "");
    }

    #[test]
    fn test_classify_events() {
        assert_eq!(InboundEvent::classify("key_request"), InboundEvent::KeyRequest);
        assert_eq!(
            InboundEvent::classify("last_transaction"),
            InboundEvent::GetLastTransactionResponse
        );
        assert_eq!(InboundEvent::classify("completion_response"), InboundEvent::PreauthResponse);
        assert_eq!(
            InboundEvent::classify("login_response"),
            InboundEvent::Unknown("login_response".to_string())
        );
    }

    #[test]
    fn test_request_ids_are_unique_and_prefixed() {
        let a = next_request_id("prchs");
        let b = next_request_id("prchs");

        assert!(a.starts_with("prchs"));
        assert_ne!(a, b);
        let n_a: u64 = a["prchs".len()..].parse().unwrap();
        let n_b: u64 = b["prchs".len()..].parse().unwrap();
        assert!(n_b > n_a);
    }

    #[test]
    fn test_require_string() {
        let message = Message::new("1", "key_request", into_data(json!({"a": "x"})), false);
        assert_eq!(require_string(&message, "a").unwrap(), "x");
        assert!(matches!(
            require_string(&message, "b"),
            Err(ProtocolError::MissingField { .. })
        ));
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(1000), "$10.00");
        assert_eq!(format_cents(5), "$0.05");
        assert_eq!(format_cents(12345), "$123.45");
        assert_eq!(format_cents(-250), "-$2.50");
    }
}
