//! Preauthorisation sub-protocol: account verification and the lifecycle of
//! a held amount (open, topup, partial cancel, extend, cancel, complete).

use serde_json::{json, Value};

use crate::messages::{events, into_data, next_request_id, Message};
use crate::purchase::{PurchaseResponse, TransactionResponse};

/// Builds a preauth-family request message.
fn preauth_message(prefix: &str, event: &str, data: Value) -> Message {
    Message::new(next_request_id(prefix), event, into_data(data), true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountVerifyRequest {
    pub pos_ref_id: String,
}

impl AccountVerifyRequest {
    pub fn to_message(&self) -> Message {
        preauth_message(
            "prav",
            events::ACCOUNT_VERIFY_REQUEST,
            json!({"pos_ref_id": self.pos_ref_id}),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountVerifyResponse {
    pub details: PurchaseResponse,
}

impl AccountVerifyResponse {
    pub fn new(message: Message) -> Self {
        Self {
            details: PurchaseResponse::new(message),
        }
    }

    pub fn pos_ref_id(&self) -> String {
        self.details.pos_ref_id()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreauthOpenRequest {
    pub pos_ref_id: String,
    pub preauth_amount: i64,
}

impl PreauthOpenRequest {
    pub fn to_message(&self) -> Message {
        preauth_message(
            "prac",
            events::PREAUTH_OPEN_REQUEST,
            json!({
                "pos_ref_id": self.pos_ref_id,
                "preauth_amount": self.preauth_amount,
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreauthTopupRequest {
    pub pos_ref_id: String,
    pub preauth_id: String,
    pub topup_amount: i64,
}

impl PreauthTopupRequest {
    pub fn to_message(&self) -> Message {
        preauth_message(
            "prtu",
            events::PREAUTH_TOPUP_REQUEST,
            json!({
                "pos_ref_id": self.pos_ref_id,
                "preauth_id": self.preauth_id,
                "topup_amount": self.topup_amount,
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreauthPartialCancellationRequest {
    pub pos_ref_id: String,
    pub preauth_id: String,
    pub partial_cancellation_amount: i64,
}

impl PreauthPartialCancellationRequest {
    pub fn to_message(&self) -> Message {
        preauth_message(
            "prpc",
            events::PREAUTH_PARTIAL_CANCELLATION_REQUEST,
            json!({
                "pos_ref_id": self.pos_ref_id,
                "preauth_id": self.preauth_id,
                "preauth_cancel_amount": self.partial_cancellation_amount,
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreauthExtendRequest {
    pub pos_ref_id: String,
    pub preauth_id: String,
}

impl PreauthExtendRequest {
    pub fn to_message(&self) -> Message {
        preauth_message(
            "prext",
            events::PREAUTH_EXTEND_REQUEST,
            json!({
                "pos_ref_id": self.pos_ref_id,
                "preauth_id": self.preauth_id,
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreauthCancelRequest {
    pub pos_ref_id: String,
    pub preauth_id: String,
}

impl PreauthCancelRequest {
    pub fn to_message(&self) -> Message {
        preauth_message(
            "prac",
            events::PREAUTH_CANCELLATION_REQUEST,
            json!({
                "pos_ref_id": self.pos_ref_id,
                "preauth_id": self.preauth_id,
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreauthCompletionRequest {
    pub pos_ref_id: String,
    pub preauth_id: String,
    pub completion_amount: i64,
}

impl PreauthCompletionRequest {
    pub fn to_message(&self) -> Message {
        preauth_message(
            "prac",
            events::PREAUTH_COMPLETE_REQUEST,
            json!({
                "pos_ref_id": self.pos_ref_id,
                "preauth_id": self.preauth_id,
                "completion_amount": self.completion_amount,
            }),
        )
    }
}

/// Response to any preauth operation.
///
/// Balances depend on `transaction_type`, which names the operation the
/// terminal performed.
#[derive(Debug, Clone, PartialEq)]
pub struct PreauthResponse {
    pub preauth_id: String,
    pub details: PurchaseResponse,
}

impl PreauthResponse {
    pub fn new(message: Message) -> Self {
        Self {
            preauth_id: message.data_string("preauth_id"),
            details: PurchaseResponse::new(message),
        }
    }

    pub fn pos_ref_id(&self) -> String {
        self.details.pos_ref_id()
    }

    fn tx_type(&self) -> String {
        self.details.response_value("transaction_type")
    }

    fn amount(&self, key: &str) -> i64 {
        self.details.message().data_int(key)
    }

    /// Amount still held after this operation.
    pub fn balance_amount(&self) -> i64 {
        match self.tx_type().as_str() {
            "PRE-AUTH" => self.amount("preauth_amount"),
            "TOPUP" | "CANCEL" | "PRE-AUTH EXT" => self.amount("balance_amount"),
            _ => 0,
        }
    }

    /// Amount held before this operation.
    ///
    /// Completion responses omit `existing_preauth_amount`, so the completed
    /// amount stands in for it.
    pub fn previous_balance_amount(&self) -> i64 {
        match self.tx_type().as_str() {
            "TOPUP" | "CANCEL" | "PRE-AUTH EXT" => self.amount("existing_preauth_amount"),
            "PCOMP" => self.amount("completion_amount"),
            "PRE-AUTH CANCEL" => self.amount("preauth_amount"),
            _ => 0,
        }
    }

    pub fn completion_amount(&self) -> i64 {
        match self.tx_type().as_str() {
            "PCOMP" => self.amount("completion_amount"),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preauth_response(data: Value) -> PreauthResponse {
        PreauthResponse::new(Message::new(
            "x",
            events::PREAUTH_OPEN_RESPONSE,
            into_data(data),
            true,
        ))
    }

    #[test]
    fn test_request_prefixes_and_fields() {
        let verify = AccountVerifyRequest { pos_ref_id: "av".to_string() }.to_message();
        assert!(verify.id.starts_with("prav"));
        assert_eq!(verify.event_name, "account_verify");

        let open = PreauthOpenRequest {
            pos_ref_id: "p".to_string(),
            preauth_amount: 10000,
        }
        .to_message();
        assert!(open.id.starts_with("prac"));
        assert_eq!(open.data_int("preauth_amount"), 10000);

        let topup = PreauthTopupRequest {
            pos_ref_id: "p".to_string(),
            preauth_id: "PA1".to_string(),
            topup_amount: 500,
        }
        .to_message();
        assert!(topup.id.starts_with("prtu"));
        assert_eq!(topup.data_string("preauth_id"), "PA1");
        assert_eq!(topup.data_int("topup_amount"), 500);

        let partial = PreauthPartialCancellationRequest {
            pos_ref_id: "p".to_string(),
            preauth_id: "PA1".to_string(),
            partial_cancellation_amount: 200,
        }
        .to_message();
        assert!(partial.id.starts_with("prpc"));
        assert_eq!(partial.data_int("preauth_cancel_amount"), 200);

        let extend = PreauthExtendRequest {
            pos_ref_id: "p".to_string(),
            preauth_id: "PA1".to_string(),
        }
        .to_message();
        assert!(extend.id.starts_with("prext"));
        assert_eq!(extend.event_name, "preauth_extend");

        let cancel = PreauthCancelRequest {
            pos_ref_id: "p".to_string(),
            preauth_id: "PA1".to_string(),
        }
        .to_message();
        assert_eq!(cancel.event_name, "preauth_cancellation");

        let complete = PreauthCompletionRequest {
            pos_ref_id: "p".to_string(),
            preauth_id: "PA1".to_string(),
            completion_amount: 9000,
        }
        .to_message();
        assert_eq!(complete.event_name, "completion");
        assert_eq!(complete.data_int("completion_amount"), 9000);
        assert!(complete.needs_encryption());
    }

    #[test]
    fn test_open_balances() {
        let r = preauth_response(json!({
            "transaction_type": "PRE-AUTH",
            "preauth_id": "PA1",
            "pos_ref_id": "p",
            "preauth_amount": 10000,
        }));

        assert_eq!(r.preauth_id, "PA1");
        assert_eq!(r.pos_ref_id(), "p");
        assert_eq!(r.balance_amount(), 10000);
        assert_eq!(r.previous_balance_amount(), 0);
        assert_eq!(r.completion_amount(), 0);
    }

    #[test]
    fn test_topup_balances() {
        let r = preauth_response(json!({
            "transaction_type": "TOPUP",
            "balance_amount": 15000,
            "existing_preauth_amount": 10000,
        }));

        assert_eq!(r.balance_amount(), 15000);
        assert_eq!(r.previous_balance_amount(), 10000);
    }

    #[test]
    fn test_completion_balances() {
        let r = preauth_response(json!({
            "transaction_type": "PCOMP",
            "completion_amount": 9000,
            "balance_amount": 1234,
        }));

        assert_eq!(r.balance_amount(), 0);
        assert_eq!(r.previous_balance_amount(), 9000);
        assert_eq!(r.completion_amount(), 9000);
    }

    #[test]
    fn test_cancel_balances() {
        let r = preauth_response(json!({
            "transaction_type": "PRE-AUTH CANCEL",
            "preauth_amount": 10000,
        }));

        assert_eq!(r.balance_amount(), 0);
        assert_eq!(r.previous_balance_amount(), 10000);
    }

    #[test]
    fn test_unknown_type_is_zero() {
        let r = preauth_response(json!({"transaction_type": "???", "balance_amount": 5}));
        assert_eq!(r.balance_amount(), 0);
        assert_eq!(r.previous_balance_amount(), 0);
    }

    #[test]
    fn test_account_verify_response() {
        let message = Message::new(
            "x",
            events::ACCOUNT_VERIFY_RESPONSE,
            into_data(json!({"pos_ref_id": "av1", "success": true, "masked_pan": "XXXX1234"})),
            true,
        );
        let r = AccountVerifyResponse::new(message);

        assert_eq!(r.pos_ref_id(), "av1");
        assert!(r.details.success());
        assert_eq!(r.details.masked_pan(), "XXXX1234");
    }
}
