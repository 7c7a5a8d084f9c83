//! Purchase, refund, MOTO and last-transaction messages, plus the
//! signature and phone-authorisation sub-flows.
//!
//! Requests are plain structs turned into a [`Message`] by `to_message`.
//! Responses are typed views over the received [`Message`]; their getters
//! never fail and return empty or zero values for absent fields.

use chrono::NaiveDate;
use serde_json::{json, Value};

use crate::messages::{events, into_data, next_request_id, Message, MessageData, SuccessState};

// ============================================================================
// Shared pieces
// ============================================================================

/// Receipt behaviour the POS asks the terminal for on financial requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiptOptions {
    /// Terminal prompts before printing the customer copy.
    pub prompt_for_customer_copy: bool,
    /// Terminal prints the signature-required receipt itself.
    pub signature_flow_on_eftpos: bool,
}

impl ReceiptOptions {
    /// Adds the enabled options to request data; disabled ones are omitted.
    pub fn apply(&self, data: &mut MessageData) {
        if self.prompt_for_customer_copy {
            data.insert("prompt_for_customer_copy".to_string(), Value::Bool(true));
        }
        if self.signature_flow_on_eftpos {
            data.insert(
                "print_for_signature_required_transactions".to_string(),
                Value::Bool(true),
            );
        }
    }
}

fn request_data(value: Value, options: &ReceiptOptions) -> Option<MessageData> {
    let mut data = into_data(value).unwrap_or_default();
    options.apply(&mut data);
    Some(data)
}

/// Getters common to every financial response from the terminal.
pub trait TransactionResponse {
    /// The underlying received message.
    fn message(&self) -> &Message;

    fn request_id(&self) -> &str {
        &self.message().id
    }

    fn success(&self) -> bool {
        self.message().success_state() == SuccessState::Success
    }

    fn pos_ref_id(&self) -> String {
        self.message().data_string("pos_ref_id")
    }

    fn scheme_name(&self) -> String {
        self.message().data_string("scheme_name")
    }

    fn rrn(&self) -> String {
        self.message().data_string("rrn")
    }

    fn customer_receipt(&self) -> String {
        self.message().data_string("customer_receipt")
    }

    fn merchant_receipt(&self) -> String {
        self.message().data_string("merchant_receipt")
    }

    fn response_text(&self) -> String {
        self.message().data_string("host_response_text")
    }

    fn response_code(&self) -> String {
        self.message().data_string("host_response_code")
    }

    fn terminal_reference_id(&self) -> String {
        self.message().data_string("terminal_ref_id")
    }

    fn card_entry(&self) -> String {
        self.message().data_string("card_entry")
    }

    fn account_type(&self) -> String {
        self.message().data_string("account_type")
    }

    fn auth_code(&self) -> String {
        self.message().data_string("auth_code")
    }

    fn bank_date(&self) -> String {
        self.message().data_string("bank_date")
    }

    fn bank_time(&self) -> String {
        self.message().data_string("bank_time")
    }

    fn masked_pan(&self) -> String {
        self.message().data_string("masked_pan")
    }

    fn terminal_id(&self) -> String {
        self.message().data_string("terminal_id")
    }

    fn was_merchant_receipt_printed(&self) -> bool {
        self.message().data_bool("merchant_receipt_printed", false)
    }

    fn was_customer_receipt_printed(&self) -> bool {
        self.message().data_bool("customer_receipt_printed", false)
    }

    /// `bank_settlement_date`, sent as `ddMMyyyy`.
    fn settlement_date(&self) -> Option<NaiveDate> {
        let raw = self.message().data_string("bank_settlement_date");
        NaiveDate::parse_from_str(&raw, "%d%m%Y").ok()
    }

    /// Any other data field, as a string.
    fn response_value(&self, key: &str) -> String {
        self.message().data_string(key)
    }
}

// ============================================================================
// Purchase
// ============================================================================

/// A purchase, optionally with tip, cashout or a cashout prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRequest {
    pub pos_ref_id: String,
    pub purchase_amount: i64,
    pub tip_amount: i64,
    pub cashout_amount: i64,
    pub prompt_for_cashout: bool,
    pub options: ReceiptOptions,
}

impl PurchaseRequest {
    pub fn new(purchase_amount: i64, pos_ref_id: impl Into<String>) -> Self {
        Self {
            pos_ref_id: pos_ref_id.into(),
            purchase_amount,
            tip_amount: 0,
            cashout_amount: 0,
            prompt_for_cashout: false,
            options: ReceiptOptions::default(),
        }
    }

    /// One-line breakdown used in display messages.
    pub fn amount_summary(&self) -> String {
        use crate::messages::format_cents;
        format!(
            "Purchase: {}; Tip: {}; Cashout: {};",
            format_cents(self.purchase_amount),
            format_cents(self.tip_amount),
            format_cents(self.cashout_amount)
        )
    }

    pub fn to_message(&self) -> Message {
        let data = request_data(
            json!({
                "pos_ref_id": self.pos_ref_id,
                "purchase_amount": self.purchase_amount,
                "tip_amount": self.tip_amount,
                "cash_amount": self.cashout_amount,
                "prompt_for_cashout": self.prompt_for_cashout,
            }),
            &self.options,
        );
        Message::new(next_request_id("prchs"), events::PURCHASE_REQUEST, data, true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseResponse {
    message: Message,
}

impl PurchaseResponse {
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn purchase_amount(&self) -> i64 {
        self.message.data_int("purchase_amount")
    }

    pub fn tip_amount(&self) -> i64 {
        self.message.data_int("tip_amount")
    }

    pub fn cashout_amount(&self) -> i64 {
        self.message.data_int("cash_amount")
    }

    pub fn bank_non_cash_amount(&self) -> i64 {
        self.message.data_int("bank_noncash_amount")
    }

    pub fn bank_cash_amount(&self) -> i64 {
        self.message.data_int("bank_cash_amount")
    }

    /// Condensed record of this payment, stored in pay-at-table bill history.
    pub fn to_payment_summary(&self) -> Value {
        json!({
            "account_type": self.account_type(),
            "auth_code": self.auth_code(),
            "bank_date": self.bank_date(),
            "bank_time": self.bank_time(),
            "host_response_code": self.response_code(),
            "host_response_text": self.response_text(),
            "masked_pan": self.masked_pan(),
            "purchase_amount": self.purchase_amount(),
            "rrn": self.rrn(),
            "scheme_name": self.scheme_name(),
            "terminal_id": self.terminal_id(),
            "terminal_ref_id": self.terminal_reference_id(),
            "tip_amount": self.tip_amount(),
        })
    }
}

impl TransactionResponse for PurchaseResponse {
    fn message(&self) -> &Message {
        &self.message
    }
}

// ============================================================================
// Refund
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub pos_ref_id: String,
    pub amount_cents: i64,
    pub options: ReceiptOptions,
}

impl RefundRequest {
    pub fn new(amount_cents: i64, pos_ref_id: impl Into<String>) -> Self {
        Self {
            pos_ref_id: pos_ref_id.into(),
            amount_cents,
            options: ReceiptOptions::default(),
        }
    }

    pub fn to_message(&self) -> Message {
        let data = request_data(
            json!({
                "refund_amount": self.amount_cents,
                "pos_ref_id": self.pos_ref_id,
            }),
            &self.options,
        );
        Message::new(next_request_id("refund"), events::REFUND_REQUEST, data, true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundResponse {
    message: Message,
}

impl RefundResponse {
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn refund_amount(&self) -> i64 {
        self.message.data_int("refund_amount")
    }
}

impl TransactionResponse for RefundResponse {
    fn message(&self) -> &Message {
        &self.message
    }
}

// ============================================================================
// MOTO
// ============================================================================

/// Mail order / telephone order purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotoPurchaseRequest {
    pub pos_ref_id: String,
    pub purchase_amount: i64,
    pub options: ReceiptOptions,
}

impl MotoPurchaseRequest {
    pub fn new(purchase_amount: i64, pos_ref_id: impl Into<String>) -> Self {
        Self {
            pos_ref_id: pos_ref_id.into(),
            purchase_amount,
            options: ReceiptOptions::default(),
        }
    }

    pub fn to_message(&self) -> Message {
        let data = request_data(
            json!({
                "pos_ref_id": self.pos_ref_id,
                "purchase_amount": self.purchase_amount,
            }),
            &self.options,
        );
        Message::new(next_request_id("moto"), events::MOTO_PURCHASE_REQUEST, data, true)
    }
}

/// A MOTO response carries the same fields as a purchase response.
#[derive(Debug, Clone, PartialEq)]
pub struct MotoPurchaseResponse {
    pub purchase_response: PurchaseResponse,
}

impl MotoPurchaseResponse {
    pub fn new(message: Message) -> Self {
        Self {
            purchase_response: PurchaseResponse::new(message),
        }
    }

    pub fn pos_ref_id(&self) -> String {
        self.purchase_response.pos_ref_id()
    }
}

// ============================================================================
// Cancel and last transaction
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CancelTransactionRequest;

impl CancelTransactionRequest {
    pub fn to_message(&self) -> Message {
        Message::new(next_request_id("ctx"), events::CANCEL_TRANSACTION_REQUEST, None, true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetLastTransactionRequest;

impl GetLastTransactionRequest {
    pub fn to_message(&self) -> Message {
        Message::new(next_request_id("glt"), events::GET_LAST_TRANSACTION_REQUEST, None, true)
    }
}

/// The terminal's report of its most recent transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct GetLastTransactionResponse {
    message: Message,
}

impl GetLastTransactionResponse {
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// A transaction was found, which the terminal signals with a host
    /// response code.
    pub fn was_retrieved_successfully(&self) -> bool {
        !self.response_code().is_empty()
    }

    pub fn was_operation_in_progress_error(&self) -> bool {
        self.message.error_reason().starts_with("OPERATION_IN_PROGRESS")
    }

    pub fn is_waiting_for_signature_response(&self) -> bool {
        self.message
            .error_reason()
            .starts_with("OPERATION_IN_PROGRESS_AWAITING_SIGNATURE")
    }

    pub fn is_waiting_for_auth_code(&self) -> bool {
        self.message
            .error_reason()
            .starts_with("OPERATION_IN_PROGRESS_AWAITING_PHONE_AUTH_CODE")
    }

    /// The terminal is still busy with the transaction we are tracking.
    pub fn is_still_in_progress(&self, pos_ref_id: &str) -> bool {
        self.was_operation_in_progress_error() && self.pos_ref_id() == pos_ref_id
    }

    pub fn success_state(&self) -> SuccessState {
        self.message.success_state()
    }

    pub fn tx_type(&self) -> String {
        self.message.data_string("transaction_type")
    }

    pub fn amount(&self) -> i64 {
        self.message.data_int("amount_purchase")
    }

    pub fn transaction_amount(&self) -> i64 {
        self.message.data_int("amount_transaction_type")
    }

    pub fn bank_date_time_string(&self) -> String {
        format!("{}{}", self.bank_date(), self.bank_time())
    }

    /// Fills a missing customer receipt from the merchant receipt.
    ///
    /// Some terminals omit `customer_receipt` from last-transaction replies.
    pub fn copy_merchant_receipt_to_customer_receipt(&mut self) {
        let customer = self.customer_receipt();
        let merchant = self.merchant_receipt();
        if !merchant.is_empty() && customer.is_empty() {
            self.message
                .data
                .get_or_insert_with(Default::default)
                .insert("customer_receipt".to_string(), Value::String(merchant));
        }
    }
}

impl TransactionResponse for GetLastTransactionResponse {
    fn message(&self) -> &Message {
        &self.message
    }
}

// ============================================================================
// Signature flow
// ============================================================================

/// The terminal needs the merchant to check the customer's signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequired {
    pub request_id: String,
    pub pos_ref_id: String,
    receipt_to_sign: String,
}

impl SignatureRequired {
    pub fn from_message(message: &Message) -> Self {
        Self {
            request_id: message.id.clone(),
            pos_ref_id: message.data_string("pos_ref_id"),
            receipt_to_sign: message.data_string("merchant_receipt"),
        }
    }

    pub fn new(
        pos_ref_id: impl Into<String>,
        request_id: impl Into<String>,
        receipt_to_sign: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            pos_ref_id: pos_ref_id.into(),
            receipt_to_sign: receipt_to_sign.into(),
        }
    }

    pub fn merchant_receipt(&self) -> &str {
        &self.receipt_to_sign
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureDecline {
    pub pos_ref_id: String,
}

impl SignatureDecline {
    pub fn to_message(&self) -> Message {
        Message::new(
            next_request_id("sigdec"),
            events::SIGNATURE_DECLINED,
            into_data(json!({"pos_ref_id": self.pos_ref_id})),
            true,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureAccept {
    pub pos_ref_id: String,
}

impl SignatureAccept {
    pub fn to_message(&self) -> Message {
        Message::new(
            next_request_id("sigacc"),
            events::SIGNATURE_ACCEPTED,
            into_data(json!({"pos_ref_id": self.pos_ref_id})),
            true,
        )
    }
}

// ============================================================================
// Phone authorisation flow
// ============================================================================

/// The merchant must phone the authorisation centre for a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneForAuthRequired {
    pub request_id: String,
    pub pos_ref_id: String,
    phone_number: String,
    merchant_id: String,
}

impl PhoneForAuthRequired {
    pub fn from_message(message: &Message) -> Self {
        Self {
            request_id: message.id.clone(),
            pos_ref_id: message.data_string("pos_ref_id"),
            phone_number: message.data_string("auth_centre_phone_number"),
            merchant_id: message.data_string("merchant_id"),
        }
    }

    pub fn new(
        pos_ref_id: impl Into<String>,
        request_id: impl Into<String>,
        phone_number: impl Into<String>,
        merchant_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            pos_ref_id: pos_ref_id.into(),
            phone_number: phone_number.into(),
            merchant_id: merchant_id.into(),
        }
    }

    pub fn phone_number(&self) -> &str {
        &self.phone_number
    }

    pub fn merchant_id(&self) -> &str {
        &self.merchant_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCodeAdvice {
    pub pos_ref_id: String,
    pub auth_code: String,
}

impl AuthCodeAdvice {
    pub fn to_message(&self) -> Message {
        Message::new(
            next_request_id("authad"),
            events::AUTH_CODE_ADVICE,
            into_data(json!({
                "pos_ref_id": self.pos_ref_id,
                "auth_code": self.auth_code,
            })),
            true,
        )
    }
}
