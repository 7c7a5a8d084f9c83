//! Pay-at-table sub-protocol.
//!
//! The terminal drives this flow: it asks for table configuration, for the
//! bill on a table, and advises payments against a bill. The POS keeps an
//! opaque `bill_data` string per bill on the terminal's behalf. It is the
//! base64 of a JSON list of [`PaymentHistoryEntry`] and lets a repeated
//! payment advice be recognised.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ProtocolError, Result};
use crate::messages::{events, into_data, Message};
use crate::purchase::{PurchaseResponse, TransactionResponse};

/// Outcome of looking up a bill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BillRetrievalResult {
    #[default]
    Success,
    InvalidTableId,
    InvalidBillId,
    InvalidOperatorId,
}

impl BillRetrievalResult {
    /// Wire name, also used as the error reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::InvalidTableId => "INVALID_TABLE_ID",
            Self::InvalidBillId => "INVALID_BILL_ID",
            Self::InvalidOperatorId => "INVALID_OPERATOR_ID",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PaymentType {
    #[default]
    Card,
    Cash,
}

impl PaymentType {
    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("cash") {
            Self::Cash
        } else {
            Self::Card
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Cash => "cash",
        }
    }
}

/// One payment recorded in a bill's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentHistoryEntry {
    pub payment_type: String,
    pub payment_summary: Value,
}

impl PaymentHistoryEntry {
    pub fn terminal_ref_id(&self) -> Option<&str> {
        self.payment_summary
            .get("terminal_ref_id")
            .and_then(Value::as_str)
    }
}

/// The POS's view of a bill, returned by the bill handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillStatusResponse {
    pub result: BillRetrievalResult,
    pub bill_id: String,
    pub table_id: String,
    /// Bill total in cents.
    pub total_amount: i64,
    /// Amount still owed in cents.
    pub outstanding_amount: i64,
    /// Opaque history kept on the terminal's behalf.
    pub bill_data: String,
}

impl BillStatusResponse {
    /// Decodes `bill_data`; blank data is an empty history.
    pub fn bill_payment_history(&self) -> Result<Vec<PaymentHistoryEntry>> {
        if self.bill_data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let bytes = BASE64
            .decode(self.bill_data.trim())
            .map_err(|e| ProtocolError::InvalidField {
                field: "bill_data".to_string(),
                reason: e.to_string(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| ProtocolError::InvalidField {
            field: "bill_data".to_string(),
            reason: e.to_string(),
        })
    }

    /// Encodes a history as `bill_data`; an empty history is `""`.
    pub fn to_bill_data(history: &[PaymentHistoryEntry]) -> Result<String> {
        if history.is_empty() {
            return Ok(String::new());
        }
        Ok(BASE64.encode(serde_json::to_vec(history)?))
    }

    /// Builds the `bill_details` reply to the terminal request `message_id`.
    pub fn to_message(&self, message_id: &str) -> Result<Message> {
        let success = self.result == BillRetrievalResult::Success;
        let mut data = into_data(json!({"success": success})).unwrap_or_default();

        if !self.bill_id.trim().is_empty() {
            data.insert("bill_id".to_string(), json!(self.bill_id));
        }
        if !self.table_id.trim().is_empty() {
            data.insert("table_id".to_string(), json!(self.table_id));
        }

        if success {
            data.insert("bill_total_amount".to_string(), json!(self.total_amount));
            data.insert("bill_outstanding_amount".to_string(), json!(self.outstanding_amount));
            data.insert(
                "bill_payment_history".to_string(),
                serde_json::to_value(self.bill_payment_history()?)?,
            );
        } else {
            data.insert("error_reason".to_string(), json!(self.result.as_str()));
            data.insert("error_detail".to_string(), json!(self.result.as_str()));
        }

        Ok(Message::new(
            message_id,
            events::PAY_AT_TABLE_BILL_DETAILS,
            Some(data),
            true,
        ))
    }
}

/// Terminal request for the bill on a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillDetailsRequest {
    pub request_id: String,
    pub table_id: String,
    pub operator_id: String,
}

impl BillDetailsRequest {
    pub fn from_message(message: &Message) -> Self {
        Self {
            request_id: message.id.clone(),
            table_id: message.data_string("table_id"),
            operator_id: message.data_string("operator_id"),
        }
    }
}

/// Terminal advice that a payment was made against a bill.
#[derive(Debug, Clone, PartialEq)]
pub struct BillPayment {
    pub bill_id: String,
    pub table_id: String,
    pub operator_id: String,
    pub payment_type: PaymentType,
    pub purchase_amount: i64,
    pub tip_amount: i64,
    /// The advice's `payment_details`, read as a purchase response.
    pub purchase_response: PurchaseResponse,
}

impl BillPayment {
    pub fn from_message(message: &Message) -> Self {
        let details = match message.data_value("payment_details") {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        };
        let purchase_response = PurchaseResponse::new(Message::new(
            message.id.clone(),
            "payment_details",
            details,
            false,
        ));

        Self {
            bill_id: message.data_string("bill_id"),
            table_id: message.data_string("table_id"),
            operator_id: message.data_string("operator_id"),
            payment_type: PaymentType::parse(&message.data_string("payment_type")),
            purchase_amount: purchase_response.purchase_amount(),
            tip_amount: purchase_response.tip_amount(),
            purchase_response,
        }
    }

    /// The history entry recording this payment.
    pub fn to_history_entry(&self) -> PaymentHistoryEntry {
        PaymentHistoryEntry {
            payment_type: self.payment_type.as_str().to_string(),
            payment_summary: self.purchase_response.to_payment_summary(),
        }
    }

    pub fn terminal_ref_id(&self) -> String {
        self.purchase_response.terminal_reference_id()
    }
}

/// Pay-at-table settings pushed to the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayAtTableConfig {
    pub operator_id_enabled: bool,
    pub split_by_amount_enabled: bool,
    pub equal_split_enabled: bool,
    pub tipping_enabled: bool,
    pub summary_report_enabled: bool,
    pub label_pay_button: String,
    pub label_operator_id: String,
    pub label_table_id: String,
    /// Operator ids the terminal accepts; empty allows any.
    pub allowed_operator_ids: Vec<String>,
}

impl Default for PayAtTableConfig {
    fn default() -> Self {
        Self {
            operator_id_enabled: true,
            split_by_amount_enabled: true,
            equal_split_enabled: true,
            tipping_enabled: true,
            summary_report_enabled: true,
            label_pay_button: "Pay at Table".to_string(),
            label_operator_id: "Operator ID".to_string(),
            label_table_id: "Table Number".to_string(),
            allowed_operator_ids: Vec::new(),
        }
    }
}

impl PayAtTableConfig {
    pub fn to_message(&self, message_id: &str) -> Message {
        Message::new(
            message_id,
            events::PAY_AT_TABLE_SET_TABLE_CONFIG,
            into_data(json!({
                "pay_at_table_enabled": true,
                "operator_id_enabled": self.operator_id_enabled,
                "split_by_amount_enabled": self.split_by_amount_enabled,
                "equal_split_enabled": self.equal_split_enabled,
                "tipping_enabled": self.tipping_enabled,
                "summary_report_enabled": self.summary_report_enabled,
                "pay_button_label": self.label_pay_button,
                "operator_id_label": self.label_operator_id,
                "table_id_label": self.label_table_id,
                "operator_id_list": self.allowed_operator_ids,
            })),
            true,
        )
    }

    /// Tells the terminal pay-at-table is not available on this POS.
    pub fn feature_disable_message(message_id: &str) -> Message {
        Message::new(
            message_id,
            events::PAY_AT_TABLE_SET_TABLE_CONFIG,
            into_data(json!({"pay_at_table_enabled": false})),
            true,
        )
    }
}
