//! Cash-only withdrawal.

use serde_json::json;

use crate::messages::{events, into_data, next_request_id, Message};
use crate::purchase::{ReceiptOptions, TransactionResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashoutOnlyRequest {
    pub pos_ref_id: String,
    pub cashout_amount: i64,
    pub options: ReceiptOptions,
}

impl CashoutOnlyRequest {
    pub fn new(cashout_amount: i64, pos_ref_id: impl Into<String>) -> Self {
        Self {
            pos_ref_id: pos_ref_id.into(),
            cashout_amount,
            options: ReceiptOptions::default(),
        }
    }

    pub fn to_message(&self) -> Message {
        let mut data = into_data(json!({
            "pos_ref_id": self.pos_ref_id,
            "cash_amount": self.cashout_amount,
        }))
        .unwrap_or_default();
        self.options.apply(&mut data);
        Message::new(next_request_id("cshout"), events::CASHOUT_ONLY_REQUEST, Some(data), true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CashoutOnlyResponse {
    message: Message,
}

impl CashoutOnlyResponse {
    pub fn new(message: Message) -> Self {
        Self { message }
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
}

impl TransactionResponse for CashoutOnlyResponse {
    fn message(&self) -> &Message {
        &self.message
    }
}
