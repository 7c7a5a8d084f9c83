//! Settlement and settlement enquiry.
//!
//! The terminal reports settlement periods as a time field plus a `ddMMMyy`
//! date field. Two-digit years up to 29 are read as 20xx, the rest as 19xx.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::messages::{events, Message, SuccessState};

/// Last two-digit year read as belonging to the 2000s.
const TWO_DIGIT_YEAR_PIVOT: i32 = 29;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleRequest {
    pub id: String,
}

impl SettleRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn to_message(&self) -> Message {
        Message::new(self.id.clone(), events::SETTLE_REQUEST, None, true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementEnquiryRequest {
    pub id: String,
}

impl SettlementEnquiryRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn to_message(&self) -> Message {
        Message::new(self.id.clone(), events::SETTLEMENT_ENQUIRY_REQUEST, None, true)
    }
}

/// Totals for one card scheme within a settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeSettlementEntry {
    pub scheme_name: String,
    pub settle_by_acquirer: bool,
    pub total_count: i64,
    pub total_value: i64,
}

impl SchemeSettlementEntry {
    fn from_value(value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default();
        let number = |key: &str| match value.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
            Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
            _ => 0,
        };

        Self {
            scheme_name: text("scheme_name").to_string(),
            settle_by_acquirer: text("settle_by_acquirer").eq_ignore_ascii_case("yes"),
            total_count: number("total_count"),
            total_value: number("total_value"),
        }
    }
}

/// Response to a settle or settlement enquiry request.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    message: Message,
}

impl Settlement {
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn request_id(&self) -> &str {
        &self.message.id
    }

    pub fn success(&self) -> bool {
        self.message.success_state() == SuccessState::Success
    }

    pub fn settle_by_acquirer_count(&self) -> i64 {
        self.message.data_int("accumulated_settle_by_acquirer_count")
    }

    pub fn settle_by_acquirer_value(&self) -> i64 {
        self.message.data_int("accumulated_settle_by_acquirer_value")
    }

    pub fn total_count(&self) -> i64 {
        self.message.data_int("accumulated_total_count")
    }

    pub fn total_value(&self) -> i64 {
        self.message.data_int("accumulated_total_value")
    }

    pub fn period_start_time(&self) -> Option<NaiveDateTime> {
        self.parse_timestamp(
            "settlement_period_start_time",
            "settlement_period_start_date",
            "%H:%M",
        )
    }

    pub fn period_end_time(&self) -> Option<NaiveDateTime> {
        self.parse_timestamp(
            "settlement_period_end_time",
            "settlement_period_end_date",
            "%H:%M",
        )
    }

    pub fn triggered_time(&self) -> Option<NaiveDateTime> {
        self.parse_timestamp(
            "settlement_triggered_time",
            "settlement_triggered_date",
            "%H:%M:%S",
        )
    }

    pub fn response_text(&self) -> String {
        self.message.data_string("host_response_text")
    }

    pub fn receipt(&self) -> String {
        self.message.data_string("merchant_receipt")
    }

    pub fn transaction_range(&self) -> String {
        self.message.data_string("transaction_range")
    }

    pub fn terminal_id(&self) -> String {
        self.message.data_string("terminal_id")
    }

    pub fn scheme_settlement_entries(&self) -> Vec<SchemeSettlementEntry> {
        match self.message.data_value("schemes") {
            Some(Value::Array(schemes)) => {
                schemes.iter().map(SchemeSettlementEntry::from_value).collect()
            }
            _ => Vec::new(),
        }
    }

    fn parse_timestamp(
        &self,
        time_key: &str,
        date_key: &str,
        time_format: &str,
    ) -> Option<NaiveDateTime> {
        let time = self.message.data_string(time_key);
        let date = parse_short_date(&self.message.data_string(date_key))?;
        let time = chrono::NaiveTime::parse_from_str(&time, time_format).ok()?;
        Some(date.and_time(time))
    }
}

/// Parses `ddMMMyy` (e.g. `05Oct17`) with the two-digit year pivot.
fn parse_short_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 7 || !raw.is_ascii() {
        return None;
    }
    let (day_month, yy) = raw.split_at(5);
    let yy: i32 = yy.parse().ok()?;
    let year = if yy <= TWO_DIGIT_YEAR_PIVOT { 2000 + yy } else { 1900 + yy };
    NaiveDate::parse_from_str(&format!("{day_month}{year}"), "%d%b%Y").ok()
}
