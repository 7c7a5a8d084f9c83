//! Pay-at-table requests from the terminal.

mod common;

use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use serde_json::json;
use spi_client::spi_protocol::{
    BillPayment, BillRetrievalResult, BillStatusResponse, PayAtTableConfig,
};
use spi_client::PayAtTableHandler;

/// A single bill on table 12, stored the way a POS would.
#[derive(Default)]
struct Bills {
    bill_data: Mutex<String>,
    total: i64,
    payments_received: Mutex<Vec<String>>,
    reject_payments: bool,
}

impl PayAtTableHandler for Bills {
    fn bill_status(
        &self,
        bill_id: Option<&str>,
        table_id: &str,
        _operator_id: &str,
    ) -> BillStatusResponse {
        if table_id != "12" || bill_id.is_some_and(|id| id != "b1") {
            return BillStatusResponse {
                result: BillRetrievalResult::InvalidBillId,
                ..Default::default()
            };
        }
        BillStatusResponse {
            result: BillRetrievalResult::Success,
            bill_id: "b1".to_string(),
            table_id: table_id.to_string(),
            total_amount: self.total,
            outstanding_amount: self.total,
            bill_data: self.bill_data.lock().clone(),
        }
    }

    fn bill_payment_received(
        &self,
        payment: &BillPayment,
        updated_bill_data: &str,
    ) -> BillStatusResponse {
        self.payments_received.lock().push(payment.terminal_ref_id());
        if self.reject_payments {
            return BillStatusResponse {
                result: BillRetrievalResult::InvalidBillId,
                ..Default::default()
            };
        }
        *self.bill_data.lock() = updated_bill_data.to_string();
        BillStatusResponse {
            result: BillRetrievalResult::Success,
            total_amount: self.total,
            outstanding_amount: self.total - payment.purchase_amount,
            ..Default::default()
        }
    }
}

fn bills(total: i64) -> Arc<Bills> {
    Arc::new(Bills {
        total,
        ..Default::default()
    })
}

fn bill_payment(terminal_ref_id: &str) -> spi_client::spi_protocol::Message {
    terminal_message(
        "bill_payment",
        "bp1",
        json!({
            "bill_id": "b1",
            "table_id": "12",
            "operator_id": "op",
            "payment_type": "card",
            "payment_details": {
                "terminal_ref_id": terminal_ref_id,
                "purchase_amount": 1500,
                "tip_amount": 0,
                "host_response_code": "000",
            },
        }),
    )
}

#[tokio::test]
async fn test_table_config_when_disabled() {
    let (_spi, terminal, secrets) = ready_engine().await;

    terminal.deliver(
        &terminal_message("get_table_config", "tc1", json!({})),
        Some(&secrets),
    );
    settle().await;

    let reply = terminal.last_sent("set_table_config", Some(&secrets)).unwrap();
    assert_eq!(reply.id, "tc1");
    assert!(!reply.data_bool("pay_at_table_enabled", true));
}

#[tokio::test]
async fn test_enable_pushes_config() {
    let (spi, terminal, secrets) = ready_engine().await;

    spi.enable_pay_at_table(bills(0), PayAtTableConfig::default());

    let pushed = terminal.last_sent("set_table_config", Some(&secrets)).unwrap();
    assert!(pushed.data_bool("pay_at_table_enabled", false));
    assert_eq!(pushed.data_string("pay_button_label"), "Pay at Table");
    assert!(spi.pay_at_table_config().is_some());

    spi.disable_pay_at_table();
    assert!(spi.pay_at_table_config().is_none());
}

#[tokio::test]
async fn test_bill_details() {
    let (spi, terminal, secrets) = ready_engine().await;
    spi.enable_pay_at_table(bills(4000), PayAtTableConfig::default());

    terminal.deliver(
        &terminal_message(
            "get_bill_details",
            "gbd1",
            json!({"table_id": "12", "operator_id": "op"}),
        ),
        Some(&secrets),
    );
    settle().await;

    let reply = terminal.last_sent("bill_details", Some(&secrets)).unwrap();
    assert_eq!(reply.id, "gbd1");
    assert!(reply.data_bool("success", false));
    assert_eq!(reply.data_string("bill_id"), "b1");
    assert_eq!(reply.data_int("bill_total_amount"), 4000);
}

#[tokio::test]
async fn test_bill_details_with_zero_total_is_invalid_table() {
    let (spi, terminal, secrets) = ready_engine().await;
    spi.enable_pay_at_table(bills(0), PayAtTableConfig::default());

    terminal.deliver(
        &terminal_message("get_bill_details", "gbd1", json!({"table_id": "12"})),
        Some(&secrets),
    );
    settle().await;

    let reply = terminal.last_sent("bill_details", Some(&secrets)).unwrap();
    assert!(!reply.data_bool("success", true));
    assert_eq!(reply.error_reason(), "INVALID_TABLE_ID");
    assert_eq!(reply.data_string("table_id"), "12");
}

#[tokio::test]
async fn test_bill_payment_recorded_once() {
    let (spi, terminal, secrets) = ready_engine().await;
    let bills = bills(4000);
    spi.enable_pay_at_table(bills.clone(), PayAtTableConfig::default());

    terminal.deliver(&bill_payment("t1"), Some(&secrets));
    settle().await;

    let reply = terminal.last_sent("bill_details", Some(&secrets)).unwrap();
    assert!(reply.data_bool("success", false));
    assert_eq!(reply.data_string("bill_id"), "b1");
    assert_eq!(reply.data_int("bill_outstanding_amount"), 2500);
    assert_eq!(*bills.payments_received.lock(), vec!["t1".to_string()]);

    let stored = BillStatusResponse {
        bill_data: bills.bill_data.lock().clone(),
        ..Default::default()
    };
    let history = stored.bill_payment_history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].terminal_ref_id(), Some("t1"));

    // The terminal repeats the advice; the POS must not see it twice.
    terminal.clear_sent();
    terminal.deliver(&bill_payment("t1"), Some(&secrets));
    settle().await;

    assert_eq!(bills.payments_received.lock().len(), 1);
    let reply = terminal.last_sent("bill_details", Some(&secrets)).unwrap();
    assert!(reply.data_bool("success", false));
}

#[tokio::test]
async fn test_bill_payment_rejected_by_pos_keeps_old_history() {
    let (spi, terminal, secrets) = ready_engine().await;
    let bills = Arc::new(Bills {
        total: 4000,
        reject_payments: true,
        ..Default::default()
    });
    spi.enable_pay_at_table(bills.clone(), PayAtTableConfig::default());

    terminal.deliver(&bill_payment("t1"), Some(&secrets));
    settle().await;

    let reply = terminal.last_sent("bill_details", Some(&secrets)).unwrap();
    assert!(!reply.data_bool("success", true));
    assert_eq!(reply.data_string("bill_id"), "b1");
    assert_eq!(reply.data_string("table_id"), "12");
    assert!(bills.bill_data.lock().is_empty());
}

#[tokio::test]
async fn test_bill_payment_for_unknown_bill() {
    let (spi, terminal, secrets) = ready_engine().await;
    let bills = bills(4000);
    spi.enable_pay_at_table(bills.clone(), PayAtTableConfig::default());

    let mut advice = bill_payment("t1");
    advice
        .data
        .as_mut()
        .unwrap()
        .insert("bill_id".to_string(), json!("b9"));
    terminal.deliver(&advice, Some(&secrets));
    settle().await;

    let reply = terminal.last_sent("bill_details", Some(&secrets)).unwrap();
    assert_eq!(reply.error_reason(), "INVALID_BILL_ID");
    assert!(bills.payments_received.lock().is_empty());
}
