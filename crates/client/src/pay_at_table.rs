//! Pay-at-table.
//!
//! The terminal asks the POS for bills and advises payments made against
//! them. The POS answers through a [`PayAtTableHandler`]. Bill payment
//! history lives in the opaque `bill_data` string, which the POS stores and
//! hands back unchanged; it is what lets a repeated payment advice be
//! recognised and acknowledged without being applied twice.

use std::sync::Arc;

use spi_protocol::{
    next_request_id, BillDetailsRequest, BillPayment, BillRetrievalResult, BillStatusResponse,
    Message, PayAtTableConfig,
};
use tracing::{info, warn};

use crate::spi::Spi;

/// POS callbacks for pay-at-table. Called from the dispatcher task without
/// any engine lock held.
pub trait PayAtTableHandler: Send + Sync {
    /// Looks up a bill. `bill_id` is `None` when the terminal only knows the
    /// table.
    fn bill_status(&self, bill_id: Option<&str>, table_id: &str, operator_id: &str)
        -> BillStatusResponse;

    /// Records a payment. `updated_bill_data` already includes it and must be
    /// stored as the bill's new `bill_data` on success.
    fn bill_payment_received(
        &self,
        payment: &BillPayment,
        updated_bill_data: &str,
    ) -> BillStatusResponse;
}

#[derive(Clone)]
pub(crate) struct PayAtTable {
    pub(crate) handler: Arc<dyn PayAtTableHandler>,
    pub(crate) config: PayAtTableConfig,
}

impl Spi {
    /// Turns pay-at-table on. The configuration is pushed to the terminal
    /// now if connected, and again whenever it becomes ready.
    pub fn enable_pay_at_table(
        &self,
        handler: Arc<dyn PayAtTableHandler>,
        config: PayAtTableConfig,
    ) {
        self.state.lock().pay_at_table = Some(PayAtTable { handler, config });
        self.push_pay_at_table_config();
    }

    pub fn disable_pay_at_table(&self) {
        self.state.lock().pay_at_table = None;
        info!("Pay at table disabled");
    }

    pub fn pay_at_table_config(&self) -> Option<PayAtTableConfig> {
        self.state
            .lock()
            .pay_at_table
            .as_ref()
            .map(|pat| pat.config.clone())
    }

    /// Sends the current configuration to the terminal.
    pub fn push_pay_at_table_config(&self) -> bool {
        let state = self.state.lock();
        let Some(pay_at_table) = &state.pay_at_table else {
            return false;
        };
        let message = pay_at_table.config.to_message(&next_request_id("patconf"));
        self.send_message(&state.stamp, &message)
    }

    fn pay_at_table_handler(&self) -> Option<Arc<dyn PayAtTableHandler>> {
        self.state
            .lock()
            .pay_at_table
            .as_ref()
            .map(|pat| Arc::clone(&pat.handler))
    }

    fn send_bill(&self, bill: &BillStatusResponse, reply_to: &str) {
        match bill.to_message(reply_to) {
            Ok(message) => {
                let state = self.state.lock();
                self.send_message(&state.stamp, &message);
            }
            Err(e) => warn!(error = %e, bill_id = %bill.bill_id, "Failed to encode bill"),
        }
    }

    pub(crate) fn handle_get_table_config(&self, message: &Message) {
        let state = self.state.lock();
        let reply = match &state.pay_at_table {
            Some(pay_at_table) => pay_at_table.config.to_message(&message.id),
            None => PayAtTableConfig::feature_disable_message(&message.id),
        };
        self.send_message(&state.stamp, &reply);
    }

    pub(crate) fn handle_get_bill_details(&self, message: &Message) {
        let Some(handler) = self.pay_at_table_handler() else {
            info!("Received bill details request but pay at table is disabled");
            return;
        };

        let request = BillDetailsRequest::from_message(message);
        let mut bill = handler.bill_status(None, &request.table_id, &request.operator_id);
        bill.table_id = request.table_id;
        if bill.total_amount <= 0 {
            info!("Table has 0 total amount. not sending it to eftpos.");
            bill.result = BillRetrievalResult::InvalidTableId;
        }

        self.send_bill(&bill, &request.request_id);
    }

    pub(crate) fn handle_bill_payment(&self, message: &Message) {
        let Some(handler) = self.pay_at_table_handler() else {
            info!("Received bill payment but pay at table is disabled");
            return;
        };

        let payment = BillPayment::from_message(message);
        let existing = handler.bill_status(
            Some(&payment.bill_id),
            &payment.table_id,
            &payment.operator_id,
        );
        if existing.result != BillRetrievalResult::Success {
            warn!(
                bill_id = %payment.bill_id,
                result = existing.result.as_str(),
                "Could not retrieve Bill Status for Payment Advice. Sending Error to Eftpos."
            );
            self.send_bill(&existing, &message.id);
            return;
        }

        let mut history = existing.bill_payment_history().unwrap_or_else(|e| {
            warn!(error = %e, bill_id = %payment.bill_id, "Stored bill data is corrupt, treating it as empty");
            Vec::new()
        });

        let terminal_ref_id = payment.terminal_ref_id();
        if history
            .iter()
            .any(|entry| entry.terminal_ref_id() == Some(terminal_ref_id.as_str()))
        {
            warn!(
                terminal_ref_id = %terminal_ref_id,
                "Had already received this bill_payment advice from eftpos. Ignoring."
            );
            self.send_bill(&existing, &message.id);
            return;
        }

        history.push(payment.to_history_entry());
        let updated_bill_data = match BillStatusResponse::to_bill_data(&history) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, bill_id = %payment.bill_id, "Failed to encode bill data");
                return;
            }
        };

        let mut updated = handler.bill_payment_received(&payment, &updated_bill_data);
        updated.bill_id = payment.bill_id.clone();
        updated.table_id = payment.table_id.clone();

        if updated.result != BillRetrievalResult::Success {
            warn!(
                bill_id = %payment.bill_id,
                "POS Errored when being Advised of Payment. Letting EFTPOS know, and sending existing bill data."
            );
            updated.bill_data = existing.bill_data;
        } else {
            updated.bill_data = updated_bill_data;
        }

        self.send_bill(&updated, &message.id);
    }
}
