//! Per-transaction state.
//!
//! A [`TransactionFlowState`] tracks one transaction from initiation to
//! completion. The engine keeps exactly one slot, overwritten by the next
//! transaction; subscribers receive clones of it as snapshots.

use spi_protocol::{
    GetLastTransactionResponse, Message, PhoneForAuthRequired, SignatureRequired, SuccessState,
    TransactionResponse,
};
use tokio::time::Instant;

/// Kind of transaction being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Purchase,
    Refund,
    CashoutOnly,
    Moto,
    Settle,
    SettlementEnquiry,
    GetLastTransaction,
    Preauth,
    AccountVerify,
}

/// State of the transaction currently (or most recently) in flight.
#[derive(Debug, Clone)]
pub struct TransactionFlowState {
    /// Caller-assigned correlation id.
    pub pos_ref_id: String,
    pub tx_type: TransactionType,
    /// Operator-facing status line.
    pub display_message: String,
    pub amount_cents: i64,
    /// The request has reached the terminal.
    pub request_sent: bool,
    pub request_time: Option<Instant>,
    /// Last time we heard from the terminal about this transaction.
    pub last_state_request_time: Option<Instant>,
    pub attempting_to_cancel: bool,
    pub cancel_attempt_time: Option<Instant>,
    pub awaiting_signature_check: bool,
    pub awaiting_phone_for_auth: bool,
    pub awaiting_glt_response: bool,
    pub finished: bool,
    pub success: SuccessState,
    /// The terminal's final response, if one was received.
    pub response: Option<Message>,
    pub signature_required_message: Option<SignatureRequired>,
    pub phone_for_auth_required_message: Option<PhoneForAuthRequired>,
    /// The request sent (or still to send) to the terminal.
    pub request: Message,
}

/// Whether a last-transaction reply changed the tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GltOutcome {
    Updated,
    StillInProgress,
}

impl TransactionFlowState {
    pub fn new(
        pos_ref_id: impl Into<String>,
        tx_type: TransactionType,
        amount_cents: i64,
        request: Message,
        display_message: impl Into<String>,
    ) -> Self {
        Self {
            pos_ref_id: pos_ref_id.into(),
            tx_type,
            display_message: display_message.into(),
            amount_cents,
            request_sent: false,
            request_time: None,
            last_state_request_time: None,
            attempting_to_cancel: false,
            cancel_attempt_time: None,
            awaiting_signature_check: false,
            awaiting_phone_for_auth: false,
            awaiting_glt_response: false,
            finished: false,
            success: SuccessState::Unknown,
            response: None,
            signature_required_message: None,
            phone_for_auth_required_message: None,
            request,
        }
    }

    pub(crate) fn sent(&mut self, msg: impl Into<String>) {
        let now = Instant::now();
        self.request_sent = true;
        self.request_time = Some(now);
        self.last_state_request_time = Some(now);
        self.display_message = msg.into();
    }

    pub(crate) fn cancelling(&mut self, msg: impl Into<String>) {
        self.attempting_to_cancel = true;
        self.cancel_attempt_time = Some(Instant::now());
        self.display_message = msg.into();
    }

    pub(crate) fn calling_glt(&mut self) {
        self.awaiting_glt_response = true;
        self.last_state_request_time = Some(Instant::now());
    }

    pub(crate) fn got_glt_response(&mut self) {
        self.awaiting_glt_response = false;
    }

    pub(crate) fn failed(&mut self, response: Option<Message>, msg: impl Into<String>) {
        self.success = SuccessState::Failed;
        self.finished = true;
        self.response = response;
        self.display_message = msg.into();
    }

    pub(crate) fn signature_required(
        &mut self,
        spi_message: SignatureRequired,
        msg: impl Into<String>,
    ) {
        self.signature_required_message = Some(spi_message);
        self.awaiting_signature_check = true;
        self.display_message = msg.into();
    }

    pub(crate) fn signature_responded(&mut self, msg: impl Into<String>) {
        self.awaiting_signature_check = false;
        self.display_message = msg.into();
    }

    pub(crate) fn phone_for_auth_required(
        &mut self,
        spi_message: PhoneForAuthRequired,
        msg: impl Into<String>,
    ) {
        self.phone_for_auth_required_message = Some(spi_message);
        self.awaiting_phone_for_auth = true;
        self.display_message = msg.into();
    }

    pub(crate) fn auth_code_sent(&mut self, msg: impl Into<String>) {
        self.awaiting_phone_for_auth = false;
        self.display_message = msg.into();
    }

    pub(crate) fn completed(
        &mut self,
        state: SuccessState,
        response: Message,
        msg: impl Into<String>,
    ) {
        self.success = state;
        self.response = Some(response);
        self.finished = true;
        self.clear_pending();
        self.display_message = msg.into();
    }

    pub(crate) fn unknown_completed(&mut self, msg: impl Into<String>) {
        self.success = SuccessState::Unknown;
        self.response = None;
        self.finished = true;
        self.clear_pending();
        self.display_message = msg.into();
    }

    fn clear_pending(&mut self) {
        self.attempting_to_cancel = false;
        self.awaiting_glt_response = false;
        self.awaiting_signature_check = false;
        self.awaiting_phone_for_auth = false;
    }

    /// Reconciles this transaction against a last-transaction reply.
    ///
    /// A reply for a different `pos_ref_id` completes the transaction as
    /// `Unknown`; the operator has to check the terminal.
    pub(crate) fn apply_glt_response(&mut self, message: Message) -> GltOutcome {
        self.got_glt_response();
        let mut glt = GetLastTransactionResponse::new(message);

        if !glt.was_retrieved_successfully() {
            if glt.is_still_in_progress(&self.pos_ref_id) {
                if glt.is_waiting_for_signature_response() && !self.awaiting_signature_check {
                    let prompt = SignatureRequired::new(
                        self.pos_ref_id.clone(),
                        glt.request_id(),
                        "MISSING RECEIPT\n DECLINE AND TRY AGAIN.",
                    );
                    self.signature_required(
                        prompt,
                        "Recovered in Signature Required but we don't have receipt. You may Decline then Retry.",
                    );
                    return GltOutcome::Updated;
                }
                if glt.is_waiting_for_auth_code() && !self.awaiting_phone_for_auth {
                    let prompt = PhoneForAuthRequired::new(
                        self.pos_ref_id.clone(),
                        glt.request_id(),
                        "UNKNOWN",
                        "UNKNOWN",
                    );
                    self.phone_for_auth_required(
                        prompt,
                        "Recovered mid Phone-For-Auth but don't have details. You may Cancel then Retry.",
                    );
                    return GltOutcome::Updated;
                }
                return GltOutcome::StillInProgress;
            }

            self.unknown_completed(
                "Unexpected Error when recovering Transaction Status. Check EFTPOS. ",
            );
            return GltOutcome::Updated;
        }

        if self.tx_type == TransactionType::GetLastTransaction {
            glt.copy_merchant_receipt_to_customer_receipt();
            let state = glt.success_state();
            self.completed(state, glt.into_message(), "Last Transaction Retrieved");
            return GltOutcome::Updated;
        }

        match glt_match(&glt, &self.pos_ref_id) {
            SuccessState::Unknown => {
                self.unknown_completed("Failed to recover Transaction Status. Check EFTPOS. ");
            }
            state => {
                glt.copy_merchant_receipt_to_customer_receipt();
                self.completed(state, glt.into_message(), "Transaction Ended.");
            }
        }
        GltOutcome::Updated
    }
}

/// Outcome of `response` for the transaction `pos_ref_id`.
///
/// `Unknown` unless the reply is about that very transaction.
pub fn glt_match(response: &GetLastTransactionResponse, pos_ref_id: &str) -> SuccessState {
    let reported = response.pos_ref_id();
    tracing::info!(expected = %pos_ref_id, reported = %reported, "Matching last transaction");
    if reported != pos_ref_id {
        return SuccessState::Unknown;
    }
    response.success_state()
}

/// Answer to an `initiate_*` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateTxResult {
    pub initiated: bool,
    pub message: String,
}

impl InitiateTxResult {
    pub(crate) fn initiated(message: impl Into<String>) -> Self {
        Self {
            initiated: true,
            message: message.into(),
        }
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self {
            initiated: false,
            message: message.into(),
        }
    }
}

/// Answer to a call made in the middle of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidTxResult {
    pub valid: bool,
    pub message: String,
}

impl MidTxResult {
    pub(crate) fn new(valid: bool, message: impl Into<String>) -> Self {
        Self {
            valid,
            message: message.into(),
        }
    }
}

/// Answer to [`Spi::submit_auth_code`](crate::Spi::submit_auth_code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAuthCodeResult {
    pub valid_format: bool,
    pub message: String,
}

impl SubmitAuthCodeResult {
    pub(crate) fn new(valid_format: bool, message: impl Into<String>) -> Self {
        Self {
            valid_format,
            message: message.into(),
        }
    }
}
