//! Account verification and preauthorisations.
//!
//! These run as ordinary transactions; only the requests differ. Responses
//! go through the engine's common transaction response handling.

use spi_protocol::{
    format_cents, AccountVerifyRequest, PreauthCancelRequest, PreauthCompletionRequest,
    PreauthExtendRequest, PreauthOpenRequest, PreauthPartialCancellationRequest,
    PreauthTopupRequest,
};

use crate::spi::Spi;
use crate::transaction::{InitiateTxResult, TransactionFlowState, TransactionType};

const PREAUTH_INITIATED: &str = "Preauth Initiated";

impl Spi {
    /// Verifies a card without charging it.
    pub fn initiate_account_verify_tx(&self, pos_ref_id: &str) -> InitiateTxResult {
        let request = AccountVerifyRequest {
            pos_ref_id: pos_ref_id.to_string(),
        };
        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::AccountVerify,
            0,
            request.to_message(),
            "Waiting for EFTPOS connection to make account verify request",
        );
        self.initiate_tx(tx, "Asked EFTPOS to verify account", PREAUTH_INITIATED)
    }

    pub fn initiate_preauth_open_tx(
        &self,
        pos_ref_id: &str,
        amount_cents: i64,
    ) -> InitiateTxResult {
        let request = PreauthOpenRequest {
            pos_ref_id: pos_ref_id.to_string(),
            preauth_amount: amount_cents,
        };
        let amount = format_cents(amount_cents);
        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Preauth,
            amount_cents,
            request.to_message(),
            format!("Waiting for EFTPOS connection to make preauth request for {amount}"),
        );
        self.initiate_tx(
            tx,
            format!("Asked EFTPOS to create preauth for {amount}"),
            PREAUTH_INITIATED,
        )
    }

    pub fn initiate_preauth_topup_tx(
        &self,
        pos_ref_id: &str,
        preauth_id: &str,
        amount_cents: i64,
    ) -> InitiateTxResult {
        let request = PreauthTopupRequest {
            pos_ref_id: pos_ref_id.to_string(),
            preauth_id: preauth_id.to_string(),
            topup_amount: amount_cents,
        };
        let amount = format_cents(amount_cents);
        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Preauth,
            amount_cents,
            request.to_message(),
            format!("Waiting for EFTPOS connection to make preauth topup request for {amount}"),
        );
        self.initiate_tx(
            tx,
            format!("Asked EFTPOS to make preauth topup for {amount}"),
            PREAUTH_INITIATED,
        )
    }

    pub fn initiate_preauth_partial_cancellation_tx(
        &self,
        pos_ref_id: &str,
        preauth_id: &str,
        amount_cents: i64,
    ) -> InitiateTxResult {
        let request = PreauthPartialCancellationRequest {
            pos_ref_id: pos_ref_id.to_string(),
            preauth_id: preauth_id.to_string(),
            partial_cancellation_amount: amount_cents,
        };
        let amount = format_cents(amount_cents);
        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Preauth,
            amount_cents,
            request.to_message(),
            format!(
                "Waiting for EFTPOS connection to make preauth partial cancellation request for {amount}"
            ),
        );
        self.initiate_tx(
            tx,
            format!("Asked EFTPOS to make preauth partial cancellation for {amount}"),
            PREAUTH_INITIATED,
        )
    }

    pub fn initiate_preauth_extend_tx(
        &self,
        pos_ref_id: &str,
        preauth_id: &str,
    ) -> InitiateTxResult {
        let request = PreauthExtendRequest {
            pos_ref_id: pos_ref_id.to_string(),
            preauth_id: preauth_id.to_string(),
        };
        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Preauth,
            0,
            request.to_message(),
            "Waiting for EFTPOS connection to make preauth Extend request",
        );
        self.initiate_tx(tx, "Asked EFTPOS to make preauth Extend request", PREAUTH_INITIATED)
    }

    pub fn initiate_preauth_cancel_tx(
        &self,
        pos_ref_id: &str,
        preauth_id: &str,
    ) -> InitiateTxResult {
        let request = PreauthCancelRequest {
            pos_ref_id: pos_ref_id.to_string(),
            preauth_id: preauth_id.to_string(),
        };
        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Preauth,
            0,
            request.to_message(),
            "Waiting for EFTPOS connection to make preauth cancellation request",
        );
        self.initiate_tx(
            tx,
            "Asked EFTPOS to make preauth cancellation request",
            PREAUTH_INITIATED,
        )
    }

    /// Completes a preauth, charging `amount_cents` against it.
    pub fn initiate_preauth_completion_tx(
        &self,
        pos_ref_id: &str,
        preauth_id: &str,
        amount_cents: i64,
    ) -> InitiateTxResult {
        let request = PreauthCompletionRequest {
            pos_ref_id: pos_ref_id.to_string(),
            preauth_id: preauth_id.to_string(),
            completion_amount: amount_cents,
        };
        let amount = format_cents(amount_cents);
        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Preauth,
            amount_cents,
            request.to_message(),
            format!("Waiting for EFTPOS connection to make preauth completion request for {amount}"),
        );
        self.initiate_tx(
            tx,
            format!("Asked EFTPOS to make preauth completion for {amount}"),
            PREAUTH_INITIATED,
        )
    }
}
