//! The SPI engine.
//!
//! [`Spi`] owns the connection to one terminal and drives everything on top
//! of it: pairing, transactions, keepalive and recovery. All engine state
//! lives in a single [`EngineState`] behind one mutex. Handlers mutate it
//! through [`Spi::mutate`], which collects [`SpiEvent`]s while the lock is
//! held and broadcasts them only after it is released, so subscribers may
//! call straight back into the engine.
//!
//! Background work runs as tokio tasks:
//! - the dispatcher, draining [`ConnectionEvent`]s
//! - the transaction monitor (see [`crate::monitor`])
//! - the ping loop, one per live connection (see [`crate::keepalive`])
//! - delayed reconnect attempts
//!
//! All of them stop when [`Spi::shutdown`] is called.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spi_protocol::{
    format_cents, next_request_id, AuthCodeAdvice, CancelTransactionRequest,
    CashoutOnlyRequest, GetLastTransactionRequest, GetLastTransactionResponse, InboundEvent,
    Message, MessageStamp, MotoPurchaseRequest, PairRequest, ParseOutcome, PhoneForAuthRequired,
    PurchaseRequest, ReceiptOptions, RefundRequest, Secrets, SettleRequest,
    SettlementEnquiryRequest, SignatureAccept, SignatureDecline, SignatureRequired, SuccessState,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionEvent, ConnectionState, WebSocketConnection};
use crate::keepalive::KeepAlive;
use crate::pairing::PairingFlowState;
use crate::pay_at_table::PayAtTable;
use crate::transaction::{
    glt_match, GltOutcome, InitiateTxResult, MidTxResult, SubmitAuthCodeResult,
    TransactionFlowState, TransactionType,
};

/// Delay before reconnecting after losing a paired connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the broadcast channel for engine events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Length of a phone authorisation code.
const AUTH_CODE_LENGTH: usize = 6;

/// Pairing status of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiStatus {
    /// No secrets.
    Unpaired,
    /// Secrets held, terminal not reachable yet.
    PairedConnecting,
    /// Secrets held and the terminal answers.
    PairedConnected,
}

/// Top-level mode. Only one flow runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiFlow {
    Idle,
    Pairing,
    Transaction,
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum SpiEvent {
    /// Overall status changed.
    StatusChanged(SpiStatus),
    /// The transport changed state.
    ConnectionStateChanged(ConnectionState),
    /// Snapshot of the pairing flow after a change.
    PairingFlowStateChanged(PairingFlowState),
    /// Snapshot of the current transaction after a change.
    TxFlowStateChanged(TransactionFlowState),
    /// Secrets were set, rotated or dropped. Persist them to survive restarts.
    SecretsChanged(Option<Secrets>),
}

/// How a final response is tied to the transaction in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseMatch {
    /// The response carries the transaction's `pos_ref_id`.
    PosRefId,
    /// Settlement responses carry no `pos_ref_id`; only the kind is checked.
    TxType(TransactionType),
}

impl ResponseMatch {
    fn accepts(self, tx: &TransactionFlowState, incoming_pos_ref_id: &str) -> bool {
        match self {
            Self::PosRefId => tx.pos_ref_id == incoming_pos_ref_id,
            Self::TxType(tx_type) => tx.tx_type == tx_type,
        }
    }
}

/// Everything the engine mutates, guarded by one lock.
pub(crate) struct EngineState {
    pub(crate) eftpos_address: String,
    pub(crate) status: SpiStatus,
    pub(crate) flow: SpiFlow,
    pub(crate) pairing: PairingFlowState,
    pub(crate) tx: Option<TransactionFlowState>,
    /// Holds the POS id, the active secrets and the server time delta.
    pub(crate) stamp: MessageStamp,
    pub(crate) receipt_options: ReceiptOptions,
    pub(crate) pay_at_table: Option<PayAtTable>,
}

impl EngineState {
    pub(crate) fn set_status(&mut self, status: SpiStatus, events: &mut Vec<SpiEvent>) {
        if self.status == status {
            return;
        }
        info!(from = ?self.status, to = ?status, "Status changed");
        self.status = status;
        events.push(SpiEvent::StatusChanged(status));
    }

    /// The unfinished transaction, together with the stamp to send with.
    pub(crate) fn active_tx(&mut self) -> Option<(&mut TransactionFlowState, &MessageStamp)> {
        if self.flow != SpiFlow::Transaction {
            return None;
        }
        match self.tx.as_mut() {
            Some(tx) if !tx.finished => Some((tx, &self.stamp)),
            _ => None,
        }
    }
}

/// POS-side engine for one EFTPOS terminal.
pub struct Spi {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) keepalive: Mutex<KeepAlive>,
    event_tx: broadcast::Sender<SpiEvent>,
    pub(crate) shutdown: CancellationToken,
}

impl Spi {
    /// Creates an engine over `connection`.
    ///
    /// With `secrets` the engine starts as `PairedConnecting` and connects on
    /// [`start`](Self::start); without them it waits for [`pair`](Self::pair).
    pub fn new(
        pos_id: impl Into<String>,
        eftpos_address: impl Into<String>,
        secrets: Option<Secrets>,
        connection: Arc<dyn Connection>,
    ) -> Arc<Self> {
        let eftpos_address = eftpos_address.into();
        connection.set_address(&eftpos_address);

        let status = if secrets.is_some() {
            SpiStatus::PairedConnecting
        } else {
            SpiStatus::Unpaired
        };
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            connection,
            state: Mutex::new(EngineState {
                eftpos_address,
                status,
                flow: SpiFlow::Idle,
                pairing: PairingFlowState::default(),
                tx: None,
                stamp: MessageStamp::new(pos_id, secrets),
                receipt_options: ReceiptOptions::default(),
                pay_at_table: None,
            }),
            keepalive: Mutex::new(KeepAlive::default()),
            event_tx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Creates an engine talking WebSocket to the terminal named in `config`.
    pub fn from_config(config: &Config, secrets: Option<Secrets>) -> Arc<Self> {
        let connection = Arc::new(WebSocketConnection::new(config.pos.eftpos_address.clone()));
        let spi = Self::new(
            config.pos.pos_id.clone(),
            config.pos.eftpos_address.clone(),
            secrets,
            connection,
        );
        spi.set_receipt_options(config.receipt_options());
        spi
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Starts the dispatcher and the transaction monitor, and connects if
    /// already paired. Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let Some(mut connection_events) = self.connection.events() else {
            warn!("Engine already started");
            return;
        };

        let engine = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = connection_events.recv() => match event {
                        Some(event) => engine.handle_connection_event(event),
                        None => break,
                    },
                }
            }
            debug!("Dispatcher stopped");
        });

        self.spawn_transaction_monitor();

        if self.status() != SpiStatus::Unpaired {
            self.connection.connect();
        }
    }

    /// Stops every background task and closes the connection.
    pub fn shutdown(&self) {
        info!("Shutting down SPI engine");
        self.shutdown.cancel();
        self.keepalive.lock().stop();
        self.connection.disconnect();
    }

    /// Returns a receiver for engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SpiEvent> {
        self.event_tx.subscribe()
    }

    pub fn status(&self) -> SpiStatus {
        self.state.lock().status
    }

    pub fn flow(&self) -> SpiFlow {
        self.state.lock().flow
    }

    pub fn pairing_flow_state(&self) -> PairingFlowState {
        self.state.lock().pairing.clone()
    }

    pub fn tx_flow_state(&self) -> Option<TransactionFlowState> {
        self.state.lock().tx.clone()
    }

    pub fn secrets(&self) -> Option<Secrets> {
        self.state.lock().stamp.secrets.clone()
    }

    pub fn pos_id(&self) -> String {
        self.state.lock().stamp.pos_id.clone()
    }

    pub fn eftpos_address(&self) -> String {
        self.state.lock().eftpos_address.clone()
    }

    pub fn receipt_options(&self) -> ReceiptOptions {
        self.state.lock().receipt_options
    }

    pub fn set_receipt_options(&self, options: ReceiptOptions) {
        self.state.lock().receipt_options = options;
    }

    /// Changes the POS id. Only allowed while unpaired.
    pub fn set_pos_id(&self, pos_id: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.status != SpiStatus::Unpaired {
            warn!("Cannot change pos_id while paired");
            return false;
        }
        state.stamp.pos_id = pos_id.into();
        true
    }

    /// Changes the terminal address. Refused while connected to a paired
    /// terminal; takes effect on the next connect.
    pub fn set_eftpos_address(&self, address: impl Into<String>) -> bool {
        let address = address.into();
        let mut state = self.state.lock();
        if state.status == SpiStatus::PairedConnected {
            warn!("Cannot change eftpos_address while connected");
            return false;
        }
        self.connection.set_address(&address);
        state.eftpos_address = address;
        true
    }

    /// Returns to `Idle` once the current pairing or transaction has
    /// finished. Returns false while it is still running.
    pub fn ack_flow_ended_and_back_to_idle(&self) -> bool {
        let mut state = self.state.lock();
        let finished = match state.flow {
            SpiFlow::Idle => return true,
            SpiFlow::Pairing => state.pairing.finished,
            SpiFlow::Transaction => state.tx.as_ref().is_some_and(|tx| tx.finished),
        };
        if finished {
            state.flow = SpiFlow::Idle;
        }
        finished
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Starts a purchase of `amount_cents`.
    pub fn initiate_purchase_tx(&self, pos_ref_id: &str, amount_cents: i64) -> InitiateTxResult {
        let mut request = PurchaseRequest::new(amount_cents, pos_ref_id);
        request.options = self.receipt_options();
        let amount = format_cents(amount_cents);

        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Purchase,
            amount_cents,
            request.to_message(),
            format!("Waiting for EFTPOS connection to make payment request for {amount}"),
        );
        self.initiate_tx(
            tx,
            format!("Asked EFTPOS to accept payment for {amount}"),
            "Purchase Initiated",
        )
    }

    /// Starts a purchase with optional tip, cashout or cashout prompt.
    ///
    /// A tip cannot be combined with cashout.
    pub fn initiate_purchase_tx_v2(
        &self,
        pos_ref_id: &str,
        purchase_amount: i64,
        tip_amount: i64,
        cashout_amount: i64,
        prompt_for_cashout: bool,
    ) -> InitiateTxResult {
        if tip_amount > 0 && (cashout_amount > 0 || prompt_for_cashout) {
            return InitiateTxResult::rejected("Cannot Accept Tips and Cashout at the same time.");
        }

        let mut request = PurchaseRequest::new(purchase_amount, pos_ref_id);
        request.tip_amount = tip_amount;
        request.cashout_amount = cashout_amount;
        request.prompt_for_cashout = prompt_for_cashout;
        request.options = self.receipt_options();
        let summary = request.amount_summary();

        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Purchase,
            purchase_amount,
            request.to_message(),
            format!("Waiting for EFTPOS connection to make payment request. {summary}"),
        );
        self.initiate_tx(
            tx,
            format!("Asked EFTPOS to accept payment for {summary}"),
            "Purchase Initiated",
        )
    }

    pub fn initiate_refund_tx(&self, pos_ref_id: &str, amount_cents: i64) -> InitiateTxResult {
        let mut request = RefundRequest::new(amount_cents, pos_ref_id);
        request.options = self.receipt_options();
        let amount = format_cents(amount_cents);

        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Refund,
            amount_cents,
            request.to_message(),
            format!("Waiting for EFTPOS connection to make refund request for {amount}"),
        );
        self.initiate_tx(tx, format!("Asked EFTPOS to refund {amount}"), "Refund Initiated")
    }

    pub fn initiate_cashout_only_tx(
        &self,
        pos_ref_id: &str,
        amount_cents: i64,
    ) -> InitiateTxResult {
        let mut request = CashoutOnlyRequest::new(amount_cents, pos_ref_id);
        request.options = self.receipt_options();
        let amount = format_cents(amount_cents);

        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::CashoutOnly,
            amount_cents,
            request.to_message(),
            format!("Waiting for EFTPOS connection to send cashout request for {amount}"),
        );
        self.initiate_tx(
            tx,
            format!("Asked EFTPOS to do cashout for {amount}"),
            "Cashout Initiated",
        )
    }

    /// Starts a mail/telephone order purchase.
    pub fn initiate_moto_purchase_tx(
        &self,
        pos_ref_id: &str,
        amount_cents: i64,
    ) -> InitiateTxResult {
        let mut request = MotoPurchaseRequest::new(amount_cents, pos_ref_id);
        request.options = self.receipt_options();
        let amount = format_cents(amount_cents);

        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::Moto,
            amount_cents,
            request.to_message(),
            format!("Waiting for EFTPOS connection to send MOTO request for {amount}"),
        );
        self.initiate_tx(tx, format!("Asked EFTPOS do MOTO for {amount}"), "MOTO Initiated")
    }

    pub fn initiate_settle_tx(&self) -> InitiateTxResult {
        let id = next_request_id("settle");
        let request = SettleRequest::new(id.clone()).to_message();

        let tx = TransactionFlowState::new(
            id,
            TransactionType::Settle,
            0,
            request,
            "Waiting for EFTPOS connection to make a settle request",
        );
        self.initiate_tx(tx, "Asked EFTPOS to settle.", "Settle Initiated")
    }

    pub fn initiate_settlement_enquiry(&self) -> InitiateTxResult {
        let id = next_request_id("stlenq");
        let request = SettlementEnquiryRequest::new(id.clone()).to_message();

        let tx = TransactionFlowState::new(
            id,
            TransactionType::SettlementEnquiry,
            0,
            request,
            "Waiting for EFTPOS connection to make a settlement enquiry",
        );
        self.initiate_tx(
            tx,
            "Asked EFTPOS to make a settlement enquiry.",
            "Settle Initiated",
        )
    }

    /// Asks the terminal for its last transaction, whatever it was.
    pub fn initiate_get_last_tx(&self) -> InitiateTxResult {
        let request = GetLastTransactionRequest.to_message();
        let pos_ref_id = request.id.clone();

        let tx = TransactionFlowState::new(
            pos_ref_id,
            TransactionType::GetLastTransaction,
            0,
            request,
            "Waiting for EFTPOS connection to make a Get-Last-Transaction request.",
        );
        self.initiate_tx(tx, "Asked EFTPOS for last transaction.", "GLT Initiated")
    }

    /// Recovers the outcome of `pos_ref_id` after the POS lost track of it,
    /// e.g. across a restart.
    pub fn initiate_recovery(
        &self,
        pos_ref_id: &str,
        tx_type: TransactionType,
    ) -> InitiateTxResult {
        let request = GetLastTransactionRequest.to_message();

        let tx = TransactionFlowState::new(
            pos_ref_id,
            tx_type,
            0,
            request,
            "Waiting for EFTPOS connection to attempt recovery.",
        );
        self.initiate_tx(tx, "Asked EFTPOS to recover state.", "Recovery Initiated")
    }

    /// Installs `tx` as the current transaction and tries to send its request.
    ///
    /// A request that cannot be sent yet goes out once the terminal is ready.
    pub(crate) fn initiate_tx(
        &self,
        mut tx: TransactionFlowState,
        sent_message: impl Into<String>,
        initiated_message: &str,
    ) -> InitiateTxResult {
        self.mutate(|state, events| {
            if state.status == SpiStatus::Unpaired {
                return InitiateTxResult::rejected("Not Paired");
            }
            if state.flow != SpiFlow::Idle {
                return InitiateTxResult::rejected("Not Idle");
            }

            info!(pos_ref_id = %tx.pos_ref_id, tx_type = ?tx.tx_type, "Initiating transaction");
            state.flow = SpiFlow::Transaction;
            if self.send_message(&state.stamp, &tx.request) {
                tx.sent(sent_message);
            }
            events.push(SpiEvent::TxFlowStateChanged(tx.clone()));
            state.tx = Some(tx);

            InitiateTxResult::initiated(initiated_message)
        })
    }

    /// Tells the terminal whether the customer's signature matched.
    pub fn accept_signature(&self, accepted: bool) -> MidTxResult {
        self.mutate(|state, events| {
            let Some((tx, stamp)) = state.active_tx().filter(|(tx, _)| tx.awaiting_signature_check)
            else {
                info!("Asked to accept signature but I was not waiting for one.");
                return MidTxResult::new(
                    false,
                    "Asked to accept signature but I was not waiting for one.",
                );
            };

            let pos_ref_id = tx.pos_ref_id.clone();
            let reply = if accepted {
                tx.signature_responded("Accepting Signature...");
                SignatureAccept { pos_ref_id }.to_message()
            } else {
                tx.signature_responded("Declining Signature...");
                SignatureDecline { pos_ref_id }.to_message()
            };
            self.send_message(stamp, &reply);
            events.push(SpiEvent::TxFlowStateChanged(tx.clone()));

            MidTxResult::new(true, "")
        })
    }

    /// Passes on the code the merchant got from the authorisation centre.
    pub fn submit_auth_code(&self, auth_code: &str) -> SubmitAuthCodeResult {
        if auth_code.chars().count() != AUTH_CODE_LENGTH {
            return SubmitAuthCodeResult::new(false, "Not a 6-digit code.");
        }

        self.mutate(|state, events| {
            let Some((tx, stamp)) = state.active_tx().filter(|(tx, _)| tx.awaiting_phone_for_auth)
            else {
                info!("Asked to send auth code but I was not waiting for one.");
                return SubmitAuthCodeResult::new(false, "Was not waiting for one.");
            };

            tx.auth_code_sent(format!("Submitting Auth Code {auth_code}"));
            let advice = AuthCodeAdvice {
                pos_ref_id: tx.pos_ref_id.clone(),
                auth_code: auth_code.to_string(),
            };
            self.send_message(stamp, &advice.to_message());
            events.push(SpiEvent::TxFlowStateChanged(tx.clone()));

            SubmitAuthCodeResult::new(true, "Valid Code.")
        })
    }

    /// Tries to cancel the current transaction.
    ///
    /// A request already sent can only be cancelled by the terminal, and the
    /// outcome arrives like any other response. An unsent one fails locally.
    pub fn cancel_transaction(&self) -> MidTxResult {
        self.mutate(|state, events| {
            let Some((tx, stamp)) = state.active_tx() else {
                info!("Asked to cancel transaction but I was not in the middle of one.");
                return MidTxResult::new(
                    false,
                    "Asked to cancel transaction but I was not in the middle of one.",
                );
            };

            if tx.request_sent {
                tx.cancelling("Attempting to Cancel Transaction...");
                self.send_message(stamp, &CancelTransactionRequest.to_message());
            } else {
                tx.failed(None, "Transaction Cancelled. Request Had not even been sent yet.");
            }
            events.push(SpiEvent::TxFlowStateChanged(tx.clone()));

            MidTxResult::new(true, "")
        })
    }

    /// Outcome of `response` for the transaction `pos_ref_id`.
    pub fn glt_match(
        &self,
        response: &GetLastTransactionResponse,
        pos_ref_id: &str,
    ) -> SuccessState {
        glt_match(response, pos_ref_id)
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => self.on_connection_state_changed(state),
            ConnectionEvent::MessageReceived(text) => self.on_message(&text),
            ConnectionEvent::Error(e) => warn!(error = %e, "Transport error"),
        }
    }

    fn on_connection_state_changed(self: &Arc<Self>, connection_state: ConnectionState) {
        self.publish(vec![SpiEvent::ConnectionStateChanged(connection_state)]);

        match connection_state {
            ConnectionState::Connecting => {
                info!(address = %self.eftpos_address(), "Connecting to EFTPOS");
            }
            ConnectionState::Connected => self.on_connected(),
            ConnectionState::Disconnected => self.on_disconnected(),
        }
    }

    fn on_connected(self: &Arc<Self>) {
        let pairing = self.mutate(|state, events| {
            if state.flow != SpiFlow::Pairing || state.pairing.finished {
                return false;
            }
            state.pairing.message = "Requesting to Pair...".to_string();
            events.push(SpiEvent::PairingFlowStateChanged(state.pairing.clone()));
            self.send_message(&state.stamp, &PairRequest.to_message());
            true
        });

        if !pairing {
            self.start_periodic_ping();
        }
    }

    fn on_disconnected(self: &Arc<Self>) {
        self.keepalive.lock().stop();

        let reconnect = self.mutate(|state, events| {
            if state.status != SpiStatus::Unpaired {
                state.set_status(SpiStatus::PairedConnecting, events);
                if let Some((tx, _)) = state.active_tx() {
                    warn!(
                        pos_ref_id = %tx.pos_ref_id,
                        "Lost connection in the middle of a transaction"
                    );
                }
                return true;
            }

            if state.flow == SpiFlow::Pairing && !state.pairing.finished {
                warn!("Lost connection during pairing");
                self.fail_pairing(
                    state,
                    events,
                    "Could not Connect to Pair. Check Network and Try Again...",
                );
            }
            false
        });

        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            if engine.status() != SpiStatus::Unpaired {
                info!("Will try to reconnect now...");
                engine.connection.connect();
            }
        });
    }

    fn on_message(self: &Arc<Self>, text: &str) {
        let secrets = self.secrets();
        match Message::from_json(text, secrets.as_ref()) {
            ParseOutcome::Parsed(message) => {
                debug!(event = %message.event_name, id = %message.id, "Received message");
                self.dispatch(message);
            }
            ParseOutcome::NoSecrets => {
                info!("Received an encrypted message but I have no secrets; ignoring it");
            }
            ParseOutcome::InvalidSignature => {
                warn!(
                    "I could not verify message from EFTPOS. You might have to Un-pair EFTPOS and then reconnect."
                );
            }
            ParseOutcome::Unparseable(raw) => {
                warn!(length = raw.len(), "Received a message I could not parse");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        match InboundEvent::classify(&message.event_name) {
            InboundEvent::KeyRequest => self.handle_key_request(&message),
            InboundEvent::KeyCheck => self.handle_key_check(&message),
            InboundEvent::PairResponse => self.handle_pair_response(&message),
            InboundEvent::DropKeysAdvice => self.handle_drop_keys_advice(),
            InboundEvent::PurchaseResponse => self.handle_transaction_response(
                message,
                "Purchase Transaction Ended.",
                ResponseMatch::PosRefId,
            ),
            InboundEvent::RefundResponse => self.handle_transaction_response(
                message,
                "Refund Transaction Ended.",
                ResponseMatch::PosRefId,
            ),
            InboundEvent::CashoutOnlyResponse => self.handle_transaction_response(
                message,
                "Cashout Transaction Ended.",
                ResponseMatch::PosRefId,
            ),
            InboundEvent::MotoPurchaseResponse => self.handle_transaction_response(
                message,
                "Moto Transaction Ended.",
                ResponseMatch::PosRefId,
            ),
            InboundEvent::SettleResponse => self.handle_transaction_response(
                message,
                "Settle Transaction Ended.",
                ResponseMatch::TxType(TransactionType::Settle),
            ),
            InboundEvent::SettlementEnquiryResponse => self.handle_transaction_response(
                message,
                "Settlement Enquiry Ended.",
                ResponseMatch::TxType(TransactionType::SettlementEnquiry),
            ),
            InboundEvent::AccountVerifyResponse => self.handle_transaction_response(
                message,
                "Account Verify Transaction Ended.",
                ResponseMatch::PosRefId,
            ),
            InboundEvent::PreauthResponse => self.handle_transaction_response(
                message,
                "Preauth Transaction Ended.",
                ResponseMatch::PosRefId,
            ),
            InboundEvent::SignatureRequired => self.handle_signature_required(&message),
            InboundEvent::AuthCodeRequired => self.handle_auth_code_required(&message),
            InboundEvent::GetLastTransactionResponse => {
                self.handle_get_last_transaction_response(message)
            }
            InboundEvent::Ping => self.handle_incoming_ping(&message),
            InboundEvent::Pong => self.handle_incoming_pong(&message),
            InboundEvent::KeyRollRequest => self.handle_key_rolling_request(&message),
            InboundEvent::GetTableConfig => self.handle_get_table_config(&message),
            InboundEvent::GetBillDetails => self.handle_get_bill_details(&message),
            InboundEvent::BillPayment => self.handle_bill_payment(&message),
            InboundEvent::Error => self.handle_error_event(&message),
            InboundEvent::Unknown(event) => {
                info!(event = %event, "I don't understand event, ignoring it")
            }
        }
    }

    /// Completes the current transaction with a final response, provided the
    /// response belongs to it.
    fn handle_transaction_response(&self, message: Message, ended: &str, matching: ResponseMatch) {
        self.mutate(|state, events| {
            let incoming = message.data_string("pos_ref_id");
            match state.active_tx() {
                Some((tx, _)) if matching.accepts(tx, &incoming) => {
                    info!(event = %message.event_name, pos_ref_id = %tx.pos_ref_id, "Transaction ended");
                    let outcome = message.success_state();
                    tx.completed(outcome, message, ended);
                    events.push(SpiEvent::TxFlowStateChanged(tx.clone()));
                }
                _ => info!(
                    event = %message.event_name,
                    pos_ref_id = %incoming,
                    "Received response but I was not waiting for one. Incorrect pos_ref_id?"
                ),
            }
        });
    }

    fn handle_signature_required(&self, message: &Message) {
        self.mutate(|state, events| {
            let incoming = message.data_string("pos_ref_id");
            match state.active_tx() {
                Some((tx, _)) if tx.pos_ref_id == incoming => {
                    tx.signature_required(
                        SignatureRequired::from_message(message),
                        "Ask Customer to Sign the Receipt",
                    );
                    events.push(SpiEvent::TxFlowStateChanged(tx.clone()));
                }
                _ => info!(
                    pos_ref_id = %incoming,
                    "Received Signature Required but I was not waiting for one. Incorrect pos_ref_id?"
                ),
            }
        });
    }

    fn handle_auth_code_required(&self, message: &Message) {
        self.mutate(|state, events| {
            let incoming = message.data_string("pos_ref_id");
            match state.active_tx() {
                Some((tx, _)) if tx.pos_ref_id == incoming => {
                    let prompt = PhoneForAuthRequired::from_message(message);
                    let display = format!(
                        "Auth Code Required. Call {} and quote merchant id {}",
                        prompt.phone_number(),
                        prompt.merchant_id()
                    );
                    tx.phone_for_auth_required(prompt, display);
                    events.push(SpiEvent::TxFlowStateChanged(tx.clone()));
                }
                _ => info!(
                    pos_ref_id = %incoming,
                    "Received Auth Code Required but I was not waiting for one. Incorrect pos_ref_id?"
                ),
            }
        });
    }

    fn handle_get_last_transaction_response(&self, message: Message) {
        self.mutate(|state, events| {
            let Some((tx, _)) = state.active_tx() else {
                info!("Received last transaction but I was not waiting for one");
                return;
            };

            info!(pos_ref_id = %tx.pos_ref_id, "Got last transaction");
            match tx.apply_glt_response(message) {
                GltOutcome::Updated => events.push(SpiEvent::TxFlowStateChanged(tx.clone())),
                GltOutcome::StillInProgress => {
                    info!(pos_ref_id = %tx.pos_ref_id, "Operation still in progress, staying waiting")
                }
            }
        });
    }

    fn handle_error_event(&self, message: &Message) {
        let reason = message.error_reason();
        self.mutate(|state, _| match state.active_tx() {
            Some((tx, stamp)) if tx.attempting_to_cancel && reason == "NO_TRANSACTION" => {
                info!(
                    pos_ref_id = %tx.pos_ref_id,
                    "Was trying to cancel a transaction but there is nothing to cancel; checking last transaction"
                );
                tx.calling_glt();
                self.call_get_last_transaction(stamp);
            }
            _ => info!(
                reason = %reason,
                detail = %message.error_detail(),
                "Received error event from EFTPOS"
            ),
        });
    }

    /// Marks the terminal usable: flushes a request queued while offline or
    /// reconciles one that was in flight across the disconnect.
    pub(crate) fn on_ready_to_transact(&self) {
        self.mutate(|state, events| self.ready_to_transact(state, events));
    }

    pub(crate) fn ready_to_transact(&self, state: &mut EngineState, events: &mut Vec<SpiEvent>) {
        info!("On ready to transact");
        state.set_status(SpiStatus::PairedConnected, events);

        if let Some((tx, stamp)) = state.active_tx() {
            if tx.request_sent {
                info!(pos_ref_id = %tx.pos_ref_id, "Reconnected mid transaction; checking on it");
                tx.calling_glt();
                self.call_get_last_transaction(stamp);
            } else {
                info!(pos_ref_id = %tx.pos_ref_id, "Sending request queued while offline");
                if self.send_message(stamp, &tx.request) {
                    tx.sent("Sending Request Now...");
                }
                events.push(SpiEvent::TxFlowStateChanged(tx.clone()));
            }
            return;
        }

        if let Some(pay_at_table) = &state.pay_at_table {
            let config = pay_at_table.config.to_message(&next_request_id("patconf"));
            self.send_message(&state.stamp, &config);
        }
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    /// Runs `f` under the state lock, then publishes the events it collected.
    pub(crate) fn mutate<R>(&self, f: impl FnOnce(&mut EngineState, &mut Vec<SpiEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            f(&mut state, &mut events)
        };
        self.publish(events);
        result
    }

    fn publish(&self, events: Vec<SpiEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.event_tx.send(event);
        }
    }

    /// Stamps and sends `message`. Returns whether it left the POS.
    pub(crate) fn send_message(&self, stamp: &MessageStamp, message: &Message) -> bool {
        if self.connection.state() != ConnectionState::Connected {
            debug!(event = %message.event_name, id = %message.id, "Not connected, not sending");
            return false;
        }

        let json = match message.to_json(stamp) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, event = %message.event_name, "Failed to stamp message");
                return false;
            }
        };

        match self.connection.send(&json) {
            Ok(()) => {
                debug!(event = %message.event_name, id = %message.id, "Sent message");
                true
            }
            Err(e) => {
                warn!(error = %e, event = %message.event_name, "Failed to send message");
                false
            }
        }
    }

    pub(crate) fn call_get_last_transaction(&self, stamp: &MessageStamp) -> bool {
        self.send_message(stamp, &GetLastTransactionRequest.to_message())
    }
}

impl std::fmt::Debug for Spi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Spi")
            .field("pos_id", &state.stamp.pos_id)
            .field("eftpos_address", &state.eftpos_address)
            .field("status", &state.status)
            .field("flow", &state.flow)
            .finish()
    }
}
