//! Pairing, unpairing and key rolling.
//!
//! Pairing runs over a plaintext connection:
//!
//! ```text
//! POS                         EFTPOS
//!  │ ── pair_request ──────────▶ │
//!  │ ◀───────────── key_request  │
//!  │ ── key_response ──────────▶ │   both sides now hold the secrets
//!  │ ◀─────────────── key_check  │   confirmation code shown on both
//!  │ ◀─────────── pair_response  │   EFTPOS operator confirmed
//! ```
//!
//! The POS operator confirms the code too, via
//! [`Spi::pairing_confirm_code`]. Pairing succeeds once both sides have
//! confirmed, in either order.

use std::sync::Arc;

use spi_protocol::{
    generate_secrets_and_key_response, perform_key_rolling, DropKeysRequest, KeyCheck, KeyRequest,
    Message, PairResponse,
};
use tracing::{error, info, warn};

use crate::spi::{EngineState, Spi, SpiEvent, SpiFlow, SpiStatus};

/// Progress of a pairing attempt, as shown to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingFlowState {
    pub message: String,
    /// Waiting for the terminal's `pair_response`.
    pub awaiting_check_from_eftpos: bool,
    /// Waiting for [`Spi::pairing_confirm_code`].
    pub awaiting_check_from_pos: bool,
    pub confirmation_code: String,
    pub finished: bool,
    pub successful: bool,
}

impl Spi {
    /// Starts pairing with the configured terminal.
    ///
    /// Returns false, doing nothing, when already paired or when the POS id
    /// or terminal address is blank.
    pub fn pair(&self) -> bool {
        let started = self.mutate(|state, events| {
            if state.status != SpiStatus::Unpaired {
                warn!("Tried to Pair but we're already so.");
                return false;
            }
            if state.stamp.pos_id.trim().is_empty() || state.eftpos_address.trim().is_empty() {
                warn!("Tried to Pair but missing pos_id or eftpos_address");
                return false;
            }

            info!(pos_id = %state.stamp.pos_id, address = %state.eftpos_address, "Pairing");
            state.flow = SpiFlow::Pairing;
            state.pairing = PairingFlowState {
                message: "Connecting...".to_string(),
                ..Default::default()
            };
            events.push(SpiEvent::PairingFlowStateChanged(state.pairing.clone()));
            true
        });

        if started {
            self.connection.connect();
        }
        started
    }

    /// Confirms, on the POS side, that the codes match.
    pub fn pairing_confirm_code(&self) {
        self.mutate(|state, events| {
            if !state.pairing.awaiting_check_from_pos {
                info!("Asked to confirm code but was not waiting for POS to confirm");
                return;
            }

            state.pairing.awaiting_check_from_pos = false;
            if state.pairing.awaiting_check_from_eftpos {
                state.pairing.message = format!(
                    "Click YES on EFTPOS if code is: {}",
                    state.pairing.confirmation_code
                );
                events.push(SpiEvent::PairingFlowStateChanged(state.pairing.clone()));
            } else {
                info!(
                    "Pair Code Confirmed from POS side, and was already confirmed from EFTPOS side. Pairing finalised."
                );
                self.on_pairing_success(state, events);
                self.ready_to_transact(state, events);
            }
        });
    }

    /// Abandons the current pairing attempt.
    pub fn pairing_cancel(&self) {
        self.mutate(|state, events| {
            if state.flow != SpiFlow::Pairing || state.pairing.finished {
                return;
            }

            if state.pairing.awaiting_check_from_pos && !state.pairing.awaiting_check_from_eftpos {
                // The terminal already confirmed and holds the keys.
                self.send_message(&state.stamp, &DropKeysRequest.to_message());
            }
            self.on_pairing_failed(state, events);
        });
    }

    /// Unpairs from the terminal, telling it to drop its keys.
    ///
    /// Only allowed while paired and idle.
    pub fn unpair(&self) -> bool {
        self.mutate(|state, events| {
            if state.status == SpiStatus::Unpaired || state.flow != SpiFlow::Idle {
                return false;
            }

            self.send_message(&state.stamp, &DropKeysRequest.to_message());
            self.do_unpair(state, events);
            true
        })
    }

    // ------------------------------------------------------------------------
    // Terminal messages
    // ------------------------------------------------------------------------

    pub(crate) fn handle_key_request(&self, message: &Message) {
        self.mutate(|state, events| {
            if state.flow != SpiFlow::Pairing || state.pairing.finished {
                info!("Received key request but not pairing, ignoring");
                return;
            }

            state.pairing.message = "Negotiating Pairing...".to_string();
            events.push(SpiEvent::PairingFlowStateChanged(state.pairing.clone()));

            let negotiated = KeyRequest::from_message(message)
                .and_then(|request| generate_secrets_and_key_response(&request));
            match negotiated {
                Ok(result) => {
                    // Key response goes out in the clear; everything after it is encrypted.
                    state.stamp.secrets = Some(result.secrets);
                    self.send_message(&state.stamp, &result.key_response.to_message());
                }
                Err(e) => {
                    error!(error = %e, "Failed to negotiate keys");
                    self.fail_pairing(state, events, "Pairing Failed");
                }
            }
        });
    }

    pub(crate) fn handle_key_check(&self, message: &Message) {
        let key_check = KeyCheck::from_message(message);
        self.mutate(|state, events| {
            if state.flow != SpiFlow::Pairing || state.pairing.finished {
                info!("Received key check but not pairing, ignoring");
                return;
            }

            info!(code = %key_check.confirmation_code, "Received key check");
            state.pairing.confirmation_code = key_check.confirmation_code;
            state.pairing.awaiting_check_from_eftpos = true;
            state.pairing.awaiting_check_from_pos = true;
            state.pairing.message =
                "Confirm that the following Code is showing on the Terminal".to_string();
            events.push(SpiEvent::PairingFlowStateChanged(state.pairing.clone()));
        });
    }

    pub(crate) fn handle_pair_response(self: &Arc<Self>, message: &Message) {
        let response = PairResponse::from_message(message);
        let succeeded = self.mutate(|state, events| {
            if state.flow != SpiFlow::Pairing || state.pairing.finished {
                info!("Received pair response but not pairing, ignoring");
                return false;
            }

            state.pairing.awaiting_check_from_eftpos = false;
            if !response.success {
                info!("Got Pair Failed from EFTPOS");
                self.on_pairing_failed(state, events);
                return false;
            }

            if state.pairing.awaiting_check_from_pos {
                info!("Got Pair Confirm from EFTPOS, but still waiting for POS confirmation");
                state.pairing.message =
                    "Confirm that the following Code is what the EFTPOS showed".to_string();
                events.push(SpiEvent::PairingFlowStateChanged(state.pairing.clone()));
            } else {
                info!(
                    "Got Pair Confirm from EFTPOS, and already had confirmation from POS. Pairing finalised."
                );
                self.on_pairing_success(state, events);
            }
            true
        });

        if succeeded {
            self.start_periodic_ping();
        }
    }

    pub(crate) fn handle_drop_keys_advice(&self) {
        info!("EFTPOS was unpaired, so I'll unpair as well");
        self.mutate(|state, events| self.do_unpair(state, events));
    }

    /// Rotates to the next secrets. The confirmation is signed with the new
    /// secrets, which is how the terminal sees that the roll took effect.
    pub(crate) fn handle_key_rolling_request(&self, message: &Message) {
        self.mutate(|state, events| {
            let Some(current) = state.stamp.secrets.clone() else {
                warn!("Asked to roll keys but we are not paired");
                return;
            };

            match perform_key_rolling(message, &current) {
                Ok(result) => {
                    state.stamp.secrets = Some(result.new_secrets.clone());
                    self.send_message(&state.stamp, &result.key_rolling_confirmation);
                    info!("Keys rolled");
                    events.push(SpiEvent::SecretsChanged(Some(result.new_secrets)));
                }
                Err(e) => error!(error = %e, "Failed to roll keys"),
            }
        });
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn on_pairing_success(&self, state: &mut EngineState, events: &mut Vec<SpiEvent>) {
        state.pairing.successful = true;
        state.pairing.finished = true;
        state.pairing.message = "Pairing Successful!".to_string();
        state.set_status(SpiStatus::PairedConnected, events);
        events.push(SpiEvent::SecretsChanged(state.stamp.secrets.clone()));
        events.push(SpiEvent::PairingFlowStateChanged(state.pairing.clone()));
    }

    fn on_pairing_failed(&self, state: &mut EngineState, events: &mut Vec<SpiEvent>) {
        self.fail_pairing(state, events, "Pairing Failed");
    }

    /// Ends the pairing attempt unsuccessfully, dropping any negotiated keys.
    pub(crate) fn fail_pairing(
        &self,
        state: &mut EngineState,
        events: &mut Vec<SpiEvent>,
        message: &str,
    ) {
        state.stamp.secrets = None;
        self.connection.disconnect();

        state.set_status(SpiStatus::Unpaired, events);
        state.pairing.message = message.to_string();
        state.pairing.finished = true;
        state.pairing.successful = false;
        state.pairing.awaiting_check_from_pos = false;
        events.push(SpiEvent::PairingFlowStateChanged(state.pairing.clone()));
    }

    fn do_unpair(&self, state: &mut EngineState, events: &mut Vec<SpiEvent>) {
        state.set_status(SpiStatus::Unpaired, events);
        self.connection.disconnect();
        state.stamp.secrets = None;
        events.push(SpiEvent::SecretsChanged(None));
    }
}
