//! Transaction watchdog.
//!
//! Once a second the engine looks at the in-flight transaction. A cancel the
//! terminal has not answered within [`MAX_WAIT_FOR_CANCEL_TX`] ends the
//! transaction as unknown. A request with no news for
//! [`CHECK_ON_TX_FREQUENCY`] is checked with a get-last-transaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::spi::{EngineState, Spi, SpiEvent};

pub const TX_MONITOR_CHECK_FREQUENCY: Duration = Duration::from_secs(1);
pub const CHECK_ON_TX_FREQUENCY: Duration = Duration::from_secs(20);
pub const MAX_WAIT_FOR_CANCEL_TX: Duration = Duration::from_secs(10);

impl Spi {
    pub(crate) fn spawn_transaction_monitor(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TX_MONITOR_CHECK_FREQUENCY);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.mutate(|state, events| {
                            engine.check_on_transaction(state, events, Instant::now())
                        });
                    }
                }
            }
            debug!("Transaction monitor stopped");
        });
    }

    pub(crate) fn check_on_transaction(
        &self,
        state: &mut EngineState,
        events: &mut Vec<SpiEvent>,
        now: Instant,
    ) {
        let Some((tx, stamp)) = state.active_tx() else {
            return;
        };

        let cancel_expired = tx.attempting_to_cancel
            && tx
                .cancel_attempt_time
                .is_some_and(|at| now.saturating_duration_since(at) > MAX_WAIT_FOR_CANCEL_TX);
        if cancel_expired {
            warn!(pos_ref_id = %tx.pos_ref_id, "Cancel attempt timed out");
            tx.unknown_completed(
                "Waited long enough for Cancel Transaction result. Check EFTPOS. ",
            );
            events.push(SpiEvent::TxFlowStateChanged(tx.clone()));
            return;
        }

        let stale = tx.request_sent
            && tx
                .last_state_request_time
                .is_some_and(|at| now.saturating_duration_since(at) > CHECK_ON_TX_FREQUENCY);
        if stale {
            info!(pos_ref_id = %tx.pos_ref_id, "Checking on our transaction. Last we asked was a while ago");
            tx.calling_glt();
            self.call_get_last_transaction(stamp);
        }
    }
}
