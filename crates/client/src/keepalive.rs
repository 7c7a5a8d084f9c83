//! Ping/pong keepalive.
//!
//! While a paired connection is up the POS pings the terminal every
//! [`PING_FREQUENCY`]. A ping that goes unanswered for [`PONG_TIMEOUT`] counts
//! as missed; [`MISSED_PONGS_TO_DISCONNECT`] misses in a row drop the
//! connection, which then goes through the normal reconnect path. The first
//! pong on a fresh connection is what marks the engine ready to transact.

use std::sync::Arc;
use std::time::Duration;

use spi_protocol::{ping_request, pong_response, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionState;
use crate::spi::{Spi, SpiStatus};

/// Interval between pings.
pub const PING_FREQUENCY: Duration = Duration::from_secs(18);

/// How long to wait for the matching pong.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive missed pongs before the connection is dropped.
pub const MISSED_PONGS_TO_DISCONNECT: u32 = 2;

/// Result of checking for the pong to the most recent ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PongCheck {
    Answered,
    /// Unanswered; carries the consecutive miss count.
    Missed(u32),
}

/// Ping bookkeeping for the current connection.
#[derive(Debug, Default)]
pub(crate) struct KeepAlive {
    most_recent_ping_id: Option<String>,
    most_recent_pong_id: Option<String>,
    missed_pongs: u32,
    ping_task: Option<CancellationToken>,
}

impl KeepAlive {
    pub(crate) fn record_ping(&mut self, id: impl Into<String>) {
        self.most_recent_ping_id = Some(id.into());
    }

    /// Records a pong and clears the miss count. Returns true for the first
    /// pong since the ping loop (re)started.
    pub(crate) fn record_pong(&mut self, id: impl Into<String>) -> bool {
        let first = self.most_recent_pong_id.is_none();
        self.most_recent_pong_id = Some(id.into());
        self.missed_pongs = 0;
        first
    }

    pub(crate) fn check_pong(&mut self) -> PongCheck {
        let answered = match (&self.most_recent_ping_id, &self.most_recent_pong_id) {
            (None, _) => true,
            (Some(ping), Some(pong)) => ping == pong,
            (Some(_), None) => false,
        };

        if answered {
            self.missed_pongs = 0;
            PongCheck::Answered
        } else {
            self.missed_pongs += 1;
            PongCheck::Missed(self.missed_pongs)
        }
    }

    /// Installs the token of a new ping loop, cancelling any previous one,
    /// and resets the bookkeeping.
    pub(crate) fn replace_task(&mut self, token: CancellationToken) {
        self.stop();
        self.ping_task = Some(token);
    }

    pub(crate) fn stop(&mut self) {
        if let Some(token) = self.ping_task.take() {
            token.cancel();
        }
        self.most_recent_ping_id = None;
        self.most_recent_pong_id = None;
        self.missed_pongs = 0;
    }
}

impl Spi {
    /// Starts a fresh ping loop for the current connection.
    pub(crate) fn start_periodic_ping(self: &Arc<Self>) {
        let token = self.shutdown.child_token();
        self.keepalive.lock().replace_task(token.clone());

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_ping_loop(&token).await;
            debug!("Ping loop stopped");
        });
    }

    async fn run_ping_loop(&self, cancel: &CancellationToken) {
        loop {
            if self.connection.state() != ConnectionState::Connected || self.secrets().is_none() {
                break;
            }

            let ping = ping_request();
            self.keepalive.lock().record_ping(ping.id.clone());
            {
                let state = self.state.lock();
                self.send_message(&state.stamp, &ping);
            }

            if !pause(cancel, PONG_TIMEOUT).await {
                break;
            }

            let check = self.keepalive.lock().check_pong();
            match check {
                PongCheck::Answered => {}
                PongCheck::Missed(missed) if missed < MISSED_PONGS_TO_DISCONNECT => {
                    info!(missed, "EFTPOS didn't reply to my ping");
                    continue;
                }
                PongCheck::Missed(missed) => {
                    warn!(missed, "EFTPOS stopped answering pings, disconnecting");
                    self.connection.disconnect();
                    break;
                }
            }

            if !pause(cancel, PING_FREQUENCY - PONG_TIMEOUT).await {
                break;
            }
        }
    }

    pub(crate) fn handle_incoming_ping(&self, message: &Message) {
        let state = self.state.lock();
        self.send_message(&state.stamp, &pong_response(message));
    }

    pub(crate) fn handle_incoming_pong(&self, message: &Message) {
        let first = self.keepalive.lock().record_pong(message.id.clone());

        let status = {
            let mut state = self.state.lock();
            state.stamp.server_time_delta = message.server_time_delta();
            state.status
        };

        if !first {
            return;
        }
        if status == SpiStatus::Unpaired {
            info!("First pong of connection but pairing process not finalised yet");
            return;
        }
        self.on_ready_to_transact();
    }
}

/// Sleeps for `duration`. Returns false if cancelled first.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
