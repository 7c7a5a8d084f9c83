//! Scripted terminal for engine tests.
//!
//! [`FakeTerminal`] implements [`Connection`] in memory. `connect` succeeds
//! at once, everything the engine sends is recorded, and tests inject
//! terminal messages with [`FakeTerminal::deliver`]. State changes are
//! reported through the event channel, never by calling back into the engine.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use spi_client::spi_protocol::messages::into_data;
use spi_client::spi_protocol::{
    Message, MessageStamp, ParseOutcome, ProtocolError, Result, Secrets,
};
use spi_client::{Connection, ConnectionEvent, ConnectionState, Spi};
use tokio::sync::mpsc;

pub const POS_ID: &str = "POS1";
pub const EFTPOS_ADDRESS: &str = "10.0.0.2";

pub struct FakeTerminal {
    state: Mutex<ConnectionState>,
    sent: Mutex<Vec<String>>,
    connects: AtomicUsize,
    refuse_connections: AtomicBool,
    pong_secrets: Mutex<Option<Secrets>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl FakeTerminal {
    pub fn new() -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(ConnectionState::Disconnected),
            sent: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            refuse_connections: AtomicBool::new(false),
            pong_secrets: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Makes later `connect` calls fail.
    pub fn refuse_connections(&self) {
        self.refuse_connections.store(true, Ordering::SeqCst);
    }

    pub fn accept_connections(&self) {
        self.refuse_connections.store(false, Ordering::SeqCst);
    }

    /// Answers every later ping automatically.
    pub fn answer_pings(&self, secrets: &Secrets) {
        *self.pong_secrets.lock() = Some(secrets.clone());
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Simulates the terminal dropping the connection.
    pub fn drop_connection(&self) {
        self.disconnect();
    }

    /// Sends `message` from the terminal, encrypted when `secrets` is given.
    pub fn deliver(&self, message: &Message, secrets: Option<&Secrets>) {
        let stamp = MessageStamp::new("EFTPOS", secrets.cloned());
        let json = message.to_json(&stamp).unwrap();
        self.event_tx
            .send(ConnectionEvent::MessageReceived(json))
            .unwrap();
    }

    pub fn deliver_raw(&self, text: &str) {
        self.event_tx
            .send(ConnectionEvent::MessageReceived(text.to_string()))
            .unwrap();
    }

    /// Everything the engine sent, decoded with `secrets`.
    pub fn sent_messages(&self, secrets: Option<&Secrets>) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .map(|json| match Message::from_json(json, secrets) {
                ParseOutcome::Parsed(message) => message,
                other => panic!("engine sent an unreadable frame: {other:?}"),
            })
            .collect()
    }

    pub fn sent_events(&self, secrets: Option<&Secrets>) -> Vec<String> {
        self.sent_messages(secrets)
            .into_iter()
            .map(|m| m.event_name)
            .collect()
    }

    /// The most recent message sent with `event`.
    pub fn last_sent(&self, event: &str, secrets: Option<&Secrets>) -> Option<Message> {
        self.sent_messages(secrets)
            .into_iter()
            .rev()
            .find(|m| m.event_name == event)
    }

    pub fn count_sent(&self, event: &str, secrets: Option<&Secrets>) -> usize {
        self.sent_events(secrets)
            .iter()
            .filter(|e| e.as_str() == event)
            .count()
    }

    pub fn raw_sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Connection for FakeTerminal {
    fn set_address(&self, _address: &str) {}

    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state != ConnectionState::Disconnected {
            return;
        }

        if self.refuse_connections.load(Ordering::SeqCst) {
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));
            self.emit(ConnectionEvent::Error("connection refused".to_string()));
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
            return;
        }

        *state = ConnectionState::Connected;
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Disconnected {
            return;
        }
        *state = ConnectionState::Disconnected;
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
    }

    fn send(&self, text: &str) -> Result<()> {
        if *self.state.lock() != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed("not connected".to_string()));
        }
        self.sent.lock().push(text.to_string());

        if let Some(secrets) = self.pong_secrets.lock().clone() {
            if let ParseOutcome::Parsed(m) = Message::from_json(text, Some(&secrets)) {
                if m.event_name == "ping" {
                    self.deliver(&Message::new(m.id, "pong", None, true), Some(&secrets));
                }
            }
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.lock().take()
    }
}

/// Builds a terminal message.
pub fn terminal_message(event: &str, id: &str, data: Value) -> Message {
    Message::new(id, event, into_data(data), true)
}

pub fn test_secrets() -> Secrets {
    Secrets::new(
        "11A1162B984FEF626ECC27C659A8B0EEAD5248CA867A6A87BEA72F8A8706109D",
        "40510175845988F13F6162ED8526F0B09F73384467FA855E1E79B44A56562A58",
    )
    .unwrap()
}

/// Lets spawned engine tasks drain their queues without moving the clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// An engine already holding secrets, started against a fresh terminal.
pub async fn paired_engine() -> (Arc<Spi>, Arc<FakeTerminal>, Secrets) {
    let terminal = FakeTerminal::new();
    let secrets = test_secrets();
    let spi = Spi::new(POS_ID, EFTPOS_ADDRESS, Some(secrets.clone()), terminal.clone());
    spi.start();
    settle().await;
    (spi, terminal, secrets)
}

/// Answers the engine's most recent ping, which makes a fresh connection
/// ready to transact.
pub async fn answer_ping(terminal: &FakeTerminal, secrets: &Secrets) {
    let ping = terminal
        .last_sent("ping", Some(secrets))
        .expect("engine should have pinged");
    terminal.deliver(
        &Message::new(ping.id.clone(), "pong", None, true),
        Some(secrets),
    );
    settle().await;
}

/// A paired engine that has seen its first pong.
pub async fn ready_engine() -> (Arc<Spi>, Arc<FakeTerminal>, Secrets) {
    let (spi, terminal, secrets) = paired_engine().await;
    answer_ping(&terminal, &secrets).await;
    (spi, terminal, secrets)
}
