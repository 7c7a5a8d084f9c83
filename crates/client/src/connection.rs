//! Transport to the EFTPOS terminal.
//!
//! A [`Connection`] carries text frames over a persistent duplex channel and
//! reports what happens to it as [`ConnectionEvent`]s:
//! - state changes (`Disconnected` → `Connecting` → `Connected` → `Disconnected`)
//! - inbound text frames
//! - transport errors
//!
//! It knows nothing about SPI messages. Reconnecting is the engine's job.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use spi_protocol::{ProtocolError, Result};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        Message as WsMessage,
    },
};
use tokio_util::sync::CancellationToken;
use url::Url;

/// WebSocket sub-protocol spoken by SPI terminals.
pub const SPI_PROTOCOL: &str = "spi.2.1.0";

/// How long a connection attempt may stay in `Connecting`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// Connection state for the terminal transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel open.
    Disconnected,
    /// Channel is being opened.
    Connecting,
    /// Channel is open and frames can be sent.
    Connected,
}

/// Events emitted by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// A text frame arrived from the terminal.
    MessageReceived(String),
    /// The transport reported a failure.
    Error(String),
}

/// Trait for the terminal transport.
///
/// `connect` and `disconnect` return immediately; their outcome is reported
/// through the event stream. Implementations must be usable from several
/// tasks at once.
pub trait Connection: Send + Sync {
    /// Sets the `host[:port]` used by the next `connect`.
    fn set_address(&self, address: &str);

    /// Starts opening the channel. No-op unless `Disconnected`.
    fn connect(&self);

    /// Closes the channel. Idempotent.
    fn disconnect(&self);

    /// Sends one text frame. Fails unless `Connected`; nothing is queued.
    fn send(&self, text: &str) -> Result<()>;

    /// Returns the current connection state.
    fn state(&self) -> ConnectionState;

    /// Returns the event receiver.
    /// Returns None if the receiver has already been taken.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;
}

/// Builds the terminal URL for a `host[:port]` address.
pub fn ws_url(address: &str) -> Result<Url> {
    Url::parse(&format!("ws://{address}")).map_err(|e| ProtocolError::InvalidField {
        field: "eftpos_address".to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

struct SocketState {
    address: String,
    state: ConnectionState,
    /// Writer half of the live socket task, present only while `Connected`.
    outgoing: Option<mpsc::UnboundedSender<WsMessage>>,
    /// Bumped on every connect and disconnect so a stale socket task cannot
    /// overwrite the state of a newer one.
    generation: u64,
    cancel: Option<CancellationToken>,
}

struct Shared {
    state: Mutex<SocketState>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.event_tx.send(event) {
            tracing::warn!(error = %e, "Failed to send connection event - receiver may be dropped");
        }
    }

    fn mark_connected(&self, generation: u64, outgoing: mpsc::UnboundedSender<WsMessage>) -> bool {
        {
            let mut s = self.state.lock();
            if s.generation != generation || s.state != ConnectionState::Connecting {
                return false;
            }
            s.state = ConnectionState::Connected;
            s.outgoing = Some(outgoing);
        }
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
        true
    }

    fn mark_disconnected(&self, generation: u64) {
        {
            let mut s = self.state.lock();
            if s.generation != generation || s.state == ConnectionState::Disconnected {
                return;
            }
            s.state = ConnectionState::Disconnected;
            s.outgoing = None;
            s.cancel = None;
        }
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
    }
}

/// WebSocket connection to an SPI terminal.
///
/// Must be driven from within a tokio runtime: `connect` spawns the socket
/// task.
pub struct WebSocketConnection {
    shared: Arc<Shared>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl WebSocketConnection {
    /// Creates a disconnected connection for `address` (`host[:port]`).
    pub fn new(address: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SocketState {
                    address: address.into(),
                    state: ConnectionState::Disconnected,
                    outgoing: None,
                    generation: 0,
                    cancel: None,
                }),
                event_tx,
            }),
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Returns the configured terminal address.
    pub fn address(&self) -> String {
        self.shared.state.lock().address.clone()
    }
}

impl Connection for WebSocketConnection {
    fn set_address(&self, address: &str) {
        self.shared.state.lock().address = address.to_string();
    }

    fn connect(&self) {
        let (url, generation, cancel) = {
            let mut s = self.shared.state.lock();
            if s.state != ConnectionState::Disconnected {
                return;
            }
            let url = match ws_url(&s.address) {
                Ok(url) => url,
                Err(e) => {
                    drop(s);
                    tracing::warn!(error = %e, "Terminal address does not form a valid URL");
                    self.shared.emit(ConnectionEvent::Error(e.to_string()));
                    self.shared
                        .emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
                    return;
                }
            };
            s.generation += 1;
            let cancel = CancellationToken::new();
            s.cancel = Some(cancel.clone());
            s.state = ConnectionState::Connecting;
            (url, s.generation, cancel)
        };

        self.shared
            .emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));
        tokio::spawn(run_socket(self.shared.clone(), url, generation, cancel));
    }

    fn disconnect(&self) {
        {
            let mut s = self.shared.state.lock();
            if s.state == ConnectionState::Disconnected {
                return;
            }
            s.generation += 1;
            if let Some(cancel) = s.cancel.take() {
                cancel.cancel();
            }
            s.outgoing = None;
            s.state = ConnectionState::Disconnected;
        }
        self.shared
            .emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
    }

    fn send(&self, text: &str) -> Result<()> {
        let s = self.shared.state.lock();
        match (&s.state, &s.outgoing) {
            (ConnectionState::Connected, Some(tx)) => tx
                .send(WsMessage::Text(text.to_string()))
                .map_err(|e| ProtocolError::SendFailed(format!("socket task has stopped: {e}"))),
            _ => Err(ProtocolError::ConnectionClosed(
                "not connected to terminal".to_string(),
            )),
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.lock().state
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.lock().take()
    }
}

/// Opens the socket and pumps frames until it closes or `cancel` fires.
async fn run_socket(shared: Arc<Shared>, url: Url, generation: u64, cancel: CancellationToken) {
    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            shared.emit(ConnectionEvent::Error(format!("invalid terminal URL: {e}")));
            shared.mark_disconnected(generation);
            return;
        }
    };
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SPI_PROTOCOL));

    tracing::info!(url = %url, "Connecting to terminal");

    let attempt = tokio::select! {
        _ = cancel.cancelled() => return,
        attempt = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)) => attempt,
    };

    let ws_stream = match attempt {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => {
            shared.emit(ConnectionEvent::Error(format!(
                "WebSocket connection failed: {e}"
            )));
            shared.mark_disconnected(generation);
            return;
        }
        Err(_) => {
            tracing::warn!(url = %url, "Terminal did not answer within {:?}", CONNECT_TIMEOUT);
            let err = ProtocolError::Timeout(format!("no answer within {CONNECT_TIMEOUT:?}"));
            shared.emit(ConnectionEvent::Error(err.to_string()));
            shared.mark_disconnected(generation);
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();

    if !shared.mark_connected(generation, outgoing_tx) {
        let _ = ws_sink.close().await;
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_sink.close().await;
                break;
            }
            Some(frame) = outgoing_rx.recv() => {
                if let Err(e) = ws_sink.send(frame).await {
                    shared.emit(ConnectionEvent::Error(format!("failed to send frame: {e}")));
                    break;
                }
            }
            inbound = ws_stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    shared.emit(ConnectionEvent::MessageReceived(text));
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    tracing::debug!("Terminal closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    shared.emit(ConnectionEvent::Error(format!("WebSocket error: {e}")));
                    break;
                }
            },
        }
    }

    shared.mark_disconnected(generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Accepts one socket that speaks `spi.2.1.0` and echoes text frames.
    async fn spawn_echo_terminal() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |request: &Request,
                            mut response: Response|
             -> std::result::Result<Response, ErrorResponse> {
                assert_eq!(
                    request
                        .headers()
                        .get(SEC_WEBSOCKET_PROTOCOL)
                        .and_then(|v| v.to_str().ok()),
                    Some(SPI_PROTOCOL)
                );
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SPI_PROTOCOL));
                Ok(response)
            };
            let mut ws = accept_hdr_async(stream, callback).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_text() {
                    ws.send(frame).await.unwrap();
                }
            }
        });

        address
    }

    #[test]
    fn test_ws_url() {
        assert_eq!(ws_url("10.0.0.5").unwrap().as_str(), "ws://10.0.0.5/");
        assert_eq!(
            ws_url("emulator.local:8080").unwrap().as_str(),
            "ws://emulator.local:8080/"
        );
        assert!(ws_url("bad host").is_err());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let conn = WebSocketConnection::new("127.0.0.1:1");
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let err = conn.send("{}").unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let conn = WebSocketConnection::new("127.0.0.1:1");
        assert!(conn.events().is_some());
        assert!(conn.events().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected_is_silent() {
        let conn = WebSocketConnection::new("127.0.0.1:1");
        let mut rx = conn.events().unwrap();

        conn.disconnect();
        conn.disconnect();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_address_reports_error_then_disconnected() {
        let conn = WebSocketConnection::new("bad host");
        let mut rx = conn.events().unwrap();

        conn.connect();

        assert!(matches!(next_event(&mut rx).await, ConnectionEvent::Error(_)));
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_then_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let conn = WebSocketConnection::new(address);
        let mut rx = conn.events().unwrap();
        conn.connect();

        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Connecting)
        );
        assert!(matches!(next_event(&mut rx).await, ConnectionEvent::Error(_)));
        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_send_receive_disconnect() {
        let address = spawn_echo_terminal().await;
        let conn = WebSocketConnection::new("placeholder");
        conn.set_address(&address);
        assert_eq!(conn.address(), address);
        let mut rx = conn.events().unwrap();

        conn.connect();
        // Second connect while connecting is a no-op.
        conn.connect();

        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Connected)
        );

        conn.send(r#"{"message":{"event":"ping"}}"#).unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::MessageReceived(r#"{"message":{"event":"ping"}}"#.to_string())
        );

        conn.disconnect();
        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::StateChanged(ConnectionState::Disconnected)
        );
        assert!(conn.send("late").is_err());

        // The cancelled socket task must not report a second disconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
