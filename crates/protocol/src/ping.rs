//! Keepalive messages.

use crate::messages::{events, next_request_id, Message};

/// A fresh encrypted `ping`.
pub fn ping_request() -> Message {
    Message::new(next_request_id("ping"), events::PING, None, true)
}

/// The `pong` answering a terminal ping; it reuses the ping's id.
pub fn pong_response(ping: &Message) -> Message {
    Message::new(ping.id.clone(), events::PONG, None, true)
}
