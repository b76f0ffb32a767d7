//! Inbound client message dispatch.

use serde_json::Value;

use super::protocol::ServerMessage;

/// What the session should do with an inbound text message.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    /// Send this message back to the sender only.
    Reply(ServerMessage),
    /// Fan this message out to every other subscriber.
    Relay(ServerMessage),
    /// Nothing to send.
    Ignore,
}

/// Decide how to answer one inbound text frame.
///
/// `{"type":"ping"}` gets a pong. Any other JSON value is wrapped as a
/// `client_message` for relay when `relay_enabled`, otherwise ignored.
/// Text that is not JSON is returned as an error for the caller to log.
pub fn dispatch_text(
    text: &str,
    from: &str,
    relay_enabled: bool,
) -> Result<Dispatch, serde_json::Error> {
    let message: Value = serde_json::from_str(text)?;

    if message.get("type").and_then(Value::as_str) == Some("ping") {
        return Ok(Dispatch::Reply(ServerMessage::pong()));
    }

    if relay_enabled {
        Ok(Dispatch::Relay(ServerMessage::client_message(from, message)))
    } else {
        Ok(Dispatch::Ignore)
    }
}
