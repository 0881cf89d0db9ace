//! Outbound/inbound message types and the protocol's control messages.

use serde::Serialize;
use serde_json::value::RawValue;

/// A single message in a session's stream. `body` is already-encoded JSON
/// (either produced by the application, or one of the control-message
/// constructors below) so the framer never has to re-parse it.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub body: Box<RawValue>,
}

impl Message {
    pub fn new(id: u64, body: Box<RawValue>) -> Self {
        Self { id, body }
    }

    /// Build a message from any `Serialize` value, for application code and
    /// tests that don't already have pre-encoded JSON on hand.
    pub fn from_value<T: Serialize>(id: u64, value: &T) -> serde_json::Result<Self> {
        let raw = serde_json::value::to_raw_value(value)?;
        Ok(Self { id, body: raw })
    }
}

/// `["c",SID,hostPrefix,8]` — the session-creation greeting sent as the
/// first back-channel message of a brand new session.
pub fn session_created(sid: &str, host_prefix: &str) -> Message {
    Message {
        id: 0,
        body: session_created_body(sid, host_prefix),
    }
}

/// Just the `["c",SID,hostPrefix,8]` body, for adapters that assign their
/// own ids (`SessionHandle::back_channel_add` returns the `Message` with the
/// id it chose — the router needs this before an engine, let alone an id
/// sequence, exists for the session).
pub fn session_created_body(sid: &str, host_prefix: &str) -> Box<RawValue> {
    serde_json::value::to_raw_value(&serde_json::json!(["c", sid, host_prefix, 8]))
        .expect("control message always serializes")
}

/// `["noop"]` — the liveness probe injected when a back channel has been
/// idle for 30 seconds with nothing queued.
pub fn noop(id: u64) -> Message {
    Message { id, body: noop_body() }
}

/// Just the `["noop"]` body, for adapters that assign their own ids
/// (`SessionHandle::back_channel_add` returns the `Message` with the id it
/// chose).
pub fn noop_body() -> Box<RawValue> {
    serde_json::value::to_raw_value(&serde_json::json!(["noop"])).expect("always serializes")
}

/// `["stop"]` — emitted once when the application terminates a session
/// while a back channel is attached.
pub fn stop(id: u64) -> Message {
    let raw =
        serde_json::value::to_raw_value(&serde_json::json!(["stop"])).expect("always serializes");
    Message { id, body: raw }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_created_matches_wire_shape() {
        let msg = session_created("23sd..32", "b");
        assert_eq!(msg.body.get(), r#"["c","23sd..32","b",8]"#);
    }

    #[test]
    fn noop_and_stop_are_bare_arrays() {
        assert_eq!(noop(5).body.get(), r#"["noop"]"#);
        assert_eq!(stop(6).body.get(), r#"["stop"]"#);
    }

    #[test]
    fn from_value_roundtrips_through_raw_json() {
        let msg = Message::from_value(1, &["appMsg1", "appMsg2"]).unwrap();
        assert_eq!(msg.body.get(), r#"["appMsg1","appMsg2"]"#);
    }
}
