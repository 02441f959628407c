//! Outbound event frames: `{type, timestamp, data}`.

use chorus_core::{ConnectionId, Message, Sequence, SessionToken};
use serde::Deserialize;
use serde_json::{json, Value};

pub const CONNECTION_ESTABLISHED: &str = "connection.established";
pub const CHAT_MESSAGE: &str = "chat.message";
pub const RECOVERY_COMPLETE: &str = "recovery.complete";

/// Wrap `data` in an event envelope and serialize it.
pub fn to_wire(event_type: &str, data: Value) -> String {
    json!({
        "type": event_type,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": data,
    })
    .to_string()
}

pub fn chat_message(message: &Message) -> String {
    to_wire(
        CHAT_MESSAGE,
        json!({
            "content": message.content,
            "sequence": message.sequence,
            "senderLabel": message.sender_label,
        }),
    )
}

pub fn connection_established(id: &ConnectionId, token: &SessionToken, recovered: bool) -> String {
    to_wire(
        CONNECTION_ESTABLISHED,
        json!({
            "clientId": id,
            "sessionToken": token,
            "recovered": recovered,
        }),
    )
}

pub fn recovery_complete(replayed: u64, last_sequence: Sequence) -> String {
    to_wire(
        RECOVERY_COMPLETE,
        json!({
            "replayed": replayed,
            "lastSequence": last_sequence,
        }),
    )
}

/// Whether a serialized outbound frame is a `chat.message` event.
pub fn is_chat_message(frame: &str) -> bool {
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(rename = "type")]
        kind: Option<String>,
    }
    serde_json::from_str::<Envelope>(frame).is_ok_and(|e| e.kind.as_deref() == Some(CHAT_MESSAGE))
}
