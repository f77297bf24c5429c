//! WebSocket protocol message types.
//!
//! JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Ping,
}

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        topics: Vec<String>,
    },
    Unsubscribed {
        topics: Vec<String>,
    },
    Event {
        /// Absent for direct user messages.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        event: String,
        payload: Value,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe","topics":["orders"]}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { topics: vec!["orders".into()] });
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shout"}"#).is_err());
    }

    #[test]
    fn test_event_wire_format() {
        let msg = ServerMessage::Event {
            topic: None,
            event: "profile.updated".into(),
            payload: json!({"id": 1}),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "event", "event": "profile.updated", "payload": {"id": 1}})
        );
    }
}
