use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::NetError;

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const SUBSCRIBE: &str = "subscribe";

/// Push-channel message: `{"type": .., "payload": .., "timestamp": ..}`.
///
/// `type` doubles as the topic a message is routed to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), payload, timestamp: now_ms() }
    }

    pub fn ping() -> Self {
        Self::new(PING, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(PONG, Value::Null)
    }

    /// Server-side filter registration for `topic`.
    pub fn subscribe(topic: &str, filter: &Value) -> Self {
        Self::new(SUBSCRIBE, json!({ "topic": topic, "filter": filter }))
    }

    /// `ping` and `pong` belong to the connection, not to any topic.
    pub fn is_system(&self) -> bool {
        self.kind == PING || self.kind == PONG
    }

    pub fn decode(text: &str) -> Result<Self, NetError> {
        serde_json::from_str(text).map_err(|err| NetError::decode(err.to_string(), text))
    }

    pub fn encode(&self) -> Result<String, NetError> {
        serde_json::to_string(self).map_err(|err| NetError::decode(err.to_string(), self.kind.clone()))
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
