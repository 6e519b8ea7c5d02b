//! Envelope codec
//!
//! Every frame exchanged with a client is a JSON envelope:
//!
//! ```text
//! { "type": "command"|"message", "channel": "...", "success": true,
//!   "error": "", "identity": "...", "timestamp": "...", "data": { ... } }
//! ```
//!
//! ## Client Commands (`type = "command"`, `data.command`)
//! - `init`: establish the connection's identity
//! - `subscribe`: join a channel
//! - `unsubscribe`: leave a channel
//! - anything else: forwarded verbatim to the channel's subscribers
//!
//! ## Server Replies
//! - `onSubscribe` / `onUnsubscribe`: membership changed, carries `data.count`
//! - error message: `success = false` with a descriptive `error`

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const INIT: &str = "init";
pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";
pub const ON_SUBSCRIBE: &str = "onSubscribe";
pub const ON_UNSUBSCRIBE: &str = "onUnsubscribe";

/// Error text sent to a connection that talks before `init`
pub const NOT_INITIALIZED: &str = "Client has not sent init command yet!";

/// Envelope kind, the wire `type` field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Command,
    #[default]
    Message,
}

/// A decoded client or server message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: EnvelopeKind,
    #[serde(rename = "channel", default, deserialize_with = "null_as_default")]
    pub topic: String,
    #[serde(default = "default_success", deserialize_with = "null_as_success")]
    pub success: bool,
    #[serde(rename = "error", default, deserialize_with = "null_as_default")]
    pub error_text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub identity: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
    #[serde(rename = "data", default, deserialize_with = "null_as_default")]
    pub payload: Map<String, Value>,
}

/// What a command envelope asks the server to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Init,
    Subscribe,
    Unsubscribe,
    /// Application-defined command, relayed to the channel as-is
    Forward(&'a str),
    /// `data.command` absent, empty or not a string
    Missing,
}

impl Envelope {
    fn stamped(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            topic: String::new(),
            success: true,
            error_text: String::new(),
            identity: String::new(),
            timestamp: Utc::now().to_rfc3339(),
            payload: Map::new(),
        }
    }

    /// Empty command envelope stamped with the current time
    pub fn new_command() -> Self {
        Self::stamped(EnvelopeKind::Command)
    }

    /// Empty data envelope stamped with the current time
    pub fn new_message() -> Self {
        Self::stamped(EnvelopeKind::Message)
    }

    /// Failed reply, sent only to the offending connection
    pub fn error_reply(text: impl Into<String>) -> Self {
        let mut envelope = Self::new_message();
        envelope.success = false;
        envelope.error_text = text.into();
        envelope
    }

    /// Build a control command aimed at `topic`
    pub fn control(command: &str, topic: &str, identity: &str) -> Self {
        let mut envelope = Self::new_command();
        envelope.topic = topic.to_string();
        envelope.identity = identity.to_string();
        envelope
            .payload
            .insert("command".to_string(), Value::String(command.to_string()));
        envelope
    }

    /// `onSubscribe` / `onUnsubscribe` reply announcing the new subscriber count
    pub fn membership_reply(
        command: &str,
        topic: &str,
        identity: &str,
        options: Value,
        count: usize,
    ) -> Self {
        let mut envelope = Self::control(command, topic, identity);
        envelope.payload.insert("options".to_string(), options);
        envelope.payload.insert("count".to_string(), Value::from(count));
        envelope
    }

    /// Classify the `data.command` field
    pub fn command(&self) -> Command<'_> {
        match self.payload.get("command").and_then(Value::as_str) {
            None | Some("") => Command::Missing,
            Some(INIT) => Command::Init,
            Some(SUBSCRIBE) => Command::Subscribe,
            Some(UNSUBSCRIBE) => Command::Unsubscribe,
            Some(other) => Command::Forward(other),
        }
    }

    /// `data.options`, or null when the client sent none
    pub fn options(&self) -> Value {
        self.payload.get("options").cloned().unwrap_or(Value::Null)
    }

    pub fn is_command(&self) -> bool {
        self.kind == EnvelopeKind::Command
    }
}

fn default_success() -> bool {
    true
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_success<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(true))
}

/// Parse an envelope from raw bytes
pub fn decode(data: &[u8]) -> Result<Envelope, EnvelopeError> {
    serde_json::from_slice(data).map_err(EnvelopeError::Decode)
}

/// Encode an envelope to its JSON text
pub fn encode(envelope: &Envelope) -> Result<String, EnvelopeError> {
    serde_json::to_string(envelope).map_err(EnvelopeError::Encode)
}

/// Envelope codec errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to decode envelope: {0}")]
    Decode(serde_json::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(serde_json::Error),
}
