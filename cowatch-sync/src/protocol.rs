//! Text protocol for session events.
//!
//! Wire format (one JSON object per WebSocket text frame):
//! ```text
//! {"type":"message","author_id":"A","author":{"name":"Ann"},"message":"hi","id":"…","timestamp":"…"}
//! {"type":"command","userId":"A","commandType":"pause","timestamp":12.5}
//! ```
//!
//! The `type` key selects the variant. Unknown keys are ignored so newer
//! peers can add fields; unknown `type` tags decode to
//! [`ProtocolError::UnknownType`] and are dropped by the router.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Type tag of chat events.
pub const TYPE_MESSAGE: &str = "message";
/// Type tag of playback command events.
pub const TYPE_COMMAND: &str = "command";

/// Opaque user identifier issued by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque session identifier, created by the session workflow before anyone joins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Playback intent carried by a command event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Play,
    Pause,
    /// A seek completed; the event timestamp is the new position.
    Seeked,
}

impl CommandKind {
    /// The `commandType` wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Seeked => "seeked",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display metadata of a chat author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub name: String,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub author_id: UserId,
    #[serde(default)]
    pub author: Author,
    pub message: String,
    /// Unique message id, assigned by the author or by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// RFC 3339 relay timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ChatEvent {
    /// Build a locally authored message with a fresh id.
    pub fn authored(author_id: UserId, author_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            author_id,
            author: Author {
                name: author_name.into(),
            },
            message: message.into(),
            id: Some(uuid::Uuid::new_v4().to_string()),
            timestamp: None,
        }
    }
}

/// A playback command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Originating user. `None` for state replays issued by the relay itself.
    #[serde(rename = "userId", default)]
    pub user_id: Option<UserId>,
    #[serde(rename = "commandType")]
    pub kind: CommandKind,
    /// Playback position in seconds.
    pub timestamp: f64,
}

impl CommandEvent {
    /// Build a command, clamping the timestamp to a finite non-negative value.
    pub fn new(user_id: Option<UserId>, kind: CommandKind, timestamp: f64) -> Self {
        Self {
            user_id,
            kind,
            timestamp: sanitize_timestamp(timestamp),
        }
    }
}

/// Clamp a playback position to a finite, non-negative number of seconds.
pub fn sanitize_timestamp(timestamp: f64) -> f64 {
    if timestamp.is_finite() && timestamp > 0.0 {
        timestamp
    } else {
        0.0
    }
}

/// The sole transmissible unit on a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "message")]
    Chat(ChatEvent),
    #[serde(rename = "command")]
    Command(CommandEvent),
}

impl Event {
    /// The wire type tag of this event.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Chat(_) => TYPE_MESSAGE,
            Self::Command(_) => TYPE_COMMAND,
        }
    }

    /// The user this event originates from, if any.
    pub fn origin(&self) -> Option<&UserId> {
        match self {
            Self::Chat(chat) => Some(&chat.author_id),
            Self::Command(cmd) => cmd.user_id.as_ref(),
        }
    }

    /// Serialize to the textual wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one wire frame.
    ///
    /// The type tag is checked before the body so that frames from a newer
    /// protocol revision are reported as [`ProtocolError::UnknownType`]
    /// rather than as generic JSON errors.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if tag != TYPE_MESSAGE && tag != TYPE_COMMAND {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        }

        let event: Event = serde_json::from_value(value)?;
        if let Event::Command(cmd) = &event {
            if !cmd.timestamp.is_finite() || cmd.timestamp < 0.0 {
                return Err(ProtocolError::InvalidTimestamp(cmd.timestamp));
            }
        }
        Ok(event)
    }
}

impl From<ChatEvent> for Event {
    fn from(chat: ChatEvent) -> Self {
        Self::Chat(chat)
    }
}

impl From<CommandEvent> for Event {
    fn from(cmd: CommandEvent) -> Self {
        Self::Command(cmd)
    }
}

/// Reasons a wire frame is rejected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid event payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event has no type tag")]
    MissingType,
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("invalid playback timestamp: {0}")]
    InvalidTimestamp(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_command() {
        let raw = r#"{"type":"command","userId":"A","commandType":"pause","timestamp":12.5}"#;
        let event = Event::decode(raw).unwrap();

        match event {
            Event::Command(cmd) => {
                assert_eq!(cmd.user_id, Some(UserId::from("A")));
                assert_eq!(cmd.kind, CommandKind::Pause);
                assert_eq!(cmd.timestamp, 12.5);
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_chat_ignores_extra_keys() {
        let raw = r#"{"type":"message","author_id":"B","author":{"name":"Bob","id":"B"},"message":"hi","color":"red"}"#;
        let event = Event::decode(raw).unwrap();

        let Event::Chat(chat) = event else {
            panic!("expected chat");
        };
        assert_eq!(chat.author_id.as_str(), "B");
        assert_eq!(chat.author.name, "Bob");
        assert_eq!(chat.message, "hi");
        assert!(chat.id.is_none());
    }

    #[test]
    fn test_decode_chat_without_author_object() {
        let raw = r#"{"type":"message","author_id":"B","message":"hey"}"#;
        let Event::Chat(chat) = Event::decode(raw).unwrap() else {
            panic!("expected chat");
        };
        assert_eq!(chat.author.name, "");
    }

    #[test]
    fn test_decode_missing_type() {
        let raw = r#"{"userId":"A","commandType":"play","timestamp":1.0}"#;
        assert!(matches!(Event::decode(raw), Err(ProtocolError::MissingType)));
    }

    #[test]
    fn test_decode_non_string_type() {
        let raw = r#"{"type":7,"message":"x"}"#;
        assert!(matches!(Event::decode(raw), Err(ProtocolError::MissingType)));
    }

    #[test]
    fn test_decode_unknown_type() {
        let raw = r#"{"type":"reaction","emoji":"🍿"}"#;
        match Event::decode(raw) {
            Err(ProtocolError::UnknownType(tag)) => assert_eq!(tag, "reaction"),
            other => panic!("expected unknown type, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_command_kind() {
        let raw = r#"{"type":"command","userId":"A","commandType":"rewind","timestamp":1.0}"#;
        assert!(matches!(Event::decode(raw), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_decode_negative_timestamp() {
        let raw = r#"{"type":"command","userId":"A","commandType":"seeked","timestamp":-3.0}"#;
        assert!(matches!(Event::decode(raw), Err(ProtocolError::InvalidTimestamp(_))));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(Event::decode("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(Event::decode("[1,2,3]"), Err(ProtocolError::MissingType)));
    }

    #[test]
    fn test_decode_null_user_id() {
        let raw = r#"{"type":"command","userId":null,"commandType":"play","timestamp":4.0}"#;
        let Event::Command(cmd) = Event::decode(raw).unwrap() else {
            panic!("expected command");
        };
        assert!(cmd.user_id.is_none());
    }

    #[test]
    fn test_encode_uses_wire_keys() {
        let cmd = CommandEvent::new(Some(UserId::from("A")), CommandKind::Seeked, 30.0);
        let encoded = Event::from(cmd).encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "command");
        assert_eq!(value["userId"], "A");
        assert_eq!(value["commandType"], "seeked");
        assert_eq!(value["timestamp"], 30.0);
    }

    #[test]
    fn test_encode_chat_omits_missing_optionals() {
        let chat = ChatEvent {
            author_id: UserId::from("A"),
            author: Author { name: "Ann".into() },
            message: "hello".into(),
            id: None,
            timestamp: None,
        };
        let encoded = Event::from(chat).encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["type"], "message");
        assert_eq!(value["author_id"], "A");
        assert_eq!(value["author"]["name"], "Ann");
        assert!(value.get("id").is_none());
        assert!(value.get("timestamp").is_none());
    }

    #[test]
    fn test_authored_chat_has_unique_ids() {
        let a = ChatEvent::authored(UserId::from("A"), "Ann", "one");
        let b = ChatEvent::authored(UserId::from("A"), "Ann", "two");
        assert!(a.id.is_some());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_sanitize_timestamp() {
        assert_eq!(sanitize_timestamp(5.25), 5.25);
        assert_eq!(sanitize_timestamp(-1.0), 0.0);
        assert_eq!(sanitize_timestamp(f64::NAN), 0.0);
        assert_eq!(sanitize_timestamp(f64::INFINITY), 0.0);
    }

    #[test]
    fn test_event_origin() {
        let chat = Event::from(ChatEvent::authored(UserId::from("A"), "Ann", "x"));
        let replay = Event::from(CommandEvent::new(None, CommandKind::Play, 0.0));

        assert_eq!(chat.origin(), Some(&UserId::from("A")));
        assert_eq!(replay.origin(), None);
        assert_eq!(chat.type_tag(), TYPE_MESSAGE);
        assert_eq!(replay.type_tag(), TYPE_COMMAND);
    }
}
