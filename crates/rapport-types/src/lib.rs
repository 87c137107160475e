//! Shared types and errors for the Rapport flow engine.
//!
//! This crate provides the foundational types used across all other Rapport crates:
//! - `RapportError`: unified error taxonomy
//! - `Node`: the name of a state in a flow graph
//! - `Envelope`, `Message`, `Payload`, `Inbound`: the closed set of message shapes
//!   that travel through hook chains, handlers, and the transport

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a remote agent, as carried in `Message::from` / `Message::to`.
pub type PeerId = String;

/// Unified error type for all Rapport subsystems.
#[derive(Debug, thiserror::Error)]
pub enum RapportError {
    // === Declaration-time errors ===
    #[error("Route syntax error in '{route}' at col {col}: {message}")]
    RouteSyntax {
        route: String,
        col: usize,
        message: String,
    },

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Unknown trigger '{name}'")]
    UnknownTrigger { name: String },

    #[error("Duplicate {direction} binding for route '{route}'")]
    DuplicateBinding { direction: String, route: String },

    #[error("Flow validation failed: {0}")]
    Validation(String),

    // === Message-time errors ===
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Message addressed to '{to}' is not for this agent")]
    Misaddressed { to: String },

    #[error("Sender '{from}' is not allowed")]
    UnknownSender { from: String },

    #[error("Handler on route '{route}' failed: {message}")]
    HandlerFailure { route: String, message: String },

    #[error("{direction} hook at priority {priority} failed: {message}")]
    HookFailure {
        direction: String,
        priority: i32,
        message: String,
    },

    #[error("Send failed: {0}")]
    SendFailure(String),

    #[error("State store is closed")]
    StoreClosed,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl RapportError {
    /// Returns `true` for errors raised while declaring a flow. These must stop
    /// the agent before it starts serving traffic.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RapportError::RouteSyntax { .. }
                | RapportError::Graph(_)
                | RapportError::UnknownTrigger { .. }
                | RapportError::DuplicateBinding { .. }
                | RapportError::Validation(_)
        )
    }

    /// Returns `true` for errors raised while handling one message. The message
    /// is dropped and logged; the agent keeps running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RapportError::MalformedEnvelope(_)
                | RapportError::Misaddressed { .. }
                | RapportError::UnknownSender { .. }
                | RapportError::HandlerFailure { .. }
                | RapportError::HookFailure { .. }
                | RapportError::SendFailure(_)
        )
    }
}

/// A convenience alias for `Result<T, RapportError>`.
pub type Result<T> = std::result::Result<T, RapportError>;

// ---------------------------------------------------------------------------
// Node: name of a state
// ---------------------------------------------------------------------------

/// A named state in a flow graph. Equality is by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Node(String);

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Node {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Node {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Node {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Node {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// ---------------------------------------------------------------------------
// Message shapes
// ---------------------------------------------------------------------------

/// Raw inbound envelope as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub remote_addr: String,
    pub content: serde_json::Value,
}

impl Envelope {
    pub fn new(remote_addr: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            content,
        }
    }
}

/// Structured application message: `{ from, to, message, ... }`.
///
/// `to == None` is a broadcast. Extra fields are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default)]
    pub to: Option<PeerId>,
    #[serde(default)]
    pub message: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    /// An unsigned message addressed to `to` (or broadcast when `None`).
    pub fn new(to: Option<PeerId>, message: impl Into<serde_json::Value>) -> Self {
        Self {
            from: None,
            to,
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn broadcast(message: impl Into<serde_json::Value>) -> Self {
        Self::new(None, message)
    }

    /// The message body as text. Non-string bodies are rendered as JSON.
    pub fn text(&self) -> String {
        match &self.message {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub fn sender(&self) -> Option<&str> {
        self.from.as_deref()
    }
}

/// The closed set of payload shapes that move through hook chains.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw transport envelope; only the first RECEIVE stage should see this.
    Envelope(Envelope),
    /// Validated or outbound structured message.
    Structured(Message),
    /// Bare outbound text, normalized into `Structured` by the SEND chain.
    Text(String),
    /// Out-of-band control token (e.g. `/travel`).
    Control(String),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Envelope(_) => "envelope",
            Payload::Structured(_) => "structured",
            Payload::Text(_) => "text",
            Payload::Control(_) => "control",
        }
    }
}

impl From<Message> for Payload {
    fn from(m: Message) -> Self {
        Payload::Structured(m)
    }
}

impl From<Envelope> for Payload {
    fn from(e: Envelope) -> Self {
        Payload::Envelope(e)
    }
}

/// What receive handlers and state sync see after the RECEIVE chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    Control(String),
}

impl Inbound {
    /// Sender of a structured message; control tokens have none.
    pub fn peer(&self) -> Option<&str> {
        match self {
            Inbound::Message(m) => m.sender(),
            Inbound::Control(_) => None,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Inbound::Message(m) => m.text(),
            Inbound::Control(token) => token.clone(),
        }
    }

    pub fn is_control(&self, token: &str) -> bool {
        matches!(self, Inbound::Control(t) if t == token)
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Inbound::Message(m) => Some(m),
            Inbound::Control(_) => None,
        }
    }
}

impl TryFrom<Payload> for Inbound {
    type Error = RapportError;

    fn try_from(payload: Payload) -> Result<Self> {
        match payload {
            Payload::Structured(m) => Ok(Inbound::Message(m)),
            Payload::Control(token) => Ok(Inbound::Control(token)),
            other => Err(RapportError::MalformedEnvelope(format!(
                "receive chain produced a {} payload",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_display_route_syntax() {
        let err = RapportError::RouteSyntax {
            route: "a --> b --> c".into(),
            col: 7,
            message: "chained arrows are ambiguous".into(),
        };
        assert_eq!(
            err.to_string(),
            "Route syntax error in 'a --> b --> c' at col 7: chained arrows are ambiguous"
        );
    }

    #[test]
    fn error_display_unknown_trigger() {
        let err = RapportError::UnknownTrigger { name: "nope".into() };
        assert_eq!(err.to_string(), "Unknown trigger 'nope'");
    }

    #[test]
    fn error_display_duplicate_binding() {
        let err = RapportError::DuplicateBinding {
            direction: "receive".into(),
            route: "register --> contact".into(),
        };
        assert_eq!(
            err.to_string(),
            "Duplicate receive binding for route 'register --> contact'"
        );
    }

    #[test]
    fn error_display_hook_failure() {
        let err = RapportError::HookFailure {
            direction: "receive".into(),
            priority: 1,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "receive hook at priority 1 failed: boom");
    }

    #[test]
    fn declaration_errors_are_fatal() {
        assert!(RapportError::Graph("x".into()).is_fatal());
        assert!(RapportError::UnknownTrigger { name: "x".into() }.is_fatal());
        assert!(!RapportError::SendFailure("x".into()).is_fatal());
    }

    #[test]
    fn message_errors_are_recoverable() {
        assert!(RapportError::UnknownSender { from: "x".into() }.is_recoverable());
        assert!(RapportError::Misaddressed { to: "y".into() }.is_recoverable());
        assert!(!RapportError::Graph("x".into()).is_recoverable());
        assert!(!RapportError::StoreClosed.is_recoverable());
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: RapportError = json_err.into();
        assert!(matches!(err, RapportError::Json(_)));
    }

    #[test]
    fn node_compares_with_str() {
        let n = Node::from("register");
        assert_eq!(n, "register");
        assert_eq!(n.to_string(), "register");
        assert_eq!(serde_json::to_string(&n).unwrap(), "\"register\"");
    }

    #[test]
    fn message_deserializes_with_extra_fields() {
        let m: Message = serde_json::from_value(json!({
            "from": "Agent_7",
            "to": null,
            "message": "Hello",
            "type": "greeting"
        }))
        .unwrap();
        assert_eq!(m.sender(), Some("Agent_7"));
        assert_eq!(m.to, None);
        assert_eq!(m.text(), "Hello");
        assert_eq!(m.extra.get("type"), Some(&json!("greeting")));
    }

    #[test]
    fn message_text_renders_non_string_bodies() {
        let m = Message::broadcast(json!({"k": 1}));
        assert_eq!(m.text(), r#"{"k":1}"#);
    }

    #[test]
    fn unsigned_message_serializes_null_to() {
        let v = serde_json::to_value(Message::broadcast("hi")).unwrap();
        assert_eq!(v, json!({"to": null, "message": "hi"}));
    }

    #[test]
    fn inbound_from_payload() {
        let inbound = Inbound::try_from(Payload::Control("/travel".into())).unwrap();
        assert!(inbound.is_control("/travel"));
        assert_eq!(inbound.peer(), None);

        let err = Inbound::try_from(Payload::Text("raw".into())).unwrap_err();
        assert!(matches!(err, RapportError::MalformedEnvelope(_)));
    }
}
