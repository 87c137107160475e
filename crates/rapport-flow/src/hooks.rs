//! Hook trait, ordered hook pipeline, and built-in stages.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rapport_types::{Message, Payload, RapportError, Result};

use crate::events::{EventEmitter, FlowEvent};
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Receive,
    Send,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Receive => "receive",
            Direction::Send => "send",
        })
    }
}

// ---------------------------------------------------------------------------
// Hook trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Hook: Send + Sync {
    /// Stage name used in logs and events.
    fn name(&self) -> &str;

    /// Rewrite the payload, or return `Ok(None)` to drop it.
    async fn apply(&self, payload: Payload) -> Result<Option<Payload>>;
}

/// Hook backed by an async closure.
pub struct FnHook<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as a [`Hook`].
pub fn hook_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHook<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Payload>>> + Send + 'static,
{
    FnHook {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> Hook for FnHook<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Payload>>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, payload: Payload) -> Result<Option<Payload>> {
        (self.f)(payload).await
    }
}

// ---------------------------------------------------------------------------
// HookPipeline
// ---------------------------------------------------------------------------

struct Stage {
    direction: Direction,
    priority: i32,
    hook: Arc<dyn Hook>,
}

/// Per-direction chains of hooks, run in ascending priority. Stages with equal
/// priority run in registration order.
pub struct HookPipeline {
    stages: Vec<Stage>,
    events: EventEmitter,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            events: EventEmitter::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn register(&mut self, direction: Direction, priority: i32, hook: impl Hook + 'static) {
        self.register_arc(direction, priority, Arc::new(hook));
    }

    pub fn register_arc(&mut self, direction: Direction, priority: i32, hook: Arc<dyn Hook>) {
        // Insert after every stage with priority <= ours so ties keep registration order.
        let at = self
            .stages
            .iter()
            .position(|s| s.direction == direction && s.priority > priority)
            .unwrap_or(self.stages.len());
        self.stages.insert(
            at,
            Stage {
                direction,
                priority,
                hook,
            },
        );
    }

    /// `(priority, name)` of each stage in `direction`, in run order.
    pub fn stages(&self, direction: Direction) -> Vec<(i32, String)> {
        self.stages
            .iter()
            .filter(|s| s.direction == direction)
            .map(|s| (s.priority, s.hook.name().to_string()))
            .collect()
    }

    pub fn len(&self, direction: Direction) -> usize {
        self.stages.iter().filter(|s| s.direction == direction).count()
    }

    /// Thread `payload` through the chain. `None` means some stage dropped it.
    pub async fn run(&self, direction: Direction, payload: Payload) -> Option<Payload> {
        let mut current = payload;
        for stage in self.stages.iter().filter(|s| s.direction == direction) {
            match stage.hook.apply(current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    tracing::debug!(
                        direction = %direction,
                        stage = stage.hook.name(),
                        priority = stage.priority,
                        "payload dropped by hook"
                    );
                    self.events.emit(FlowEvent::MessageDropped {
                        direction: direction.to_string(),
                        stage: stage.hook.name().to_string(),
                        priority: stage.priority,
                    });
                    return None;
                }
                Err(e) => {
                    let err = RapportError::HookFailure {
                        direction: direction.to_string(),
                        priority: stage.priority,
                        message: e.to_string(),
                    };
                    tracing::warn!(stage = stage.hook.name(), error = %err, "hook failed");
                    self.events.emit(FlowEvent::HookFailed {
                        direction: direction.to_string(),
                        stage: stage.hook.name().to_string(),
                        priority: stage.priority,
                        error: e.to_string(),
                    });
                    return None;
                }
            }
        }
        Some(current)
    }
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in stages
// ---------------------------------------------------------------------------

/// First RECEIVE stage: turns a raw envelope into a structured message or a
/// control token, and drops anything not addressed to this agent.
pub struct EnvelopeValidator {
    agent_id: String,
    control_token: String,
    store: StateStore,
}

impl EnvelopeValidator {
    pub const PRIORITY: i32 = 0;

    pub fn new(agent_id: impl Into<String>, control_token: impl Into<String>, store: StateStore) -> Self {
        Self {
            agent_id: agent_id.into(),
            control_token: control_token.into(),
            store,
        }
    }

    fn check(&self, content: serde_json::Value) -> Result<Message> {
        let obj = content
            .as_object()
            .ok_or_else(|| RapportError::MalformedEnvelope("content is not an object".into()))?;
        match obj.get("to") {
            Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::String(to)) if *to == self.agent_id => {}
            Some(other) => {
                return Err(RapportError::Misaddressed {
                    to: match other {
                        serde_json::Value::String(s) => s.clone(),
                        v => v.to_string(),
                    },
                })
            }
            None => return Err(RapportError::Misaddressed { to: String::new() }),
        }
        match obj.get("from") {
            Some(serde_json::Value::String(from)) if !from.is_empty() => {}
            _ => return Err(RapportError::MalformedEnvelope("missing content.from".into())),
        }
        Ok(serde_json::from_value(content)?)
    }
}

#[async_trait]
impl Hook for EnvelopeValidator {
    fn name(&self) -> &str {
        "validate"
    }

    async fn apply(&self, payload: Payload) -> Result<Option<Payload>> {
        let envelope = match payload {
            Payload::Envelope(envelope) => envelope,
            other => {
                tracing::debug!(kind = other.kind(), "expected a transport envelope");
                return Ok(None);
            }
        };

        if envelope.content.as_str() == Some(self.control_token.as_str()) {
            if self.store.is_listening().await? {
                return Ok(Some(Payload::Control(self.control_token.clone())));
            }
            tracing::debug!(remote = %envelope.remote_addr, "control token outside listening mode");
            return Ok(None);
        }

        match self.check(envelope.content) {
            Ok(message) => {
                if let Some(from) = message.sender() {
                    self.store.touch(from, message.text()).await?;
                }
                Ok(Some(Payload::Structured(message)))
            }
            Err(RapportError::Json(e)) => Err(e.into()),
            Err(reason) => {
                tracing::debug!(remote = %envelope.remote_addr, %reason, "envelope rejected");
                Ok(None)
            }
        }
    }
}

/// RECEIVE stage that only lets through senders whose id starts with one of
/// the configured prefixes. An empty list accepts everyone.
pub struct SenderAllowlist {
    prefixes: Vec<String>,
    events: EventEmitter,
}

impl SenderAllowlist {
    pub const PRIORITY: i32 = 1;

    pub fn new(prefixes: Vec<String>, events: EventEmitter) -> Self {
        Self { prefixes, events }
    }

    pub fn allows(&self, peer: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| peer.starts_with(p.as_str()))
    }
}

#[async_trait]
impl Hook for SenderAllowlist {
    fn name(&self) -> &str {
        "check_sender"
    }

    async fn apply(&self, payload: Payload) -> Result<Option<Payload>> {
        match payload {
            Payload::Control(_) => Ok(Some(payload)),
            Payload::Structured(message) => {
                let peer = message.sender().unwrap_or_default();
                if self.allows(peer) {
                    return Ok(Some(Payload::Structured(message)));
                }
                let err = RapportError::UnknownSender {
                    from: peer.to_string(),
                };
                tracing::info!(peer, %err, "sender rejected");
                self.events.emit(FlowEvent::SenderRejected {
                    peer: peer.to_string(),
                });
                Ok(None)
            }
            other => {
                tracing::debug!(kind = other.kind(), "allowlist expects a structured message");
                Ok(None)
            }
        }
    }
}

/// SEND stage that normalizes text into a structured message and stamps the
/// sender id.
pub struct SignOutbound {
    agent_id: String,
}

impl SignOutbound {
    pub const PRIORITY: i32 = 0;

    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl Hook for SignOutbound {
    fn name(&self) -> &str {
        "sign"
    }

    async fn apply(&self, payload: Payload) -> Result<Option<Payload>> {
        let mut message = match payload {
            Payload::Text(text) => Message::broadcast(text),
            Payload::Structured(message) => message,
            other => {
                tracing::debug!(kind = other.kind(), "cannot sign outbound payload");
                return Ok(None);
            }
        };
        message.from = Some(self.agent_id.clone());
        Ok(Some(Payload::Structured(message)))
    }
}
