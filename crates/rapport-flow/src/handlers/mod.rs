//! Built-in receive handlers for rule-driven agents.

pub mod outbox;

pub use outbox::{Heartbeat, OutboxNotice};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rapport_types::{Inbound, Result};

use crate::event::{Activation, Event};
use crate::handler::{HandlerContext, ReceiveHandler};
use crate::store::OutboxEntry;
use crate::triggers::Trigger;

// ---------------------------------------------------------------------------
// MatchRule: text predicate on structured messages
// ---------------------------------------------------------------------------

/// How a [`MatchRule`] compares message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    Equals(String),
    Contains(String),
    Any,
}

impl Matcher {
    pub fn matches(&self, text: &str) -> bool {
        match self {
            Matcher::Equals(expected) => text.trim() == expected,
            Matcher::Contains(needle) => text.contains(needle.as_str()),
            Matcher::Any => true,
        }
    }
}

/// Returns a fixed event when the message text matches, and optionally queues
/// the sender on an outbox for a send handler to notify later.
///
/// The sender is queued only once the dispatcher keeps the event, so a
/// `Move` that loses to an earlier binding leaves the outbox alone.
/// Control tokens never match.
pub struct MatchRule {
    matcher: Matcher,
    event: Event,
    outbox: Option<String>,
}

impl MatchRule {
    pub fn new(matcher: Matcher, event: Event) -> Self {
        Self {
            matcher,
            event,
            outbox: None,
        }
    }

    pub fn with_outbox(mut self, outbox: impl Into<String>) -> Self {
        self.outbox = Some(outbox.into());
        self
    }
}

#[async_trait]
impl ReceiveHandler for MatchRule {
    async fn handle(&self, cx: &HandlerContext<'_>, inbound: &Inbound) -> Result<Option<Event>> {
        let Some(message) = inbound.as_message() else {
            return Ok(None);
        };
        if !self.matcher.matches(&message.text()) {
            return Ok(None);
        }
        Ok(Some(self.event.clone()))
    }

    async fn fired(
        &self,
        cx: &HandlerContext<'_>,
        inbound: &Inbound,
        _activation: &Activation,
    ) -> Result<()> {
        let (Some(outbox), Some(peer)) = (&self.outbox, inbound.peer()) else {
            return Ok(());
        };
        cx.store.push(outbox, OutboxEntry::peer(peer)).await?;
        tracing::debug!(peer, outbox = %outbox, "sender queued");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NodeProbe: node-route fallback
// ---------------------------------------------------------------------------

/// Logs every message seen in a state and reports `Test(trigger)`.
pub struct NodeProbe {
    trigger: Trigger,
}

impl NodeProbe {
    pub fn new(trigger: Trigger) -> Self {
        Self { trigger }
    }
}

#[async_trait]
impl ReceiveHandler for NodeProbe {
    async fn handle(&self, cx: &HandlerContext<'_>, inbound: &Inbound) -> Result<Option<Event>> {
        tracing::debug!(
            key = cx.key,
            state = %cx.state,
            peer = inbound.peer().unwrap_or("-"),
            text = %inbound.text(),
            "probe"
        );
        Ok(Some(Event::Test(self.trigger.clone())))
    }
}

// ---------------------------------------------------------------------------
// ControlGate: leaves listening mode on the control token
// ---------------------------------------------------------------------------

/// Moves out of the listening state when the control token arrives. Only the
/// call that actually clears the listening flag moves; repeats return nothing.
pub struct ControlGate {
    token: String,
    trigger: Trigger,
}

impl ControlGate {
    pub fn new(token: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            token: token.into(),
            trigger,
        }
    }
}

#[async_trait]
impl ReceiveHandler for ControlGate {
    async fn handle(&self, cx: &HandlerContext<'_>, inbound: &Inbound) -> Result<Option<Event>> {
        if !inbound.is_control(&self.token) {
            return Ok(None);
        }
        if cx.store.leave_listening().await? {
            Ok(Some(Event::Move(self.trigger.clone())))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use crate::triggers::{next_scope, TriggerSet};
    use rapport_route::Route;
    use rapport_types::{Message, Node};

    struct Fixture {
        store: StateStore,
        triggers: TriggerSet,
        route: Route,
        state: Node,
    }

    impl Fixture {
        fn new(listening: bool) -> Self {
            Self {
                store: StateStore::spawn(listening),
                triggers: TriggerSet::new(next_scope(), ["ok".to_string(), "ban".to_string()]),
                route: Route::edge("register", "contact"),
                state: Node::from("register"),
            }
        }

        fn cx(&self) -> HandlerContext<'_> {
            HandlerContext {
                key: "Alice",
                state: &self.state,
                route: &self.route,
                store: &self.store,
                triggers: &self.triggers,
            }
        }
    }

    fn from_alice(text: &str) -> Inbound {
        Inbound::Message(Message {
            from: Some("Alice".into()),
            ..Message::broadcast(text)
        })
    }

    #[test]
    fn matchers() {
        assert!(Matcher::Equals("hi".into()).matches(" hi\n"));
        assert!(!Matcher::Equals("hi".into()).matches("hi there"));
        assert!(Matcher::Contains("idiot".into()).matches("you idiot"));
        assert!(Matcher::Any.matches(""));
    }

    #[tokio::test]
    async fn match_rule_queues_sender_only_when_fired() {
        let f = Fixture::new(false);
        let ban = f.triggers.get("ban").unwrap();
        let rule = MatchRule::new(Matcher::Contains("idiot".into()), Event::Move(ban.clone()))
            .with_outbox("ban");

        assert_eq!(rule.handle(&f.cx(), &from_alice("hello")).await.unwrap(), None);

        let inbound = from_alice("you idiot");
        let event = rule.handle(&f.cx(), &inbound).await.unwrap();
        assert_eq!(event.unwrap().action(), crate::event::Action::Move);
        assert_eq!(f.store.pending("ban").await.unwrap(), 0);

        let activation = Activation {
            route: f.route.clone(),
            key: "Alice".into(),
            action: crate::event::Action::Move,
            trigger: ban,
        };
        rule.fired(&f.cx(), &inbound, &activation).await.unwrap();
        assert_eq!(
            f.store.drain("ban").await.unwrap(),
            vec![OutboxEntry::peer("Alice")]
        );
    }

    #[tokio::test]
    async fn match_rule_ignores_control_tokens() {
        let f = Fixture::new(true);
        let rule = MatchRule::new(Matcher::Any, Event::Test(f.triggers.get("ok").unwrap()));
        let out = rule
            .handle(&f.cx(), &Inbound::Control("/travel".into()))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn probe_reports_test() {
        let f = Fixture::new(false);
        let probe = NodeProbe::new(f.triggers.get("ok").unwrap());
        let event = probe.handle(&f.cx(), &from_alice("x")).await.unwrap().unwrap();
        assert_eq!(event, Event::Test(f.triggers.get("ok").unwrap()));
    }

    #[tokio::test]
    async fn control_gate_moves_once() {
        let f = Fixture::new(true);
        let gate = ControlGate::new("/travel", f.triggers.get("ok").unwrap());
        let token = Inbound::Control("/travel".into());

        assert!(gate.handle(&f.cx(), &from_alice("/travel")).await.unwrap().is_none());
        assert!(matches!(
            gate.handle(&f.cx(), &token).await.unwrap(),
            Some(Event::Move(_))
        ));
        assert!(gate.handle(&f.cx(), &token).await.unwrap().is_none());
        assert!(!f.store.is_listening().await.unwrap());
    }
}
