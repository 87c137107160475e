//! Agent-local mutable state owned by a single task.
//!
//! Relation views, one-shot outboxes, the listening flag, and pending
//! activations all live inside one tokio task. Every [`StateStore`] method is a
//! request on its mailbox and is applied as one atomic step, so concurrent
//! handlers and senders never observe a half-applied update.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use rapport_types::{Node, PeerId, RapportError, Result};

use crate::event::Activation;

const MAILBOX_CAPACITY: usize = 64;

/// One pending outbound notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub to: Option<PeerId>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl OutboxEntry {
    pub fn peer(to: impl Into<PeerId>) -> Self {
        Self {
            to: Some(to.into()),
            body: serde_json::Value::Null,
        }
    }

    pub fn with_body(mut self, body: impl Into<serde_json::Value>) -> Self {
        self.body = body.into();
        self
    }
}

/// Point-in-time copy of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreSnapshot {
    pub listening: bool,
    pub views: BTreeMap<String, BTreeMap<PeerId, Node>>,
    pub outboxes: BTreeMap<String, usize>,
    pub peers: Vec<PeerRow>,
}

/// One row of the relation table shown by dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerRow {
    pub agent: PeerId,
    pub views: BTreeMap<String, Node>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
}

impl StoreSnapshot {
    pub fn peer(&self, agent: &str) -> Option<&PeerRow> {
        self.peers.iter().find(|row| row.agent == agent)
    }
}

// ---------------------------------------------------------------------------
// Mailbox protocol
// ---------------------------------------------------------------------------

enum Command {
    Observe {
        view: String,
        key: String,
        default: Node,
        reply: oneshot::Sender<Node>,
    },
    Get {
        view: String,
        key: String,
        reply: oneshot::Sender<Option<Node>>,
    },
    Set {
        view: String,
        key: String,
        state: Node,
        reply: oneshot::Sender<()>,
    },
    Adopt {
        view: String,
        key: String,
        candidates: Vec<Node>,
        reply: oneshot::Sender<Option<Node>>,
    },
    View {
        view: String,
        reply: oneshot::Sender<BTreeMap<PeerId, Node>>,
    },
    Push {
        outbox: String,
        entry: OutboxEntry,
        reply: oneshot::Sender<()>,
    },
    Pending {
        outbox: String,
        reply: oneshot::Sender<usize>,
    },
    Drain {
        outbox: String,
        reply: oneshot::Sender<Vec<OutboxEntry>>,
    },
    IsListening {
        reply: oneshot::Sender<bool>,
    },
    LeaveListening {
        reply: oneshot::Sender<bool>,
    },
    Touch {
        peer: PeerId,
        text: String,
        reply: oneshot::Sender<()>,
    },
    Record {
        activations: Vec<Activation>,
        reply: oneshot::Sender<()>,
    },
    TakeActivations {
        reply: oneshot::Sender<Vec<Activation>>,
    },
    Snapshot {
        reply: oneshot::Sender<StoreSnapshot>,
    },
}

#[derive(Default)]
struct Seen {
    last_seen: Option<DateTime<Utc>>,
    last_message: Option<String>,
}

#[derive(Default)]
struct StoreState {
    listening: bool,
    views: BTreeMap<String, BTreeMap<PeerId, Node>>,
    outboxes: BTreeMap<String, Vec<OutboxEntry>>,
    seen: BTreeMap<PeerId, Seen>,
    /// Latest activation per route, in firing order.
    activations: Vec<Activation>,
}

impl StoreState {
    fn apply(&mut self, command: Command) {
        match command {
            Command::Observe {
                view,
                key,
                default,
                reply,
            } => {
                let state = self
                    .views
                    .entry(view)
                    .or_default()
                    .entry(key)
                    .or_insert(default)
                    .clone();
                let _ = reply.send(state);
            }
            Command::Get { view, key, reply } => {
                let state = self.views.get(&view).and_then(|v| v.get(&key)).cloned();
                let _ = reply.send(state);
            }
            Command::Set {
                view,
                key,
                state,
                reply,
            } => {
                self.views.entry(view).or_default().insert(key, state);
                let _ = reply.send(());
            }
            Command::Adopt {
                view,
                key,
                candidates,
                reply,
            } => {
                let adopted = self
                    .views
                    .get_mut(&view)
                    .and_then(|v| v.get_mut(&key))
                    .and_then(|current| {
                        let next = candidates.into_iter().find(|c| *c != *current)?;
                        *current = next.clone();
                        Some(next)
                    });
                let _ = reply.send(adopted);
            }
            Command::View { view, reply } => {
                let _ = reply.send(self.views.get(&view).cloned().unwrap_or_default());
            }
            Command::Push {
                outbox,
                entry,
                reply,
            } => {
                self.outboxes.entry(outbox).or_default().push(entry);
                let _ = reply.send(());
            }
            Command::Pending { outbox, reply } => {
                let _ = reply.send(self.outboxes.get(&outbox).map_or(0, Vec::len));
            }
            Command::Drain { outbox, reply } => {
                let entries = self
                    .outboxes
                    .get_mut(&outbox)
                    .map(std::mem::take)
                    .unwrap_or_default();
                let _ = reply.send(entries);
            }
            Command::IsListening { reply } => {
                let _ = reply.send(self.listening);
            }
            Command::LeaveListening { reply } => {
                let left = std::mem::replace(&mut self.listening, false);
                let _ = reply.send(left);
            }
            Command::Touch { peer, text, reply } => {
                let seen = self.seen.entry(peer).or_default();
                seen.last_seen = Some(Utc::now());
                seen.last_message = Some(text);
                let _ = reply.send(());
            }
            Command::Record { activations, reply } => {
                for activation in activations {
                    self.activations.retain(|a| a.route.key() != activation.route.key());
                    self.activations.push(activation);
                }
                let _ = reply.send(());
            }
            Command::TakeActivations { reply } => {
                let _ = reply.send(std::mem::take(&mut self.activations));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> StoreSnapshot {
        let mut agents: BTreeSet<&PeerId> = self.seen.keys().collect();
        for view in self.views.values() {
            agents.extend(view.keys());
        }
        let peers = agents
            .into_iter()
            .map(|agent| {
                let views = self
                    .views
                    .iter()
                    .filter_map(|(name, view)| {
                        view.get(agent).map(|state| (name.clone(), state.clone()))
                    })
                    .collect();
                let seen = self.seen.get(agent);
                PeerRow {
                    agent: agent.clone(),
                    views,
                    last_seen: seen.and_then(|s| s.last_seen),
                    last_message: seen.and_then(|s| s.last_message.clone()),
                }
            })
            .collect();
        StoreSnapshot {
            listening: self.listening,
            views: self.views.clone(),
            outboxes: self
                .outboxes
                .iter()
                .map(|(name, entries)| (name.clone(), entries.len()))
                .collect(),
            peers,
        }
    }
}

// ---------------------------------------------------------------------------
// StateStore handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the state-owning task.
///
/// Must be created inside a tokio runtime. The task exits once every handle is
/// dropped.
#[derive(Clone)]
pub struct StateStore {
    tx: mpsc::Sender<Command>,
}

impl StateStore {
    pub fn spawn(listening: bool) -> Self {
        let (tx, mut rx) = mpsc::channel(MAILBOX_CAPACITY);
        let mut state = StoreState {
            listening,
            ..StoreState::default()
        };
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                state.apply(command);
            }
            tracing::debug!("state store closed");
        });
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RapportError::StoreClosed)?;
        rx.await.map_err(|_| RapportError::StoreClosed)
    }

    /// Current state of `key` in `view`, inserting `default` on first sight.
    pub async fn observe(&self, view: &str, key: &str, default: &Node) -> Result<Node> {
        self.request(|reply| Command::Observe {
            view: view.to_string(),
            key: key.to_string(),
            default: default.clone(),
            reply,
        })
        .await
    }

    pub async fn get(&self, view: &str, key: &str) -> Result<Option<Node>> {
        self.request(|reply| Command::Get {
            view: view.to_string(),
            key: key.to_string(),
            reply,
        })
        .await
    }

    pub async fn set(&self, view: &str, key: &str, state: Node) -> Result<()> {
        self.request(|reply| Command::Set {
            view: view.to_string(),
            key: key.to_string(),
            state,
            reply,
        })
        .await
    }

    /// Replace the stored state of an existing `key` with the first candidate
    /// that differs from it. Unseen keys are left alone.
    pub async fn adopt(&self, view: &str, key: &str, candidates: Vec<Node>) -> Result<Option<Node>> {
        self.request(|reply| Command::Adopt {
            view: view.to_string(),
            key: key.to_string(),
            candidates,
            reply,
        })
        .await
    }

    pub async fn view(&self, view: &str) -> Result<BTreeMap<PeerId, Node>> {
        self.request(|reply| Command::View {
            view: view.to_string(),
            reply,
        })
        .await
    }

    pub async fn push(&self, outbox: &str, entry: OutboxEntry) -> Result<()> {
        self.request(|reply| Command::Push {
            outbox: outbox.to_string(),
            entry,
            reply,
        })
        .await
    }

    pub async fn pending(&self, outbox: &str) -> Result<usize> {
        self.request(|reply| Command::Pending {
            outbox: outbox.to_string(),
            reply,
        })
        .await
    }

    /// Take every entry of `outbox`, leaving it empty.
    pub async fn drain(&self, outbox: &str) -> Result<Vec<OutboxEntry>> {
        self.request(|reply| Command::Drain {
            outbox: outbox.to_string(),
            reply,
        })
        .await
    }

    pub async fn is_listening(&self) -> Result<bool> {
        self.request(|reply| Command::IsListening { reply }).await
    }

    /// Clear the listening flag. Returns `true` only for the call that
    /// actually cleared it.
    pub async fn leave_listening(&self) -> Result<bool> {
        let left = self
            .request(|reply| Command::LeaveListening { reply })
            .await?;
        if left {
            tracing::info!("left listening mode");
        }
        Ok(left)
    }

    pub async fn touch(&self, peer: &str, text: impl Into<String>) -> Result<()> {
        self.request(|reply| Command::Touch {
            peer: peer.to_string(),
            text: text.into(),
            reply,
        })
        .await
    }

    pub async fn record_activation(&self, activation: Activation) -> Result<()> {
        self.record_activations(vec![activation]).await
    }

    /// Remember fired events; a later activation replaces an earlier one on
    /// the same route.
    pub async fn record_activations(&self, activations: Vec<Activation>) -> Result<()> {
        if activations.is_empty() {
            return Ok(());
        }
        self.request(|reply| Command::Record { activations, reply })
            .await
    }

    pub async fn take_activations(&self) -> Result<Vec<Activation>> {
        self.request(|reply| Command::TakeActivations { reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;
    use crate::triggers::{next_scope, TriggerSet};
    use rapport_route::Route;

    fn activation(route: Route, trigger: &str) -> Activation {
        let triggers = TriggerSet::new(next_scope(), [trigger.to_string()]);
        Activation {
            route,
            key: "default".into(),
            action: Action::Move,
            trigger: triggers.get(trigger).unwrap(),
        }
    }

    #[tokio::test]
    async fn observe_inserts_default_once() {
        let store = StateStore::spawn(false);
        let first = store.observe("to_me", "Alice", &"register".into()).await.unwrap();
        assert_eq!(first, "register");
        store.set("to_me", "Alice", "contact".into()).await.unwrap();
        let again = store.observe("to_me", "Alice", &"register".into()).await.unwrap();
        assert_eq!(again, "contact");
    }

    #[tokio::test]
    async fn adopt_picks_first_differing_candidate() {
        let store = StateStore::spawn(false);
        store.observe("v", "p", &"a".into()).await.unwrap();
        let adopted = store
            .adopt("v", "p", vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(adopted, Some(Node::from("b")));
        assert_eq!(store.get("v", "p").await.unwrap(), Some(Node::from("b")));

        let unchanged = store.adopt("v", "p", vec!["b".into()]).await.unwrap();
        assert_eq!(unchanged, None);
    }

    #[tokio::test]
    async fn adopt_ignores_unseen_keys() {
        let store = StateStore::spawn(false);
        assert_eq!(store.adopt("v", "ghost", vec!["x".into()]).await.unwrap(), None);
        assert!(store.view("v").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_empties_outbox() {
        let store = StateStore::spawn(false);
        store.push("contact", OutboxEntry::peer("A")).await.unwrap();
        store.push("contact", OutboxEntry::peer("B")).await.unwrap();
        assert_eq!(store.pending("contact").await.unwrap(), 2);

        let drained = store.drain("contact").await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].to.as_deref(), Some("A"));
        assert!(store.drain("contact").await.unwrap().is_empty());
        assert!(store.drain("never_used").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leave_listening_succeeds_once() {
        let store = StateStore::spawn(true);
        assert!(store.is_listening().await.unwrap());
        assert!(store.leave_listening().await.unwrap());
        assert!(!store.leave_listening().await.unwrap());
        assert!(!store.is_listening().await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_leave_listening_has_one_winner() {
        let store = StateStore::spawn(true);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            tasks.push(tokio::spawn(async move { s.leave_listening().await.unwrap() }));
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn activations_keep_latest_per_route() {
        let store = StateStore::spawn(false);
        let edge = Route::edge("register", "contact");
        store
            .record_activations(vec![
                activation(edge.clone(), "ok"),
                activation(Route::node("register"), "ok"),
            ])
            .await
            .unwrap();
        store.record_activation(activation(edge.clone(), "error")).await.unwrap();

        let taken = store.take_activations().await.unwrap();
        assert_eq!(taken.len(), 2);
        let on_edge = taken.iter().find(|a| a.route == edge).unwrap();
        assert_eq!(on_edge.trigger.name(), "error");
        assert!(store.take_activations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_builds_peer_rows() {
        let store = StateStore::spawn(false);
        store.observe("to_me", "Alice", &"register".into()).await.unwrap();
        store.observe("to_them", "Alice", &"neutral".into()).await.unwrap();
        store.touch("Alice", "hello").await.unwrap();
        store.touch("Bob", "hi").await.unwrap();

        let snap = store.snapshot().await.unwrap();
        assert!(!snap.listening);
        assert_eq!(snap.peers.len(), 2);
        let alice = snap.peer("Alice").unwrap();
        assert_eq!(alice.views.get("to_them"), Some(&Node::from("neutral")));
        assert_eq!(alice.last_message.as_deref(), Some("hello"));
        assert!(alice.last_seen.is_some());
        assert!(snap.peer("Bob").unwrap().views.is_empty());
    }
}
