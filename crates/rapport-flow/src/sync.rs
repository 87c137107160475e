//! Upload/download of state snapshots between the store and the dispatcher.
//!
//! Before dispatch the agent *uploads* the states relevant to an inbound
//! message: one agent-wide state, one state per peer, or several namespaced
//! views of the same peer (`"to_me:Alice"`, `"to_them:Alice"`). Each key is
//! dispatched on its own. The resulting candidate lists are *downloaded*
//! back, and every key adopts its first candidate that differs from the
//! stored state.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rapport_types::{Inbound, Node, PeerId, RapportError, Result};

use crate::store::StateStore;

/// Key used for single snapshots and flat candidate lists.
pub const DEFAULT_KEY: &str = "default";

/// Separator between channel prefix and peer id in namespaced keys.
pub const CHANNEL_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSnapshot {
    Single(Node),
    PerPeer(BTreeMap<PeerId, Node>),
    Namespaced(BTreeMap<String, Node>),
}

impl StateSnapshot {
    /// `(key, state)` pairs to dispatch, in key order.
    pub fn entries(&self) -> Vec<(String, Node)> {
        match self {
            StateSnapshot::Single(node) => vec![(DEFAULT_KEY.to_string(), node.clone())],
            StateSnapshot::PerPeer(map) | StateSnapshot::Namespaced(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, StateSnapshot::Single(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Candidates {
    Flat(Vec<Node>),
    Keyed(BTreeMap<String, Vec<Node>>),
}

impl Candidates {
    /// Flat lists are treated as belonging to [`DEFAULT_KEY`].
    pub fn normalize(self) -> BTreeMap<String, Vec<Node>> {
        match self {
            Candidates::Flat(list) => BTreeMap::from([(DEFAULT_KEY.to_string(), list)]),
            Candidates::Keyed(map) => map,
        }
    }
}

#[async_trait]
pub trait StateSync: Send + Sync {
    /// States to dispatch for `inbound`, or `None` to skip dispatch.
    /// Calling it twice for the same message yields the same snapshot.
    async fn upload_states(&self, inbound: &Inbound) -> Result<Option<StateSnapshot>>;

    /// Apply the dispatcher's candidates back to the store.
    async fn download_states(&self, candidates: Candidates) -> Result<()>;
}

#[async_trait]
impl StateSync for Arc<dyn StateSync> {
    async fn upload_states(&self, inbound: &Inbound) -> Result<Option<StateSnapshot>> {
        self.as_ref().upload_states(inbound).await
    }

    async fn download_states(&self, candidates: Candidates) -> Result<()> {
        self.as_ref().download_states(candidates).await
    }
}

// ---------------------------------------------------------------------------
// Single agent-wide state
// ---------------------------------------------------------------------------

/// One state for the whole agent, stored under view `"self"`.
pub struct SingleStateSync {
    store: StateStore,
    initial: Node,
}

impl SingleStateSync {
    pub const VIEW: &'static str = "self";

    pub fn new(store: StateStore, initial: impl Into<Node>) -> Self {
        Self {
            store,
            initial: initial.into(),
        }
    }
}

#[async_trait]
impl StateSync for SingleStateSync {
    async fn upload_states(&self, _inbound: &Inbound) -> Result<Option<StateSnapshot>> {
        let state = self
            .store
            .observe(Self::VIEW, DEFAULT_KEY, &self.initial)
            .await?;
        Ok(Some(StateSnapshot::Single(state)))
    }

    async fn download_states(&self, candidates: Candidates) -> Result<()> {
        for (key, list) in candidates.normalize() {
            if key != DEFAULT_KEY {
                tracing::debug!(key = %key, "ignoring candidates for unknown key");
                continue;
            }
            // Make sure the state exists even if no upload happened yet.
            self.store
                .observe(Self::VIEW, DEFAULT_KEY, &self.initial)
                .await?;
            if let Some(next) = self.store.adopt(Self::VIEW, DEFAULT_KEY, list).await? {
                tracing::debug!(state = %next, "agent state updated");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// One state per peer
// ---------------------------------------------------------------------------

/// One state per sender in a single relation view.
pub struct PeerStateSync {
    store: StateStore,
    view: String,
    default: Node,
}

impl PeerStateSync {
    pub fn new(store: StateStore, view: impl Into<String>, default: impl Into<Node>) -> Self {
        Self {
            store,
            view: view.into(),
            default: default.into(),
        }
    }
}

#[async_trait]
impl StateSync for PeerStateSync {
    async fn upload_states(&self, inbound: &Inbound) -> Result<Option<StateSnapshot>> {
        let Some(peer) = inbound.peer() else {
            return Ok(None);
        };
        let state = self.store.observe(&self.view, peer, &self.default).await?;
        Ok(Some(StateSnapshot::PerPeer(BTreeMap::from([(
            peer.to_string(),
            state,
        )]))))
    }

    async fn download_states(&self, candidates: Candidates) -> Result<()> {
        for (peer, list) in candidates.normalize() {
            match self.store.adopt(&self.view, &peer, list).await? {
                Some(next) => tracing::debug!(peer = %peer, view = %self.view, state = %next, "peer state updated"),
                None => tracing::debug!(peer = %peer, view = %self.view, "no state change"),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Namespaced channels
// ---------------------------------------------------------------------------

/// One namespaced view of each peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Key prefix, e.g. `to_me` in `to_me:Alice`.
    pub prefix: String,
    /// Store view holding the states; defaults to the prefix.
    #[serde(default)]
    pub view: Option<String>,
    pub default: Node,
}

impl Channel {
    pub fn new(prefix: impl Into<String>, default: impl Into<Node>) -> Self {
        Self {
            prefix: prefix.into(),
            view: None,
            default: default.into(),
        }
    }

    pub fn view(&self) -> &str {
        self.view.as_deref().unwrap_or(&self.prefix)
    }

    fn key(&self, peer: &str) -> String {
        format!("{}{}{}", self.prefix, CHANNEL_SEPARATOR, peer)
    }
}

/// Several views of the same peer, each dispatched under `"<prefix>:<peer>"`.
pub struct ChannelStateSync {
    store: StateStore,
    channels: Vec<Channel>,
}

impl ChannelStateSync {
    pub fn new(store: StateStore, channels: Vec<Channel>) -> Result<Self> {
        if channels.is_empty() {
            return Err(RapportError::Validation(
                "channel sync needs at least one channel".into(),
            ));
        }
        for (i, channel) in channels.iter().enumerate() {
            if channel.prefix.is_empty() || channel.prefix.contains(CHANNEL_SEPARATOR) {
                return Err(RapportError::Validation(format!(
                    "invalid channel prefix '{}'",
                    channel.prefix
                )));
            }
            if channels[..i].iter().any(|c| c.prefix == channel.prefix) {
                return Err(RapportError::Validation(format!(
                    "channel prefix '{}' declared twice",
                    channel.prefix
                )));
            }
        }
        Ok(Self { store, channels })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }
}

#[async_trait]
impl StateSync for ChannelStateSync {
    async fn upload_states(&self, inbound: &Inbound) -> Result<Option<StateSnapshot>> {
        let Some(peer) = inbound.peer() else {
            return Ok(None);
        };
        let mut states = BTreeMap::new();
        for channel in &self.channels {
            let state = self
                .store
                .observe(channel.view(), peer, &channel.default)
                .await?;
            states.insert(channel.key(peer), state);
        }
        Ok(Some(StateSnapshot::Namespaced(states)))
    }

    async fn download_states(&self, candidates: Candidates) -> Result<()> {
        for (key, list) in candidates.normalize() {
            let Some((prefix, peer)) = key.split_once(CHANNEL_SEPARATOR) else {
                tracing::debug!(key = %key, "ignoring key without a channel prefix");
                continue;
            };
            let Some(channel) = self.channels.iter().find(|c| c.prefix == prefix) else {
                tracing::debug!(key = %key, "ignoring key with unrecognized prefix");
                continue;
            };
            if let Some(next) = self.store.adopt(channel.view(), peer, list).await? {
                tracing::debug!(peer, channel = %channel.prefix, state = %next, "peer state updated");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Listening gate
// ---------------------------------------------------------------------------

/// Publishes a fixed listening state until the store leaves listening mode,
/// then defers to the wrapped sync.
pub struct ListeningGate<S> {
    inner: S,
    store: StateStore,
    listen_state: Node,
}

impl<S: StateSync> ListeningGate<S> {
    pub fn new(inner: S, store: StateStore, listen_state: impl Into<Node>) -> Self {
        Self {
            inner,
            store,
            listen_state: listen_state.into(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: StateSync> StateSync for ListeningGate<S> {
    async fn upload_states(&self, inbound: &Inbound) -> Result<Option<StateSnapshot>> {
        if self.store.is_listening().await? {
            return Ok(Some(StateSnapshot::Single(self.listen_state.clone())));
        }
        self.inner.upload_states(inbound).await
    }

    async fn download_states(&self, candidates: Candidates) -> Result<()> {
        if self.store.is_listening().await? {
            tracing::debug!("still listening, ignoring candidates");
            return Ok(());
        }
        self.inner.download_states(candidates).await
    }
}
