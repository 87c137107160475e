//! Declarative flow files: a graph plus built-in handlers, loaded from JSON.
//!
//! ```json
//! {
//!   "routes": ["register --> contact", "register --[ ban ]--> ban"],
//!   "rules": [
//!     { "route": "register --> contact", "equals": "hello", "trigger": "ok" },
//!     { "route": "register --> ban", "contains": "idiot", "trigger": "ban", "outbox": "ban" }
//!   ],
//!   "notices": [{ "route": "register --> ban", "outbox": "ban", "text": "bye" }],
//!   "sync": { "kind": "peer", "view": "relations", "default": "register" }
//! }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rapport_route::{ArrowStyle, Route};
use rapport_types::{Node, RapportError, Result};

use crate::agent::{AgentBuilder, FlowAgent};
use crate::config::AgentConfig;
use crate::event::{Action, Event};
use crate::graph::FlowGraph;
use crate::handlers::{ControlGate, Heartbeat, MatchRule, Matcher, NodeProbe, OutboxNotice};
use crate::sender::SendGate;
use crate::sync::{
    Channel, ChannelStateSync, ListeningGate, PeerStateSync, SingleStateSync, StateSync,
};
use crate::transport::Transport;
use crate::triggers::Trigger;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowFile {
    pub arrow: ArrowStyle,
    /// Extra states not named by any route.
    pub states: Vec<String>,
    /// Extra graph-wide triggers not named on any edge.
    pub triggers: Vec<String>,
    pub routes: Vec<String>,
    pub rules: Vec<RuleSpec>,
    pub probes: Vec<ProbeSpec>,
    pub notices: Vec<NoticeSpec>,
    pub heartbeat: Option<HeartbeatSpec>,
    pub sync: SyncSpec,
    /// State published while the agent is listening for the control token.
    pub listen_state: Option<String>,
    pub control: Option<ControlSpec>,
}

/// A [`MatchRule`] bound to a route. At most one of `equals` and `contains`
/// may be set; with neither, every message matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub route: String,
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default = "default_action")]
    pub event: Action,
    pub trigger: String,
    #[serde(default)]
    pub outbox: Option<String>,
}

impl RuleSpec {
    fn matcher(&self) -> Result<Matcher> {
        match (&self.equals, &self.contains) {
            (Some(_), Some(_)) => Err(RapportError::Validation(format!(
                "rule on '{}' sets both equals and contains",
                self.route
            ))),
            (Some(text), None) => Ok(Matcher::Equals(text.clone())),
            (None, Some(text)) => Ok(Matcher::Contains(text.clone())),
            (None, None) => Ok(Matcher::Any),
        }
    }

    /// A `Move` must name an edge that accepts its trigger; otherwise the
    /// dispatcher would only ever record it as `Stay`.
    fn check_move(&self, graph: &FlowGraph, trigger: &Trigger) -> Result<()> {
        let allowed = match graph.resolve(&self.route)? {
            Route::Edge { source, target, .. } => graph
                .edge(source.as_str(), target.as_str())
                .is_some_and(|edge| edge.allows(trigger)),
            Route::Node { .. } => false,
        };
        if allowed {
            return Ok(());
        }
        Err(RapportError::Validation(format!(
            "rule on '{}' moves on trigger '{}', which the route does not accept",
            self.route, self.trigger
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub state: String,
    pub trigger: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeSpec {
    pub route: String,
    pub outbox: String,
    pub text: String,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default = "default_actions")]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSpec {
    #[serde(default = "default_clock")]
    pub route: String,
    pub text: String,
    /// Falls back to the agent's `send_interval_ms`.
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncSpec {
    Single {
        #[serde(default)]
        initial: Option<String>,
    },
    Peer {
        #[serde(default = "default_view")]
        view: String,
        default: String,
    },
    Channels { channels: Vec<Channel> },
}

impl Default for SyncSpec {
    fn default() -> Self {
        SyncSpec::Single { initial: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSpec {
    pub route: String,
    pub trigger: String,
}

fn default_action() -> Action {
    Action::Move
}

fn default_actions() -> Vec<Action> {
    vec![Action::Move]
}

fn default_clock() -> String {
    "clock".into()
}

fn default_view() -> String {
    "relations".into()
}

impl FlowFile {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        let flow = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), routes = flow.routes.len(), "flow file loaded");
        Ok(flow)
    }

    pub fn graph(&self) -> Result<FlowGraph> {
        let mut builder = FlowGraph::builder(self.arrow.clone());
        for state in &self.states {
            builder = builder.state(state.as_str());
        }
        if let Some(listen) = &self.listen_state {
            builder = builder.state(listen.as_str());
        }
        for trigger in &self.triggers {
            builder = builder.trigger(trigger.as_str());
        }
        for route in &self.routes {
            builder = builder.route(route);
        }
        builder.build()
    }

    /// Starting state used for reachability checks.
    fn initial(&self, config: &AgentConfig) -> Option<Node> {
        if config.start_listening {
            if let Some(listen) = &self.listen_state {
                return Some(Node::from(listen.as_str()));
            }
        }
        match &self.sync {
            SyncSpec::Single { initial } => initial.as_deref().map(Node::from),
            SyncSpec::Peer { default, .. } => Some(Node::from(default.as_str())),
            SyncSpec::Channels { .. } => None,
        }
    }

    /// Declare an agent with the standard hooks and every handler in the file.
    /// Must be called inside a tokio runtime.
    pub fn builder(&self, config: AgentConfig) -> Result<AgentBuilder> {
        let graph = self.graph()?;
        let initial = self.initial(&config);
        let mut builder = AgentBuilder::new(config, graph).standard_hooks();

        for rule in &self.rules {
            let trigger = builder.trigger(&rule.trigger)?;
            if rule.event == Action::Move {
                rule.check_move(builder.graph(), &trigger)?;
            }
            let event = Event::with_action(rule.event, trigger);
            let mut handler = MatchRule::new(rule.matcher()?, event);
            if let Some(outbox) = &rule.outbox {
                handler = handler.with_outbox(outbox.as_str());
            }
            builder = builder.on_receive(&rule.route, handler)?;
        }
        for probe in &self.probes {
            let trigger = builder.trigger(&probe.trigger)?;
            builder = builder.on_receive(&probe.state, NodeProbe::new(trigger))?;
        }
        if let Some(control) = &self.control {
            let token = builder.config().control_token.clone();
            let trigger = builder.trigger(&control.trigger)?;
            builder = builder.on_receive(&control.route, ControlGate::new(token, trigger))?;
        }

        for notice in &self.notices {
            let triggers = match &notice.trigger {
                Some(name) => vec![builder.trigger(name)?],
                None => Vec::new(),
            };
            let gate = SendGate::new(notice.actions.iter().copied(), triggers);
            builder = builder.on_send_gated(
                &notice.route,
                gate,
                OutboxNotice::new(notice.outbox.as_str(), notice.text.as_str()),
            )?;
        }
        if let Some(beat) = &self.heartbeat {
            let interval = match beat.interval_ms {
                Some(ms) => Duration::from_millis(ms),
                None => builder.config().send_interval(),
            };
            builder = builder.on_send_every(&beat.route, interval, Heartbeat::new(beat.text.as_str()))?;
        }

        let store = builder.store().clone();
        let sync: Arc<dyn StateSync> = match &self.sync {
            SyncSpec::Single { initial } => {
                let start = match initial {
                    Some(state) => Node::from(state.as_str()),
                    None => builder
                        .graph()
                        .nodes()
                        .iter()
                        .find(|n| Some(n.as_str()) != self.listen_state.as_deref())
                        .cloned()
                        .ok_or_else(|| RapportError::Graph("flow declares no states".into()))?,
                };
                Arc::new(SingleStateSync::new(store.clone(), start))
            }
            SyncSpec::Peer { view, default } => {
                Arc::new(PeerStateSync::new(store.clone(), view.as_str(), default.as_str()))
            }
            SyncSpec::Channels { channels } => {
                Arc::new(ChannelStateSync::new(store.clone(), channels.clone())?)
            }
        };
        let sync: Arc<dyn StateSync> = match &self.listen_state {
            Some(listen) => Arc::new(ListeningGate::new(sync, store, listen.as_str())),
            None => sync,
        };

        builder = builder.state_sync_arc(sync);
        if let Some(initial) = initial {
            builder = builder.initial_state(initial);
        }
        Ok(builder)
    }

    pub fn agent(&self, config: AgentConfig, transport: Arc<dyn Transport>) -> Result<FlowAgent> {
        self.builder(config)?.transport(transport).build()
    }
}
