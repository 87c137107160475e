//! Per-agent flow engine: state graph, hook pipeline, route dispatch, and
//! peer-state synchronization.
//!
//! An agent owns one [`FlowGraph`]. Inbound envelopes pass the RECEIVE hook
//! chain, the agent's [`StateSync`] uploads the states they concern, the
//! [`RouteDispatcher`] runs the handlers eligible in each state and reduces
//! their events, and the chosen next states are downloaded back into the
//! [`StateStore`]. Send handlers run on a timer or when a dispatch fires a
//! matching event; their output passes the SEND hook chain before reaching
//! the [`Transport`].

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod events;
pub mod flowfile;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod hooks;
pub mod sender;
pub mod store;
pub mod sync;
pub mod transport;
pub mod triggers;
pub mod validation;

pub use agent::{AgentBuilder, AgentHandle, DispatchReport, FlowAgent, SendReport};
pub use config::AgentConfig;
pub use dispatch::{Decision, ReceiveBinding, RouteDispatcher};
pub use event::{Action, Activation, Event};
pub use events::{drain_events, EventEmitter, FlowEvent};
pub use flowfile::{FlowFile, SyncSpec};
pub use graph::{EdgeDescriptor, FlowEdge, FlowGraph, FlowGraphBuilder, GraphDescriptor};
pub use handler::{
    receive_fn, send_fn, HandlerContext, ReceiveCall, ReceiveHandler, SendContext, SendHandler,
};
pub use handlers::{ControlGate, Heartbeat, MatchRule, Matcher, NodeProbe, OutboxNotice};
pub use hooks::{
    hook_fn, Direction, EnvelopeValidator, Hook, HookPipeline, SenderAllowlist, SignOutbound,
};
pub use sender::{drain_outbox, Schedule, SendBinding, SendGate};
pub use store::{OutboxEntry, PeerRow, StateStore, StoreSnapshot};
pub use sync::{
    Candidates, Channel, ChannelStateSync, ListeningGate, PeerStateSync, SingleStateSync,
    StateSnapshot, StateSync,
};
pub use transport::{ChannelTransport, RecordingTransport, Transport};
pub use triggers::{Trigger, TriggerSet};
pub use validation::{validate, validate_or_raise, Diagnostic, FlowPlan, LintRule, Severity};

pub use rapport_route::{parse_route, ArrowStyle, Route};
pub use rapport_types::{Envelope, Inbound, Message, Node, Payload, PeerId, RapportError, Result};
