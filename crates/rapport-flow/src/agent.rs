//! Agent runtime: wires hooks, dispatch, state sync, and senders around one
//! graph and drives them from an inbound channel.
//!
//! Per inbound envelope:
//! 1. RECEIVE hook chain (may drop)
//! 2. upload states
//! 3. dispatch each state key and reduce to a decision
//! 4. record fired activations
//! 5. download candidates
//! 6. gated send handlers, then the SEND hook chain and the transport

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use rapport_route::Route;
use rapport_types::{Envelope, Inbound, Node, Payload, RapportError, Result};

use crate::config::AgentConfig;
use crate::dispatch::{Decision, RouteDispatcher};
use crate::event::Activation;
use crate::events::{EventEmitter, FlowEvent};
use crate::graph::FlowGraph;
use crate::handler::{ReceiveHandler, SendContext, SendHandler};
use crate::hooks::{Direction, EnvelopeValidator, Hook, HookPipeline, SenderAllowlist, SignOutbound};
use crate::sender::{Schedule, SendBinding, SendGate};
use crate::store::StateStore;
use crate::sync::{Candidates, SingleStateSync, StateSnapshot, StateSync};
use crate::transport::Transport;
use crate::triggers::Trigger;
use crate::validation::{validate, validate_or_raise, Diagnostic, FlowPlan, Severity};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What happened to one inbound message.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// `false` when the RECEIVE chain dropped the message.
    pub accepted: bool,
    pub snapshot: Option<StateSnapshot>,
    pub decisions: Vec<Decision>,
}

impl DispatchReport {
    pub fn transitions(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.iter().filter(|d| d.transition().is_some())
    }
}

/// Counts for one round of sending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Payloads returned by send handlers.
    pub produced: usize,
    /// Payloads the SEND chain dropped or left unsigned.
    pub dropped: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl SendReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }

    fn merge(&mut self, other: SendReport) {
        self.produced += other.produced;
        self.dropped += other.dropped;
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Declares an agent's hooks, handlers, and state sync. Must be created inside
/// a tokio runtime, since it starts the state store task.
pub struct AgentBuilder {
    config: AgentConfig,
    graph: Arc<FlowGraph>,
    events: EventEmitter,
    store: StateStore,
    hooks: HookPipeline,
    dispatcher: RouteDispatcher,
    senders: Vec<SendBinding>,
    sync: Option<Arc<dyn StateSync>>,
    initial: Option<Node>,
    transport: Option<Arc<dyn Transport>>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig, graph: FlowGraph) -> Self {
        let events = EventEmitter::new(config.event_capacity);
        let store = StateStore::spawn(config.start_listening);
        Self {
            hooks: HookPipeline::new().with_events(events.clone()),
            dispatcher: RouteDispatcher::new().with_events(events.clone()),
            graph: Arc::new(graph),
            config,
            events,
            store,
            senders: Vec::new(),
            sync: None,
            initial: None,
            transport: None,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn trigger(&self, name: &str) -> Result<Trigger> {
        self.graph.triggers().get(name)
    }

    /// Envelope validation and the sender allowlist on RECEIVE, signing on SEND.
    pub fn standard_hooks(self) -> Self {
        let validator = EnvelopeValidator::new(
            self.config.agent_id.clone(),
            self.config.control_token.clone(),
            self.store.clone(),
        );
        let allowlist = SenderAllowlist::new(self.config.allowlist.clone(), self.events.clone());
        let sign = SignOutbound::new(self.config.agent_id.clone());
        self.hook(Direction::Receive, EnvelopeValidator::PRIORITY, validator)
            .hook(Direction::Receive, SenderAllowlist::PRIORITY, allowlist)
            .hook(Direction::Send, SignOutbound::PRIORITY, sign)
    }

    pub fn hook(mut self, direction: Direction, priority: i32, hook: impl Hook + 'static) -> Self {
        self.hooks.register(direction, priority, hook);
        self
    }

    pub fn on_receive(mut self, route: &str, handler: impl ReceiveHandler + 'static) -> Result<Self> {
        self.on_receive_arc(route, Arc::new(handler))?;
        Ok(self)
    }

    pub fn on_receive_arc(&mut self, route: &str, handler: Arc<dyn ReceiveHandler>) -> Result<Route> {
        self.dispatcher.bind_arc(&self.graph, route, handler)
    }

    /// Periodic sender at the configured send interval.
    pub fn on_send(self, route: &str, handler: impl SendHandler + 'static) -> Result<Self> {
        let interval = self.config.send_interval();
        self.on_send_every(route, interval, handler)
    }

    pub fn on_send_every(
        mut self,
        route: &str,
        interval: Duration,
        handler: impl SendHandler + 'static,
    ) -> Result<Self> {
        self.on_send_arc(route, Schedule::Periodic(interval), Arc::new(handler))?;
        Ok(self)
    }

    /// Sender that runs after a dispatch fires a matching event on `route`.
    pub fn on_send_gated(
        mut self,
        route: &str,
        gate: SendGate,
        handler: impl SendHandler + 'static,
    ) -> Result<Self> {
        self.on_send_arc(route, Schedule::Gated(gate), Arc::new(handler))?;
        Ok(self)
    }

    pub fn on_send_arc(
        &mut self,
        route: &str,
        schedule: Schedule,
        handler: Arc<dyn SendHandler>,
    ) -> Result<Route> {
        let route = match &schedule {
            Schedule::Periodic(interval) => {
                if interval.is_zero() {
                    return Err(RapportError::Validation(format!(
                        "send interval for '{route}' must be positive"
                    )));
                }
                // Periodic senders are labels, not graph positions.
                self.graph.parse_route(route)?
            }
            Schedule::Gated(gate) => {
                for trigger in &gate.triggers {
                    self.graph.triggers().check(trigger)?;
                }
                self.graph.resolve(route)?
            }
        };
        if self
            .senders
            .iter()
            .any(|s| s.route.key() == route.key() && s.schedule.is_gated() == schedule.is_gated())
        {
            return Err(RapportError::DuplicateBinding {
                direction: "send".into(),
                route: route.render(self.graph.style()),
            });
        }
        self.senders
            .push(SendBinding::new(route.clone(), schedule, handler));
        Ok(route)
    }

    pub fn state_sync(mut self, sync: impl StateSync + 'static) -> Self {
        self.sync = Some(Arc::new(sync));
        self
    }

    pub fn state_sync_arc(mut self, sync: Arc<dyn StateSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Starting state, used for reachability checks and the default sync.
    pub fn initial_state(mut self, state: impl Into<Node>) -> Self {
        self.initial = Some(state.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Starting state: the declared one, or the first graph state when the
    /// default single-state sync will be used.
    fn initial(&self) -> Option<Node> {
        match &self.initial {
            Some(state) => Some(state.clone()),
            None if self.sync.is_none() => self.graph.nodes().first().cloned(),
            None => None,
        }
    }

    /// Lint the graph and the bindings registered so far.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let initial = self.initial();
        validate(&FlowPlan {
            graph: &self.graph,
            receive: self.dispatcher.bindings(),
            send: &self.senders,
            initial: initial.as_ref(),
        })
    }

    pub fn build(self) -> Result<FlowAgent> {
        self.config.check()?;
        let initial = self.initial();
        let plan = FlowPlan {
            graph: &self.graph,
            receive: self.dispatcher.bindings(),
            send: &self.senders,
            initial: initial.as_ref(),
        };
        let diagnostics = validate_or_raise(&plan)?;
        let transport = self
            .transport
            .ok_or_else(|| RapportError::Validation("agent has no transport".into()))?;
        for d in diagnostics {
            match d.severity {
                Severity::Warning => tracing::warn!(rule = %d.rule, "{}", d.message),
                _ => tracing::debug!(rule = %d.rule, "{}", d.message),
            }
        }

        let sync = match self.sync {
            Some(sync) => sync,
            None => {
                let initial = initial.ok_or_else(|| {
                    RapportError::Graph("graph declares no states".into())
                })?;
                Arc::new(SingleStateSync::new(self.store.clone(), initial))
            }
        };

        tracing::info!(
            agent = %self.config.agent_id,
            states = self.graph.nodes().len(),
            receive = self.dispatcher.bindings().len(),
            send = self.senders.len(),
            "agent built"
        );

        Ok(FlowAgent {
            config: self.config,
            graph: self.graph,
            events: self.events,
            store: self.store,
            hooks: self.hooks,
            dispatcher: self.dispatcher,
            senders: self.senders,
            sync,
            transport,
        })
    }
}

// ---------------------------------------------------------------------------
// FlowAgent
// ---------------------------------------------------------------------------

pub struct FlowAgent {
    config: AgentConfig,
    graph: Arc<FlowGraph>,
    events: EventEmitter,
    store: StateStore,
    hooks: HookPipeline,
    dispatcher: RouteDispatcher,
    senders: Vec<SendBinding>,
    sync: Arc<dyn StateSync>,
    transport: Arc<dyn Transport>,
}

impl FlowAgent {
    pub fn builder(config: AgentConfig, graph: FlowGraph) -> AgentBuilder {
        AgentBuilder::new(config, graph)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn senders(&self) -> &[SendBinding] {
        &self.senders
    }

    /// Run a raw transport envelope through the RECEIVE chain and dispatch it.
    pub async fn handle_envelope(&self, envelope: Envelope) -> DispatchReport {
        let Some(payload) = self
            .hooks
            .run(Direction::Receive, Payload::Envelope(envelope))
            .await
        else {
            return DispatchReport::default();
        };
        match Inbound::try_from(payload) {
            Ok(inbound) => self.handle_inbound(inbound).await,
            Err(e) => {
                tracing::debug!(error = %e, "receive chain output dropped");
                DispatchReport::default()
            }
        }
    }

    /// Dispatch a message that already passed the RECEIVE chain.
    pub async fn handle_inbound(&self, inbound: Inbound) -> DispatchReport {
        let is_control = inbound.is_control(&self.config.control_token);
        let was_listening = is_control && self.store.is_listening().await.unwrap_or(false);

        let snapshot = match self.sync.upload_states(&inbound).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::debug!("no states to dispatch");
                return DispatchReport {
                    accepted: true,
                    ..DispatchReport::default()
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, "state upload failed");
                return DispatchReport {
                    accepted: true,
                    ..DispatchReport::default()
                };
            }
        };

        let mut decisions = Vec::new();
        let mut keyed: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        let mut fired: Vec<Activation> = Vec::new();
        for (key, state) in snapshot.entries() {
            let decision = self
                .dispatcher
                .dispatch(&self.graph, &self.store, &key, &state, &inbound)
                .await;
            self.report(&decision);
            keyed.insert(key, decision.candidates.clone());
            fired.extend(decision.activations.iter().cloned());
            decisions.push(decision);
        }

        if let Err(e) = self.store.record_activations(fired).await {
            tracing::warn!(error = %e, "could not record activations");
        }

        let candidates = if snapshot.is_single() {
            Candidates::Flat(keyed.into_values().next().unwrap_or_default())
        } else {
            Candidates::Keyed(keyed)
        };
        if let Err(e) = self.sync.download_states(candidates).await {
            tracing::warn!(error = %e, "state download failed");
        }

        if was_listening && !self.store.is_listening().await.unwrap_or(true) {
            self.events.emit(FlowEvent::ListeningEnded);
        }

        DispatchReport {
            accepted: true,
            snapshot: Some(snapshot),
            decisions,
        }
    }

    fn report(&self, decision: &Decision) {
        let style = self.graph.style();
        for activation in &decision.activations {
            self.events.emit(FlowEvent::TriggerRecorded {
                key: decision.key.clone(),
                route: activation.route.render(style),
                action: activation.action.to_string(),
                trigger: activation.trigger.name().to_string(),
            });
        }
        if let Some(t) = decision.transition() {
            let to = decision.next_state();
            tracing::info!(
                key = %decision.key,
                from = %decision.state,
                to = %to,
                trigger = %t.trigger,
                "transition"
            );
            self.events.emit(FlowEvent::Transitioned {
                key: decision.key.clone(),
                from_state: decision.state.to_string(),
                to_state: to.to_string(),
                trigger: t.trigger.name().to_string(),
            });
        }
    }

    /// Run every gated sender whose gate the activations recorded since the
    /// last call open.
    pub async fn run_gated_sends(&self) -> SendReport {
        let activations = match self.store.take_activations().await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "could not read activations");
                return SendReport::default();
            }
        };
        let mut report = SendReport::default();
        if activations.is_empty() {
            return report;
        }
        for binding in &self.senders {
            if let Some(activation) = binding.matching(&activations) {
                report.merge(self.run_binding(binding, Some(activation)).await);
            }
        }
        report
    }

    /// One cycle of the periodic sender at `index`. Skipped while listening.
    pub async fn run_periodic(&self, index: usize) -> SendReport {
        let Some(binding) = self.senders.get(index) else {
            return SendReport::default();
        };
        if binding.schedule.is_gated() {
            return SendReport::default();
        }
        match self.store.is_listening().await {
            Ok(false) => self.run_binding(binding, None).await,
            Ok(true) => SendReport::default(),
            Err(e) => {
                tracing::warn!(error = %e, "store unavailable");
                SendReport::default()
            }
        }
    }

    /// One cycle of every periodic sender.
    pub async fn run_periodic_all(&self) -> SendReport {
        let mut report = SendReport::default();
        for index in 0..self.senders.len() {
            report.merge(self.run_periodic(index).await);
        }
        report
    }

    async fn run_binding(&self, binding: &SendBinding, activation: Option<&Activation>) -> SendReport {
        let cx = SendContext {
            route: &binding.route,
            activation,
            store: &self.store,
            events: &self.events,
        };
        let label = binding.route.render(self.graph.style());
        match binding.handler.produce(&cx).await {
            Ok(payloads) => self.emit(&label, payloads).await,
            Err(e) => {
                tracing::warn!(route = %label, error = %e, "send handler failed");
                self.events.emit(FlowEvent::SendFailed {
                    route: label,
                    error: e.to_string(),
                });
                SendReport::default()
            }
        }
    }

    /// Send ad-hoc payloads through the SEND chain.
    pub async fn send(&self, payloads: Vec<Payload>) -> SendReport {
        self.emit("direct", payloads).await
    }

    async fn emit(&self, label: &str, payloads: Vec<Payload>) -> SendReport {
        let mut report = SendReport::default();
        for payload in payloads {
            report.produced += 1;
            let message = match self.hooks.run(Direction::Send, payload).await {
                Some(Payload::Structured(message)) if message.from.is_some() => message,
                Some(other) => {
                    tracing::debug!(route = label, kind = other.kind(), "outbound payload not signed, not sent");
                    report.dropped += 1;
                    continue;
                }
                None => {
                    report.dropped += 1;
                    continue;
                }
            };
            match self.transport.send(message).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(route = label, error = %e, "send failed");
                    self.events.emit(FlowEvent::SendFailed {
                        route: label.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Start the receive loop and one task per periodic sender.
    pub fn spawn(self: Arc<Self>, mut inbound: mpsc::Receiver<Envelope>) -> AgentHandle {
        let (shutdown, watcher) = watch::channel(false);
        let mut tasks = Vec::new();

        let agent = Arc::clone(&self);
        let mut stop = watcher.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    next = inbound.recv() => match next {
                        Some(envelope) => {
                            agent.handle_envelope(envelope).await;
                            agent.run_gated_sends().await;
                        }
                        None => break,
                    },
                }
            }
            tracing::debug!(agent = %agent.config.agent_id, "receive loop stopped");
        }));

        for (index, binding) in self.senders.iter().enumerate() {
            let Schedule::Periodic(interval) = binding.schedule else {
                continue;
            };
            let agent = Arc::clone(&self);
            let mut stop = watcher.clone();
            let idle = self.config.idle_interval();
            tasks.push(tokio::spawn(async move {
                loop {
                    let wait = match agent.store.is_listening().await {
                        Ok(true) => idle,
                        Ok(false) => interval,
                        Err(_) => break,
                    };
                    tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                            continue;
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                    agent.run_periodic(index).await;
                }
            }));
        }

        AgentHandle { shutdown, tasks }
    }
}

/// Running agent tasks. Dropping the handle also stops them.
pub struct AgentHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
