//! Route dispatch: pick the handlers eligible in a state, run them, and reduce
//! their events into one [`Decision`].
//!
//! Reduction rules:
//! 1. The first-registered handler that returns `Move` on an edge wins; its
//!    target is the first candidate, other `Move` targets follow in
//!    registration order.
//! 2. A `Move` whose trigger is not valid on its edge, or that comes from a
//!    node route, counts as `Stay`.
//! 3. Without a `Move`, `Stay`/`Test` events are recorded and the candidates
//!    are just the current state.

use std::sync::Arc;

use rapport_route::Route;
use rapport_types::{Inbound, Node, RapportError, Result};

use crate::event::{Action, Activation, Event};
use crate::events::{EventEmitter, FlowEvent};
use crate::graph::FlowGraph;
use crate::handler::{HandlerContext, ReceiveHandler};
use crate::store::StateStore;

pub struct ReceiveBinding {
    pub route: Route,
    handler: Arc<dyn ReceiveHandler>,
}

/// Outcome of dispatching one message under one state key.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub key: String,
    pub state: Node,
    /// Possible next states, most preferred first. Never empty.
    pub candidates: Vec<Node>,
    /// Fired events to remember for gated senders. The winning `Move`, if
    /// any, comes first.
    pub activations: Vec<Activation>,
    /// Number of handlers invoked.
    pub invoked: usize,
}

impl Decision {
    /// The winning `Move`, if the dispatch transitioned.
    pub fn transition(&self) -> Option<&Activation> {
        self.activations
            .first()
            .filter(|a| a.action == Action::Move)
    }

    pub fn next_state(&self) -> &Node {
        self.candidates.first().unwrap_or(&self.state)
    }
}

/// Ordered list of receive bindings.
#[derive(Default)]
pub struct RouteDispatcher {
    bindings: Vec<ReceiveBinding>,
    events: EventEmitter,
}

impl RouteDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Bind `handler` to `route`. The route must name a declared state or
    /// edge, and no other receive handler may already hold it.
    pub fn bind(
        &mut self,
        graph: &FlowGraph,
        route: &str,
        handler: impl ReceiveHandler + 'static,
    ) -> Result<Route> {
        self.bind_arc(graph, route, Arc::new(handler))
    }

    pub fn bind_arc(
        &mut self,
        graph: &FlowGraph,
        route: &str,
        handler: Arc<dyn ReceiveHandler>,
    ) -> Result<Route> {
        let route = graph.resolve(route)?;
        if self.is_bound(&route) {
            return Err(RapportError::DuplicateBinding {
                direction: "receive".into(),
                route: route.render(graph.style()),
            });
        }
        self.bindings.push(ReceiveBinding {
            route: route.clone(),
            handler,
        });
        Ok(route)
    }

    pub fn is_bound(&self, route: &Route) -> bool {
        self.bindings.iter().any(|b| b.route.key() == route.key())
    }

    pub fn bindings(&self) -> &[ReceiveBinding] {
        &self.bindings
    }

    /// Bindings that apply in `state`: its node route and edges leaving it,
    /// in registration order.
    pub fn eligible<'a>(&'a self, state: &'a Node) -> impl Iterator<Item = &'a ReceiveBinding> {
        self.bindings.iter().filter(move |b| b.route.source() == state)
    }

    pub async fn dispatch(
        &self,
        graph: &FlowGraph,
        store: &StateStore,
        key: &str,
        state: &Node,
        inbound: &Inbound,
    ) -> Decision {
        let mut moves: Vec<(&ReceiveBinding, Activation)> = Vec::new();
        // The flag is false for a `Move` downgraded to `Stay`.
        let mut others: Vec<(&ReceiveBinding, Activation, bool)> = Vec::new();
        let mut invoked = 0;

        for binding in self.eligible(state) {
            invoked += 1;
            let cx = HandlerContext {
                key,
                state,
                route: &binding.route,
                store,
                triggers: graph.triggers(),
            };
            let event = match binding.handler.handle(&cx, inbound).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    self.handler_failed(graph, key, &binding.route, &e);
                    continue;
                }
            };

            let trigger = event.trigger().clone();
            if !graph.triggers().contains(&trigger) {
                let route = binding.route.render(graph.style());
                tracing::warn!(key, route = %route, trigger = %trigger, "handler returned a trigger from another graph");
                self.events.emit(FlowEvent::HandlerFailed {
                    route,
                    error: format!("unknown trigger '{trigger}'"),
                });
                continue;
            }

            let allowed = binding
                .route
                .target()
                .and_then(|target| graph.edge(state.as_str(), target.as_str()))
                .is_some_and(|edge| edge.allows(&trigger));
            let kept = allowed || !matches!(event, Event::Move(_));
            let action = match event {
                Event::Move(_) if allowed => Action::Move,
                Event::Move(_) => {
                    tracing::debug!(key, route = %binding.route.render(graph.style()), trigger = %trigger, "move not valid here, staying");
                    Action::Stay
                }
                other => other.action(),
            };
            let activation = Activation {
                route: binding.route.clone(),
                key: key.to_string(),
                action,
                trigger,
            };
            if action == Action::Move {
                moves.push((binding, activation));
            } else {
                others.push((binding, activation, kept));
            }
        }

        let mut candidates: Vec<Node> = Vec::new();
        for (_, m) in &moves {
            if let Some(target) = m.route.target() {
                if !candidates.contains(target) {
                    candidates.push(target.clone());
                }
            }
        }
        if candidates.is_empty() {
            candidates.push(state.clone());
        }

        let mut activations = Vec::with_capacity(1 + others.len());
        let mut fired = Vec::with_capacity(1 + others.len());
        let mut moves = moves.into_iter();
        if let Some((binding, winner)) = moves.next() {
            fired.push((binding, activations.len()));
            activations.push(winner);
        }
        for (_, loser) in moves {
            tracing::debug!(key, route = %loser.route.render(graph.style()), "move outranked by an earlier binding");
        }
        for (binding, activation, kept) in others {
            if kept {
                fired.push((binding, activations.len()));
            }
            activations.push(activation);
        }

        for (binding, index) in fired {
            let cx = HandlerContext {
                key,
                state,
                route: &binding.route,
                store,
                triggers: graph.triggers(),
            };
            if let Err(e) = binding.handler.fired(&cx, inbound, &activations[index]).await {
                self.handler_failed(graph, key, &binding.route, &e);
            }
        }

        Decision {
            key: key.to_string(),
            state: state.clone(),
            candidates,
            activations,
            invoked,
        }
    }

    fn handler_failed(&self, graph: &FlowGraph, key: &str, route: &Route, e: &RapportError) {
        let route = route.render(graph.style());
        let err = RapportError::HandlerFailure {
            route: route.clone(),
            message: e.to_string(),
        };
        tracing::warn!(key, error = %err, "receive handler failed");
        self.events.emit(FlowEvent::HandlerFailed {
            route,
            error: e.to_string(),
        });
    }
}
