//! Flow validation: lint rules over a graph and its bindings.
//!
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail
//! on the first `Error`-severity issue. Agents run [`validate_or_raise`] when
//! they are built.

use std::collections::{HashSet, VecDeque};

use rapport_route::Route;
use rapport_types::{Node, RapportError, Result};

use crate::dispatch::ReceiveBinding;
use crate::event::Action;
use crate::graph::FlowGraph;
use crate::sender::{Schedule, SendBinding};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub state: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Everything a rule may inspect.
pub struct FlowPlan<'a> {
    pub graph: &'a FlowGraph,
    pub receive: &'a [ReceiveBinding],
    pub send: &'a [SendBinding],
    /// Starting state, when known. Enables the reachability rule.
    pub initial: Option<&'a Node>,
}

impl<'a> FlowPlan<'a> {
    pub fn new(graph: &'a FlowGraph) -> Self {
        Self {
            graph,
            receive: &[],
            send: &[],
            initial: None,
        }
    }

    fn has_receive(&self, route: &Route) -> bool {
        self.receive.iter().any(|b| b.route.key() == route.key())
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, plan: &FlowPlan<'_>) -> Vec<Diagnostic>;
}

fn diagnostic(rule: &dyn LintRule, severity: Severity, message: String) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        state: None,
        edge: None,
        fix: None,
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct DuplicateSendRule;
impl LintRule for DuplicateSendRule {
    fn name(&self) -> &str { "duplicate_send" }
    fn apply(&self, plan: &FlowPlan<'_>) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for binding in plan.send {
            if !seen.insert((binding.route.key(), binding.schedule.is_gated())) {
                out.push(Diagnostic {
                    fix: Some("Merge the two send handlers into one".into()),
                    ..diagnostic(
                        self,
                        Severity::Error,
                        format!(
                            "Route '{}' has more than one {} send handler",
                            binding.route.render(plan.graph.style()),
                            if binding.schedule.is_gated() { "gated" } else { "periodic" }
                        ),
                    )
                });
            }
        }
        out
    }
}

struct GateNeverOpensRule;
impl LintRule for GateNeverOpensRule {
    fn name(&self) -> &str { "gate_never_opens" }
    fn apply(&self, plan: &FlowPlan<'_>) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for binding in plan.send {
            let Schedule::Gated(gate) = &binding.schedule else {
                continue;
            };
            let rendered = binding.route.render(plan.graph.style());
            match &binding.route {
                Route::Node { node } => {
                    if !gate.actions.is_empty() && gate.actions.iter().all(|a| *a == Action::Move) {
                        out.push(Diagnostic {
                            state: Some(node.to_string()),
                            fix: Some("Gate on an edge route, or on stay/test".into()),
                            ..diagnostic(
                                self,
                                Severity::Error,
                                format!("Send on '{rendered}' waits for a move, but node routes never move"),
                            )
                        });
                    }
                }
                Route::Edge { source, target, .. } => {
                    let Some(edge) = plan.graph.edge(source.as_str(), target.as_str()) else {
                        continue;
                    };
                    if !gate.triggers.is_empty() && !gate.triggers.iter().any(|t| edge.allows(t)) {
                        out.push(Diagnostic {
                            edge: Some((source.to_string(), target.to_string())),
                            ..diagnostic(
                                self,
                                Severity::Error,
                                format!("None of the gate triggers of '{rendered}' are valid on that edge"),
                            )
                        });
                    }
                }
            }
        }
        out
    }
}

struct UnboundEdgeRule;
impl LintRule for UnboundEdgeRule {
    fn name(&self) -> &str { "unbound_edge" }
    fn apply(&self, plan: &FlowPlan<'_>) -> Vec<Diagnostic> {
        plan.graph
            .edges()
            .iter()
            .filter(|e| !plan.has_receive(&e.route()))
            .map(|e| Diagnostic {
                edge: Some((e.source.to_string(), e.target.to_string())),
                fix: Some("Register a receive handler on the edge".into()),
                ..diagnostic(
                    self,
                    Severity::Warning,
                    format!(
                        "Edge '{}' has no receive handler and can never be taken",
                        e.route().render(plan.graph.style())
                    ),
                )
            })
            .collect()
    }
}

struct SilentStateRule;
impl LintRule for SilentStateRule {
    fn name(&self) -> &str { "silent_state" }
    fn apply(&self, plan: &FlowPlan<'_>) -> Vec<Diagnostic> {
        plan.graph
            .nodes()
            .iter()
            .filter(|n| !plan.receive.iter().any(|b| b.route.source() == *n))
            .map(|n| Diagnostic {
                state: Some(n.to_string()),
                ..diagnostic(
                    self,
                    Severity::Info,
                    format!("No receive handler runs in state '{n}'"),
                )
            })
            .collect()
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, plan: &FlowPlan<'_>) -> Vec<Diagnostic> {
        let Some(start) = plan.initial else {
            return vec![];
        };
        if !plan.graph.has_node(start.as_str()) {
            return vec![diagnostic(
                self,
                Severity::Error,
                format!("Initial state '{start}' is not declared"),
            )];
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start.clone());
        queue.push_back(start.clone());
        while let Some(current) = queue.pop_front() {
            for edge in plan.graph.outgoing_edges(current.as_str()) {
                if visited.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }

        plan.graph
            .nodes()
            .iter()
            .filter(|n| !visited.contains(*n))
            .map(|n| Diagnostic {
                state: Some(n.to_string()),
                fix: Some(format!("Add an edge leading to '{n}' or remove it")),
                ..diagnostic(
                    self,
                    Severity::Warning,
                    format!("State '{n}' is not reachable from '{start}'"),
                )
            })
            .collect()
    }
}

/// Run all lint rules and return the diagnostics.
pub fn validate(plan: &FlowPlan<'_>) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(DuplicateSendRule),
        Box::new(GateNeverOpensRule),
        Box::new(UnboundEdgeRule),
        Box::new(SilentStateRule),
        Box::new(ReachabilityRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(plan));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(plan: &FlowPlan<'_>) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(plan);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(RapportError::Validation(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
