use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use rapport_route::{parse_route, ArrowStyle, Route};
use rapport_types::{Node, RapportError, Result};

use crate::triggers::{next_scope, Trigger, TriggerSet};

/// Directed edge between two declared states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEdge {
    pub source: Node,
    pub target: Node,
    /// Triggers valid on this edge. Empty means every graph trigger is valid.
    pub triggers: Vec<String>,
}

impl FlowEdge {
    pub fn new(source: impl Into<Node>, target: impl Into<Node>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            triggers: Vec::new(),
        }
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    pub fn route(&self) -> Route {
        Route::Edge {
            source: self.source.clone(),
            target: self.target.clone(),
            triggers: self.triggers.clone(),
        }
    }

    /// Whether `trigger` may move a handler along this edge.
    pub fn allows(&self, trigger: &Trigger) -> bool {
        self.triggers.is_empty() || self.triggers.iter().any(|t| t == trigger.name())
    }
}

/// Immutable state graph of one agent flow.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    style: ArrowStyle,
    nodes: Vec<Node>,
    node_set: HashSet<Node>,
    edges: Vec<FlowEdge>,
    /// Maps a source state to a range (start, count) into the sorted `edges` vec.
    adjacency: HashMap<Node, (usize, usize)>,
    triggers: TriggerSet,
}

/// Serializable projection of a graph, consumed by visualizers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescriptor {
    pub nodes: Vec<String>,
    pub edges: Vec<EdgeDescriptor>,
    pub triggers: Vec<String>,
    pub arrow: ArrowStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    pub source: String,
    pub target: String,
    pub route: String,
    pub triggers: Vec<String>,
}

// --- Name checks ---

fn check_name(kind: &str, name: &str, style: &ArrowStyle) -> Result<()> {
    match parse_route(name, style) {
        Ok(Route::Node { node }) if node == name => Ok(()),
        _ => Err(RapportError::Graph(format!("invalid {kind} name '{name}'"))),
    }
}

impl FlowGraph {
    pub fn builder(style: ArrowStyle) -> FlowGraphBuilder {
        FlowGraphBuilder::new(style)
    }

    /// Declare a graph from its states, edges, and any extra graph-wide
    /// triggers. Edge trigger labels are added to the trigger set.
    pub fn declare<N, E, T>(style: ArrowStyle, nodes: N, edges: E, triggers: T) -> Result<Self>
    where
        N: IntoIterator,
        N::Item: Into<Node>,
        E: IntoIterator<Item = FlowEdge>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        style.check()?;

        let mut ordered = Vec::new();
        let mut node_set = HashSet::new();
        for node in nodes {
            let node: Node = node.into();
            check_name("state", node.as_str(), &style)?;
            if node_set.insert(node.clone()) {
                ordered.push(node);
            }
        }

        let mut trigger_names: Vec<String> = Vec::new();
        let mut add_trigger = |name: String| -> Result<()> {
            check_name("trigger", &name, &style)?;
            if !trigger_names.contains(&name) {
                trigger_names.push(name);
            }
            Ok(())
        };
        for t in triggers {
            add_trigger(t.into())?;
        }

        let mut all_edges: Vec<FlowEdge> = Vec::new();
        for edge in edges {
            for endpoint in [&edge.source, &edge.target] {
                if !node_set.contains(endpoint) {
                    return Err(RapportError::Graph(format!(
                        "edge {} references undeclared state '{}'",
                        edge.route().render(&style),
                        endpoint
                    )));
                }
            }
            if all_edges
                .iter()
                .any(|e| e.source == edge.source && e.target == edge.target)
            {
                return Err(RapportError::Graph(format!(
                    "edge {} declared twice",
                    edge.route().render(&style)
                )));
            }
            for t in &edge.triggers {
                add_trigger(t.clone())?;
            }
            all_edges.push(edge);
        }

        // Stable sort keeps declaration order among edges of the same source.
        all_edges.sort_by(|a, b| a.source.cmp(&b.source));
        let mut adjacency = HashMap::new();
        let mut i = 0;
        while i < all_edges.len() {
            let start = i;
            let source = all_edges[i].source.clone();
            while i < all_edges.len() && all_edges[i].source == source {
                i += 1;
            }
            adjacency.insert(source, (start, i - start));
        }

        Ok(FlowGraph {
            triggers: TriggerSet::new(next_scope(), trigger_names),
            style,
            nodes: ordered,
            node_set,
            edges: all_edges,
            adjacency,
        })
    }

    /// Parse route text in this graph's arrow style.
    pub fn parse_route(&self, text: &str) -> Result<Route> {
        parse_route(text, &self.style)
    }

    /// Parse route text and check it names a declared state or edge, and that
    /// any bracketed triggers are valid on that edge.
    pub fn resolve(&self, text: &str) -> Result<Route> {
        let route = self.parse_route(text)?;
        self.check_route(&route)?;
        Ok(route)
    }

    pub fn check_route(&self, route: &Route) -> Result<()> {
        match route {
            Route::Node { node } => {
                if !self.has_node(node.as_str()) {
                    return Err(RapportError::Graph(format!(
                        "route references undeclared state '{node}'"
                    )));
                }
            }
            Route::Edge {
                source,
                target,
                triggers,
            } => {
                let edge = self.edge(source.as_str(), target.as_str()).ok_or_else(|| {
                    RapportError::Graph(format!(
                        "route {} references an undeclared edge",
                        route.render(&self.style)
                    ))
                })?;
                for name in triggers {
                    let trigger = self.triggers.get(name)?;
                    if !edge.allows(&trigger) {
                        return Err(RapportError::Graph(format!(
                            "trigger '{name}' is not valid on edge {}",
                            edge.route().render(&self.style)
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn style(&self) -> &ArrowStyle {
        &self.style
    }

    pub fn triggers(&self) -> &TriggerSet {
        &self.triggers
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.node_set.contains(name)
    }

    /// States in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[FlowEdge] {
        &self.edges
    }

    pub fn edge(&self, source: &str, target: &str) -> Option<&FlowEdge> {
        self.outgoing_edges(source)
            .iter()
            .find(|e| e.target == target)
    }

    pub fn outgoing_edges(&self, source: &str) -> &[FlowEdge] {
        match self.adjacency.get(source) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    pub fn incoming_edges<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a FlowEdge> {
        self.edges.iter().filter(move |e| e.target == target)
    }

    pub fn descriptor(&self) -> GraphDescriptor {
        GraphDescriptor {
            nodes: self.nodes.iter().map(|n| n.to_string()).collect(),
            edges: self
                .edges
                .iter()
                .map(|e| EdgeDescriptor {
                    source: e.source.to_string(),
                    target: e.target.to_string(),
                    route: e.route().render(&self.style),
                    triggers: e.triggers.clone(),
                })
                .collect(),
            triggers: self.triggers.names().map(String::from).collect(),
            arrow: self.style.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Incremental graph declaration. Errors are deferred to [`build`](Self::build).
#[derive(Debug)]
pub struct FlowGraphBuilder {
    style: ArrowStyle,
    nodes: Vec<Node>,
    edges: Vec<FlowEdge>,
    triggers: Vec<String>,
    error: Option<RapportError>,
}

impl FlowGraphBuilder {
    pub fn new(style: ArrowStyle) -> Self {
        Self {
            style,
            nodes: Vec::new(),
            edges: Vec::new(),
            triggers: Vec::new(),
            error: None,
        }
    }

    pub fn state(mut self, name: impl Into<Node>) -> Self {
        self.nodes.push(name.into());
        self
    }

    pub fn trigger(mut self, name: impl Into<String>) -> Self {
        self.triggers.push(name.into());
        self
    }

    pub fn edge<S: Into<String>>(
        mut self,
        source: impl Into<Node>,
        target: impl Into<Node>,
        triggers: impl IntoIterator<Item = S>,
    ) -> Self {
        self.edges
            .push(FlowEdge::new(source, target).with_triggers(triggers));
        self
    }

    /// Declare the states (and for edge routes, the edge) named by route text.
    pub fn route(mut self, text: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match parse_route(text, &self.style) {
            Ok(Route::Node { node }) => self.nodes.push(node),
            Ok(Route::Edge {
                source,
                target,
                triggers,
            }) => {
                self.nodes.push(source.clone());
                self.nodes.push(target.clone());
                match self
                    .edges
                    .iter_mut()
                    .find(|e| e.source == source && e.target == target)
                {
                    Some(existing) => {
                        for t in triggers {
                            if !existing.triggers.contains(&t) {
                                existing.triggers.push(t);
                            }
                        }
                    }
                    None => self
                        .edges
                        .push(FlowEdge::new(source, target).with_triggers(triggers)),
                }
            }
            Err(e) => self.error = Some(e),
        }
        self
    }

    pub fn build(self) -> Result<FlowGraph> {
        if let Some(e) = self.error {
            return Err(e);
        }
        FlowGraph::declare(self.style, self.nodes, self.edges, self.triggers)
    }
}
