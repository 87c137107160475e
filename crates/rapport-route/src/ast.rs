use serde::{Deserialize, Serialize};

use rapport_types::{Node, RapportError, Result};

/// Describes how arrows are written in route expressions.
///
/// With the default style an edge reads `A --> B`, and an edge carrying
/// triggers reads `A --[ ok, error ]--> B`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrowStyle {
    pub stem: String,
    pub brackets: (String, String),
    pub separator: String,
    pub tip: String,
}

impl ArrowStyle {
    pub fn new(
        stem: impl Into<String>,
        brackets: (impl Into<String>, impl Into<String>),
        separator: impl Into<String>,
        tip: impl Into<String>,
    ) -> Result<Self> {
        let style = Self {
            stem: stem.into(),
            brackets: (brackets.0.into(), brackets.1.into()),
            separator: separator.into(),
            tip: tip.into(),
        };
        style.check()?;
        Ok(style)
    }

    /// Reject styles whose pieces would make route text ambiguous.
    pub fn check(&self) -> Result<()> {
        let pieces = [
            ("stem", &self.stem),
            ("open bracket", &self.brackets.0),
            ("close bracket", &self.brackets.1),
            ("separator", &self.separator),
            ("tip", &self.tip),
        ];
        for (name, piece) in pieces {
            if piece.is_empty() {
                return Err(RapportError::Graph(format!("arrow style {name} is empty")));
            }
            if piece.chars().any(is_name_char) || piece.chars().any(char::is_whitespace) {
                return Err(RapportError::Graph(format!(
                    "arrow style {name} '{piece}' overlaps with state names or whitespace"
                )));
            }
        }
        // A piece that is a prefix of another can be matched in its place.
        for (i, (a_name, a)) in pieces.iter().enumerate() {
            for (b_name, b) in &pieces[i + 1..] {
                if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                    return Err(RapportError::Graph(format!(
                        "arrow style {a_name} '{a}' overlaps with {b_name} '{b}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The bare arrow, e.g. `-->`.
    pub fn arrow(&self) -> String {
        format!("{}{}{}", self.stem, self.stem, self.tip)
    }
}

impl Default for ArrowStyle {
    fn default() -> Self {
        Self {
            stem: "-".into(),
            brackets: ("[".into(), "]".into()),
            separator: ",".into(),
            tip: ">".into(),
        }
    }
}

/// Characters allowed in state and trigger names.
pub(crate) fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// A parsed route expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    /// Bound to one state.
    Node { node: Node },
    /// Bound to the edge `source -> target`, optionally labelled with triggers.
    Edge {
        source: Node,
        target: Node,
        triggers: Vec<String>,
    },
}

impl Route {
    pub fn node(name: impl Into<Node>) -> Self {
        Route::Node { node: name.into() }
    }

    pub fn edge(source: impl Into<Node>, target: impl Into<Node>) -> Self {
        Route::Edge {
            source: source.into(),
            target: target.into(),
            triggers: Vec::new(),
        }
    }

    pub fn is_edge(&self) -> bool {
        matches!(self, Route::Edge { .. })
    }

    /// The state a handler on this route is eligible in: the node itself, or
    /// the edge source.
    pub fn source(&self) -> &Node {
        match self {
            Route::Node { node } => node,
            Route::Edge { source, .. } => source,
        }
    }

    pub fn target(&self) -> Option<&Node> {
        match self {
            Route::Node { .. } => None,
            Route::Edge { target, .. } => Some(target),
        }
    }

    pub fn triggers(&self) -> &[String] {
        match self {
            Route::Node { .. } => &[],
            Route::Edge { triggers, .. } => triggers,
        }
    }

    /// Identity of the route ignoring trigger labels: two routes with the same
    /// key bind the same node or edge.
    pub fn key(&self) -> (Node, Option<Node>) {
        (self.source().clone(), self.target().cloned())
    }

    /// Write the route back as text in the given style.
    pub fn render(&self, style: &ArrowStyle) -> String {
        match self {
            Route::Node { node } => node.to_string(),
            Route::Edge {
                source,
                target,
                triggers,
            } if triggers.is_empty() => format!("{} {} {}", source, style.arrow(), target),
            Route::Edge {
                source,
                target,
                triggers,
            } => {
                let sep = format!("{} ", style.separator);
                format!(
                    "{source} {stem}{stem}{open} {labels} {close}{stem}{stem}{tip} {target}",
                    stem = style.stem,
                    open = style.brackets.0,
                    close = style.brackets.1,
                    tip = style.tip,
                    labels = triggers.join(&sep),
                )
            }
        }
    }
}
