//! Send bindings: periodic senders and senders gated on fired events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rapport_route::Route;
use rapport_types::Result;

use crate::event::{Action, Activation};
use crate::events::{EventEmitter, FlowEvent};
use crate::handler::SendHandler;
use crate::store::{OutboxEntry, StateStore};
use crate::triggers::Trigger;

/// Fires a send handler when the latest activation on its route carries one
/// of `actions` and one of `triggers`. An empty set matches anything.
#[derive(Debug, Clone, Default)]
pub struct SendGate {
    pub actions: HashSet<Action>,
    pub triggers: HashSet<Trigger>,
}

impl SendGate {
    pub fn new(
        actions: impl IntoIterator<Item = Action>,
        triggers: impl IntoIterator<Item = Trigger>,
    ) -> Self {
        Self {
            actions: actions.into_iter().collect(),
            triggers: triggers.into_iter().collect(),
        }
    }

    pub fn admits(&self, activation: &Activation) -> bool {
        (self.actions.is_empty() || self.actions.contains(&activation.action))
            && (self.triggers.is_empty() || self.triggers.contains(&activation.trigger))
    }
}

#[derive(Debug, Clone)]
pub enum Schedule {
    /// Run every interval while not listening.
    Periodic(Duration),
    /// Run after a dispatch whose activation on this route opens the gate.
    Gated(SendGate),
}

impl Schedule {
    pub fn is_gated(&self) -> bool {
        matches!(self, Schedule::Gated(_))
    }
}

pub struct SendBinding {
    pub route: Route,
    pub schedule: Schedule,
    pub(crate) handler: Arc<dyn SendHandler>,
}

impl SendBinding {
    pub fn new(route: Route, schedule: Schedule, handler: Arc<dyn SendHandler>) -> Self {
        Self {
            route,
            schedule,
            handler,
        }
    }

    /// The latest activation on this binding's route that opens its gate.
    pub fn matching<'a>(&self, activations: &'a [Activation]) -> Option<&'a Activation> {
        let Schedule::Gated(gate) = &self.schedule else {
            return None;
        };
        activations
            .iter()
            .rev()
            .find(|a| a.route.key() == self.route.key() && gate.admits(a))
    }
}

/// Take every entry of `outbox` in one step and report the drain.
///
/// The outbox is empty afterwards whatever happens to the entries, so each
/// entry is handed out exactly once.
pub async fn drain_outbox(
    store: &StateStore,
    events: &EventEmitter,
    outbox: &str,
) -> Result<Vec<OutboxEntry>> {
    let entries = store.drain(outbox).await?;
    if !entries.is_empty() {
        tracing::debug!(outbox, entries = entries.len(), "outbox drained");
    }
    events.emit(FlowEvent::OutboxDrained {
        outbox: outbox.to_string(),
        entries: entries.len(),
    });
    Ok(entries)
}
