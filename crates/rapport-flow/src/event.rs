//! Event algebra returned by receive handlers.

use std::fmt;

use serde::{Deserialize, Serialize};

use rapport_route::Route;

use crate::triggers::Trigger;

/// What a receive handler reports for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Observed something; no transition.
    Test(Trigger),
    /// Take the handler's edge.
    Move(Trigger),
    /// Stay in the current state.
    Stay(Trigger),
}

impl Event {
    pub fn trigger(&self) -> &Trigger {
        match self {
            Event::Test(t) | Event::Move(t) | Event::Stay(t) => t,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Event::Test(_) => Action::Test,
            Event::Move(_) => Action::Move,
            Event::Stay(_) => Action::Stay,
        }
    }

    /// Build the event for `action` carrying `trigger`.
    pub fn with_action(action: Action, trigger: Trigger) -> Self {
        match action {
            Action::Move => Event::Move(trigger),
            Action::Stay => Event::Stay(trigger),
            Action::Test => Event::Test(trigger),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Move,
    Stay,
    Test,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Move => "move",
            Action::Stay => "stay",
            Action::Test => "test",
        })
    }
}

/// A fired event, remembered until the next send cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activation {
    pub route: Route,
    /// State key the dispatch ran under (`"default"`, a peer id, or `"<channel>:<peer>"`).
    pub key: String,
    pub action: Action,
    pub trigger: Trigger,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::{next_scope, TriggerSet};

    #[test]
    fn event_action_tags() {
        let ok = TriggerSet::new(next_scope(), ["ok".to_string()]).get("ok").unwrap();
        assert_eq!(Event::Move(ok.clone()).action(), Action::Move);
        assert_eq!(Event::Stay(ok.clone()).action(), Action::Stay);
        assert_eq!(Event::Test(ok.clone()).action(), Action::Test);
        assert_eq!(Event::with_action(Action::Stay, ok.clone()), Event::Stay(ok.clone()));
        assert_eq!(Event::Test(ok).trigger().name(), "ok");
    }

    #[test]
    fn action_serde_is_snake_case() {
        assert_eq!(serde_json::to_string(&Action::Move).unwrap(), "\"move\"");
        let a: Action = serde_json::from_str("\"test\"").unwrap();
        assert_eq!(a, Action::Test);
    }
}
