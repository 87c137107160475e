//! Built-in send handlers.

use async_trait::async_trait;

use rapport_types::{Message, Payload, Result};

use crate::handler::{SendContext, SendHandler};
use crate::sender::drain_outbox;

/// Drains an outbox and addresses one message to each queued entry.
///
/// Entries carry their own body when a receive handler set one; otherwise the
/// fixed `text` is sent.
pub struct OutboxNotice {
    outbox: String,
    text: String,
}

impl OutboxNotice {
    pub fn new(outbox: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            outbox: outbox.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
impl SendHandler for OutboxNotice {
    async fn produce(&self, cx: &SendContext<'_>) -> Result<Vec<Payload>> {
        let entries = drain_outbox(cx.store, cx.events, &self.outbox).await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let body = if entry.body.is_null() {
                    serde_json::Value::String(self.text.clone())
                } else {
                    entry.body
                };
                Payload::Structured(Message::new(entry.to, body))
            })
            .collect())
    }
}

/// Broadcasts the same text every cycle.
pub struct Heartbeat {
    text: String,
}

impl Heartbeat {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl SendHandler for Heartbeat {
    async fn produce(&self, _cx: &SendContext<'_>) -> Result<Vec<Payload>> {
        Ok(vec![Payload::Text(self.text.clone())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEmitter;
    use crate::store::{OutboxEntry, StateStore};
    use rapport_route::Route;
    use serde_json::json;

    #[tokio::test]
    async fn notice_addresses_each_entry_once() {
        let store = StateStore::spawn(false);
        let events = EventEmitter::new(8);
        let route = Route::edge("contact", "friend");
        store.push("friend", OutboxEntry::peer("A")).await.unwrap();
        store
            .push("friend", OutboxEntry::peer("B").with_body(json!({"gift": 1})))
            .await
            .unwrap();

        let cx = SendContext {
            route: &route,
            activation: None,
            store: &store,
            events: &events,
        };
        let notice = OutboxNotice::new("friend", "we are friends now");
        let out = notice.produce(&cx).await.unwrap();
        assert_eq!(
            out,
            vec![
                Payload::Structured(Message::new(Some("A".into()), "we are friends now")),
                Payload::Structured(Message::new(Some("B".into()), json!({"gift": 1}))),
            ]
        );
        assert!(notice.produce(&cx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_repeats_text() {
        let store = StateStore::spawn(false);
        let events = EventEmitter::default();
        let route = Route::node("clock");
        let cx = SendContext {
            route: &route,
            activation: None,
            store: &store,
            events: &events,
        };
        let beat = Heartbeat::new("still here");
        assert_eq!(beat.produce(&cx).await.unwrap(), vec![Payload::Text("still here".into())]);
        assert_eq!(beat.produce(&cx).await.unwrap().len(), 1);
    }
}
