//! Receive and send handler traits, plus closure adapters.

use std::future::Future;

use async_trait::async_trait;

use rapport_route::Route;
use rapport_types::{Inbound, Node, Payload, Result};

use crate::event::{Activation, Event};
use crate::events::EventEmitter;
use crate::store::StateStore;
use crate::triggers::TriggerSet;

// ---------------------------------------------------------------------------
// ReceiveHandler
// ---------------------------------------------------------------------------

/// What a receive handler can see while deciding.
pub struct HandlerContext<'a> {
    /// State key being dispatched (`"default"`, a peer id, or `"<channel>:<peer>"`).
    pub key: &'a str,
    pub state: &'a Node,
    pub route: &'a Route,
    pub store: &'a StateStore,
    pub triggers: &'a TriggerSet,
}

#[async_trait]
pub trait ReceiveHandler: Send + Sync {
    /// Decide on one inbound message. `Ok(None)` means "does not apply".
    async fn handle(&self, cx: &HandlerContext<'_>, inbound: &Inbound) -> Result<Option<Event>>;

    /// Runs after dispatch when this handler's event was kept as returned:
    /// the winning `Move`, or a recorded `Stay`/`Test`. Not called for a
    /// `Move` that was outranked or downgraded.
    async fn fired(
        &self,
        _cx: &HandlerContext<'_>,
        _inbound: &Inbound,
        _activation: &Activation,
    ) -> Result<()> {
        Ok(())
    }
}

/// Owned copy of the handler inputs, handed to closure handlers.
#[derive(Clone)]
pub struct ReceiveCall {
    pub key: String,
    pub state: Node,
    pub route: Route,
    pub inbound: Inbound,
    pub store: StateStore,
    pub triggers: TriggerSet,
}

pub struct ReceiveFn<F>(F);

/// Wrap an async closure as a [`ReceiveHandler`].
pub fn receive_fn<F, Fut>(f: F) -> ReceiveFn<F>
where
    F: Fn(ReceiveCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Event>>> + Send + 'static,
{
    ReceiveFn(f)
}

#[async_trait]
impl<F, Fut> ReceiveHandler for ReceiveFn<F>
where
    F: Fn(ReceiveCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Event>>> + Send + 'static,
{
    async fn handle(&self, cx: &HandlerContext<'_>, inbound: &Inbound) -> Result<Option<Event>> {
        let call = ReceiveCall {
            key: cx.key.to_string(),
            state: cx.state.clone(),
            route: cx.route.clone(),
            inbound: inbound.clone(),
            store: cx.store.clone(),
            triggers: cx.triggers.clone(),
        };
        (self.0)(call).await
    }
}

// ---------------------------------------------------------------------------
// SendHandler
// ---------------------------------------------------------------------------

pub struct SendContext<'a> {
    pub route: &'a Route,
    /// The activation that opened the gate, for gated senders.
    pub activation: Option<&'a Activation>,
    pub store: &'a StateStore,
    pub events: &'a EventEmitter,
}

#[async_trait]
pub trait SendHandler: Send + Sync {
    /// Produce zero or more outbound payloads.
    async fn produce(&self, cx: &SendContext<'_>) -> Result<Vec<Payload>>;
}

pub struct SendFn<F>(F);

/// Wrap an async closure over the store as a [`SendHandler`].
pub fn send_fn<F, Fut>(f: F) -> SendFn<F>
where
    F: Fn(StateStore) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Payload>>> + Send + 'static,
{
    SendFn(f)
}

#[async_trait]
impl<F, Fut> SendHandler for SendFn<F>
where
    F: Fn(StateStore) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Payload>>> + Send + 'static,
{
    async fn produce(&self, cx: &SendContext<'_>) -> Result<Vec<Payload>> {
        (self.0)(cx.store.clone()).await
    }
}
