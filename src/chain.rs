//! [`Chain`]: the immutable builder facade over a [`ChainState`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::connection::ConnectionManager;
use crate::consumer::middleware::Middleware;
use crate::consumer::{self, ConsumerHandle, Handler};
use crate::error::{Error, Result};
use crate::message::Payload;
use crate::publisher::{Publishable, PublishOptions, Publisher, RpcOptions};
use crate::state::ChainState;
use crate::topology::{Binding, Exchange, Queue};

/// The user-facing builder: every modifier returns a new `Chain` wrapping a copy of the
/// underlying [`ChainState`]. The previous `Chain` remains valid and independently
/// usable, so branching one Chain into several configurations carries no aliasing
/// hazard.
///
/// Terminal operations (`publish`, `publish_to_queue`, `rpc`, `subscribe`) consume a
/// snapshot of the current state; `subscribe` may only be called once per `Chain`
/// instance (including its clones) — a second call fails fast with
/// [`crate::Error::Config`] rather than silently starting a second consumer.
#[derive(Clone)]
pub struct Chain {
    state: Arc<ChainState>,
    subscribed: Arc<AtomicBool>,
}

impl Chain {
    /// Starts a new Chain over `connection_manager`, with every knob at its default:
    /// `auto_ack`/`json`/`reestablish` true, everything else off or unset.
    #[must_use]
    pub fn new(connection_manager: Arc<ConnectionManager>) -> Self {
        Self {
            state: Arc::new(ChainState::new(connection_manager)),
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn with(&self, f: impl FnOnce(&mut ChainState)) -> Self {
        let mut state = (*self.state).clone();
        f(&mut state);
        Self {
            state: Arc::new(state),
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the queue `subscribe`/`rpc`/`publish_to_queue`'s default target resolve
    /// against, and that Setup declares.
    #[must_use]
    pub fn queue(&self, queue: Queue) -> Self {
        self.with(|s| s.queue = Some(queue))
    }

    /// Sets the exchange `publish` targets, and that Setup declares.
    #[must_use]
    pub fn exchange(&self, exchange: Exchange) -> Self {
        self.with(|s| s.exchange = Some(exchange))
    }

    /// Adds a binding for Setup to declare.
    #[must_use]
    pub fn bind(&self, binding: Binding) -> Self {
        self.with(|s| s.bindings.push(binding))
    }

    /// Sets whether unhandled deliveries are acked automatically once the handler
    /// returns successfully. Default `true`.
    #[must_use]
    pub fn auto_ack(&self, auto_ack: bool) -> Self {
        self.with(|s| s.auto_ack = auto_ack)
    }

    /// Sets whether a handler's `Ok(Some(payload))` return value is published as a
    /// reply when the delivery carries `replyTo` + `correlationId`. Default `false`.
    #[must_use]
    pub fn auto_reply(&self, auto_reply: bool) -> Self {
        self.with(|s| s.auto_reply = auto_reply)
    }

    /// Sets the channel prefetch count. `0` (the default) means unlimited.
    #[must_use]
    pub fn prefetch(&self, prefetch: u16) -> Self {
        self.with(|s| s.prefetch = prefetch)
    }

    /// Sets whether payloads are encoded/decoded as JSON by default. Default `true`.
    #[must_use]
    pub fn json(&self, json: bool) -> Self {
        self.with(|s| s.json = json)
    }

    /// Sets whether `publish` waits for a broker confirm. Default `false`.
    #[must_use]
    pub fn confirm(&self, confirm: bool) -> Self {
        self.with(|s| s.confirm = confirm)
    }

    /// Sets whether Setup is bypassed entirely on `subscribe`/`publish`. Default
    /// `false`.
    #[must_use]
    pub fn skip_setup(&self, skip_setup: bool) -> Self {
        self.with(|s| s.skip_setup = skip_setup)
    }

    /// Sets whether this Chain's Consumer (or RPC reply queue) resumes automatically
    /// after a reconnect. Default `true`.
    #[must_use]
    pub fn reestablish(&self, reestablish: bool) -> Self {
        self.with(|s| s.reestablish = reestablish)
    }

    /// Sets the default `Backoff`'s failure-count threshold.
    #[must_use]
    pub fn fail_threshold(&self, fail_threshold: usize) -> Self {
        self.with(|s| s.fail_threshold = fail_threshold)
    }

    /// Sets the default `Backoff`'s failure-counting sliding window.
    #[must_use]
    pub fn fail_span(&self, fail_span: Duration) -> Self {
        self.with(|s| s.fail_span = fail_span)
    }

    /// Sets the default `Backoff`'s suspension duration once the threshold is crossed.
    #[must_use]
    pub fn fail_timeout(&self, fail_timeout: Duration) -> Self {
        self.with(|s| s.fail_timeout = fail_timeout)
    }

    /// Overrides the default sliding-window `Backoff` with a custom implementation.
    #[must_use]
    pub fn backoff(&self, backoff: Arc<dyn Backoff>) -> Self {
        self.with(|s| s.backoff = Some(backoff))
    }

    /// Appends a middleware layer, run in registration order ahead of the handler.
    #[must_use]
    pub fn middleware(&self, middleware: Arc<dyn Middleware>) -> Self {
        self.with(|s| s.middleware.push(middleware))
    }

    /// Sets the `x-priority` consumer argument. `0` (the default) omits the argument.
    #[must_use]
    pub fn priority(&self, priority: u8) -> Self {
        self.with(|s| s.priority = priority)
    }

    /// Sets `noAck`: the broker considers every delivery acknowledged as soon as it is
    /// sent, and this crate's ack/nack machinery becomes purely advisory. Default
    /// `false`.
    #[must_use]
    pub fn no_ack(&self, no_ack: bool) -> Self {
        self.with(|s| s.no_ack = no_ack)
    }

    /// Sets whether the Consumer requests exclusive access to the queue. Default
    /// `false`.
    #[must_use]
    pub fn exclusive(&self, exclusive: bool) -> Self {
        self.with(|s| s.exclusive = exclusive)
    }

    /// Publishes `payload` with `routing_key` to `State::exchange` (the default
    /// exchange if unset).
    ///
    /// # Errors
    /// See the crate's error taxonomy.
    pub async fn publish(&self, routing_key: &str, payload: impl Into<Publishable>) -> Result<()> {
        self.publish_with(routing_key, payload, PublishOptions::default()).await
    }

    /// As [`Chain::publish`], with explicit per-publish options (headers, priority,
    /// confirm timeout, ...).
    ///
    /// # Errors
    /// See the crate's error taxonomy.
    pub async fn publish_with(
        &self,
        routing_key: &str,
        payload: impl Into<Publishable>,
        options: PublishOptions,
    ) -> Result<()> {
        Publisher::new(Arc::clone(&self.state))
            .publish(routing_key, payload.into(), options)
            .await
    }

    /// Publishes `payload` directly to `queue`, bypassing `State::exchange`.
    ///
    /// # Errors
    /// See the crate's error taxonomy.
    pub async fn publish_to_queue(&self, queue: &str, payload: impl Into<Publishable>) -> Result<()> {
        Publisher::new(Arc::clone(&self.state))
            .publish_to_queue(queue, payload.into(), PublishOptions::default())
            .await
    }

    /// Performs a request/reply call against `State::queue`.
    ///
    /// # Errors
    /// [`crate::Error::Config`] if no queue is set; [`crate::Error::Timeout`] if no
    /// reply arrives before `options.timeout` elapses.
    pub async fn rpc(&self, payload: impl Into<Publishable>, options: RpcOptions) -> Result<Payload> {
        Publisher::new(Arc::clone(&self.state)).rpc(payload.into(), options).await
    }

    /// Subscribes `handler` to `State::queue`, running Setup first and returning a
    /// handle to close the subscription.
    ///
    /// # Errors
    /// [`crate::Error::Config`] if no queue is set, or if this Chain instance was
    /// already subscribed.
    pub async fn subscribe(&self, handler: impl Handler + 'static) -> Result<ConsumerHandle> {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(Error::config(
                "subscribe was already called on this Chain instance",
            ));
        }
        consumer::subscribe(Arc::clone(&self.state), Arc::new(handler)).await
    }

    /// Exposes the "already subscribed" guard for identity assertions in tests.
    #[cfg(test)]
    pub(crate) fn subscribed_for_test(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.subscribed)
    }
}
