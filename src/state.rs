//! The immutable [`ChainState`] configuration record that flows through the builder.

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{Backoff, SlidingWindowBackoff};
use crate::connection::ConnectionManager;
use crate::consumer::middleware::Middleware;
use crate::topology::{Binding, Exchange, Queue};

/// The complete, immutable set of knobs that drive Setup, the Publisher, and the
/// Consumer.
///
/// Every [`crate::Chain`] modifier produces a new `ChainState`; the previous one is
/// never mutated and remains perfectly usable, which is what lets one Chain be
/// branched into several independent configurations without aliasing hazards.
#[derive(Clone)]
pub struct ChainState {
    pub(crate) connection_manager: Arc<ConnectionManager>,
    pub(crate) auto_ack: bool,
    pub(crate) auto_reply: bool,
    pub(crate) prefetch: u16,
    pub(crate) queue: Option<Queue>,
    pub(crate) exchange: Option<Exchange>,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) fail_threshold: usize,
    pub(crate) fail_span: Duration,
    pub(crate) fail_timeout: Duration,
    pub(crate) reestablish: bool,
    pub(crate) json: bool,
    pub(crate) confirm: bool,
    pub(crate) skip_setup: bool,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    pub(crate) priority: u8,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) backoff: Option<Arc<dyn Backoff>>,
}

impl ChainState {
    /// The legacy default sliding-window backoff knobs, kept as the `ChainState`
    /// defaults for `fail_threshold`/`fail_span`/`fail_timeout`.
    const DEFAULT_FAIL_THRESHOLD: usize = 5;
    const DEFAULT_FAIL_SPAN: Duration = Duration::from_secs(5);
    const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_secs(5);

    pub(crate) fn new(connection_manager: Arc<ConnectionManager>) -> Self {
        Self {
            connection_manager,
            auto_ack: true,
            auto_reply: false,
            prefetch: Queue::UNLIMITED_PREFETCH,
            queue: None,
            exchange: None,
            bindings: Vec::new(),
            fail_threshold: Self::DEFAULT_FAIL_THRESHOLD,
            fail_span: Self::DEFAULT_FAIL_SPAN,
            fail_timeout: Self::DEFAULT_FAIL_TIMEOUT,
            reestablish: true,
            json: true,
            confirm: false,
            skip_setup: false,
            middleware: Vec::new(),
            priority: 0,
            no_ack: false,
            exclusive: false,
            backoff: None,
        }
    }

    /// Returns a copy of this state with `queue` (and any binding that targeted it)
    /// pinned to `resolved_name`, for re-running Setup after a reconnect without
    /// re-resolving a fresh anonymous queue name.
    pub(crate) fn pinned_to(&self, resolved_name: &str) -> Self {
        let mut state = self.clone();
        let original_name = state.queue.as_ref().map(|q| q.name().to_string());
        if let Some(queue) = state.queue.take() {
            state.queue = Some(queue.renamed(resolved_name));
        }
        if let Some(original_name) = original_name.filter(|n| n.is_empty()) {
            for binding in &mut state.bindings {
                if binding.queue == original_name {
                    binding.queue = resolved_name.to_string();
                }
            }
        }
        state
    }

    /// Snapshots the middleware chain as the shared slice the middleware runtime walks
    /// per delivery.
    pub(crate) fn middleware_chain(&self) -> Arc<[Arc<dyn Middleware>]> {
        Arc::from(self.middleware.clone())
    }

    /// Resolves the `Backoff` to actually drive a Consumer built from this state: the
    /// explicitly configured one, or a fresh [`SlidingWindowBackoff`] seeded from the
    /// legacy `fail_threshold`/`fail_span`/`fail_timeout` knobs.
    ///
    /// A fresh instance is always handed to exactly one Consumer: per the "no global
    /// state" design note, a default `Backoff` must be stateless or per-consumer, and a
    /// brand new `SlidingWindowBackoff` is per-consumer by construction.
    pub(crate) fn backoff(&self) -> Arc<dyn Backoff> {
        self.backoff.clone().unwrap_or_else(|| {
            Arc::new(SlidingWindowBackoff::new(
                self.fail_threshold,
                self.fail_span,
                self.fail_timeout,
            ))
        })
    }
}
