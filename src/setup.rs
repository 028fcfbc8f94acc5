//! The idempotent Setup Engine: asserts exchanges, queues, and bindings from a
//! [`ChainState`] against the broker.

use lapin::options::QueueBindOptions;
use lapin::Channel;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::state::ChainState;

/// Runs Setup for `state` against `channel`: declares the exchange (if set), then the
/// queue (if set), then every binding, in that order. A no-op if `state.skip_setup` is
/// true.
///
/// Returns the resolved queue name: the declared name, or the broker-assigned name for
/// an anonymous queue. `None` if `state` has no queue to declare.
///
/// # Errors
/// Returns [`Error::Setup`] if the broker rejects a declare, which in practice almost
/// always means a passive mismatch against an already-existing exchange/queue with
/// different properties. Setup is otherwise idempotent: declaring the same exchange,
/// queue, or binding twice with matching properties never fails.
pub(crate) async fn run(channel: &Channel, state: &ChainState) -> Result<Option<String>> {
    if state.skip_setup {
        trace!("skip_setup is set, bypassing the setup engine");
        return Ok(state.queue.as_ref().map(|q| q.name().to_string()));
    }

    if let Some(exchange) = &state.exchange {
        debug!(exchange = exchange.name(), "declaring exchange");
        channel
            .exchange_declare(
                exchange.name(),
                (&exchange.kind).into(),
                exchange.declare_options(),
                exchange.arguments.clone(),
            )
            .await
            .map_err(Error::Setup)?;
    }

    let resolved_queue = match &state.queue {
        Some(queue) => {
            debug!(queue = queue.name(), "declaring queue");
            let declared = channel
                .queue_declare(queue.name(), queue.declare_options(), queue.arguments.clone())
                .await
                .map_err(Error::Setup)?;
            let resolved = declared.name().as_str().to_string();
            if queue.is_anonymous() {
                debug!(resolved_queue = %resolved, "anonymous queue resolved");
            }
            Some(resolved)
        }
        None => None,
    };

    for binding in &state.bindings {
        let queue_name = resolved_queue.as_deref().unwrap_or_else(|| binding.queue());
        for routing_key in binding.bind_routing_keys() {
            debug!(
                exchange = binding.exchange(),
                queue = queue_name,
                routing_key = %routing_key,
                "declaring binding"
            );
            channel
                .queue_bind(
                    queue_name,
                    binding.exchange(),
                    &routing_key,
                    QueueBindOptions::default(),
                    binding.bind_arguments(),
                )
                .await
                .map_err(Error::Setup)?;
        }
    }

    Ok(resolved_queue)
}
