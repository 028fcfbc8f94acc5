//! # warren
//!
//! A chainable, declarative AMQP 0-9-1 client built on top of
//! [lapin](https://github.com/amqp-rs/lapin).
//!
//! A [`Chain`] accumulates an immutable configuration record through builder-style
//! modifiers, then drives one of three terminal operations: `publish`/`publish_to_queue`
//! (with optional broker confirms), `rpc` (request/reply correlated by a fresh
//! correlation ID), or `subscribe` (a prefetch-bounded, middleware-driven delivery
//! loop). A single [`ConnectionManager`] supervises the underlying transport, handing
//! out channels and transparently reopening everything — topology, subscriptions, the
//! RPC reply queue — after a transport loss.

// warren is 100% Safe Rust.
#![forbid(unsafe_code)]
#![warn(
    // Warns on ::path, allows crate::path.
    absolute_paths_not_starting_with_crate,

    // Warns you about missing documentation comments.
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,

    // Warns you when you have dependencies you're not using.
    unused_crate_dependencies,

    // Warns on converting values using the `as` keyword.
    clippy::as_conversions,
)]

// Re-exporting the underlying lapin version so you don't have to pin a second one.
pub use lapin;

mod backoff;
mod chain;
mod connection;
mod consumer;
mod error;
mod message;
mod publisher;
mod setup;
mod state;
mod topology;

pub use backoff::{Backoff, SlidingWindowBackoff};
pub use chain::Chain;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionManagerConfig, ReconnectConfig};
pub use consumer::middleware::{Middleware, Next};
pub use consumer::{ConsumerHandle, Handler};
pub use error::{Error, TransientSource};
pub use message::{HandledState, Message, Payload, PayloadDecodeError};
pub use publisher::{Publishable, PublishOptions, RpcOptions};
pub use topology::{Binding, Exchange, ExchangeType, Queue};

/// Convenience type for a result with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    pub use super::*;

    mod basic;
}
