//! Declarative descriptors for AMQP topology: [`Exchange`], [`Queue`], and [`Binding`].
//!
//! These are plain value types. They describe *what* should exist on the broker; the
//! [`crate::setup`] module is what actually asserts them.

mod binding;
mod exchange;
mod queue;

pub use binding::Binding;
pub use exchange::{Exchange, ExchangeType};
pub use queue::Queue;
