//! The [`Exchange`] topology descriptor.

use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, ShortString},
    ExchangeKind,
};

/// The kind of AMQP exchange to declare.
///
/// Mirrors [`lapin::ExchangeKind`] but adds the RabbitMQ delayed-message plugin's
/// custom kind, which is not a built-in AMQP 0-9-1 exchange type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeType {
    /// Routes by exact routing-key match.
    Direct,
    /// Routes by routing-key glob pattern (`*`/`#`).
    Topic,
    /// Routes to every bound queue, ignoring the routing key.
    Fanout,
    /// Routes by matching message headers against binding arguments.
    Headers,
    /// The `x-delayed-message` exchange type provided by RabbitMQ's delayed message
    /// plugin. Requires `arguments["x-delayed-type"]` to name the wrapped exchange kind.
    XDelayedMessage,
}

impl ExchangeType {
    /// The AMQP wire name of this exchange type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
            Self::Headers => "headers",
            Self::XDelayedMessage => "x-delayed-message",
        }
    }
}

impl From<&ExchangeType> for ExchangeKind {
    fn from(kind: &ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Headers => ExchangeKind::Headers,
            ExchangeType::XDelayedMessage => ExchangeKind::Custom("x-delayed-message".to_string()),
        }
    }
}

/// A declarative description of an AMQP exchange.
///
/// `Exchange` is immutable once built: every modifier (`with_*`) consumes `self` and
/// returns a new value, the same builder shape as the teacher's `HandlerConfig`.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub(crate) name: String,
    pub(crate) kind: ExchangeType,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) arguments: FieldTable,
}

impl Exchange {
    /// Creates a new exchange descriptor with the given name and type.
    ///
    /// Defaults: not durable, not auto-delete, not internal, no arguments.
    pub fn new(name: impl Into<String>, kind: ExchangeType) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::default(),
        }
    }

    /// Convenience constructor for a direct exchange.
    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeType::Direct)
    }

    /// Convenience constructor for a topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeType::Topic)
    }

    /// Convenience constructor for a fanout exchange.
    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeType::Fanout)
    }

    /// Convenience constructor for a headers exchange.
    pub fn headers(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeType::Headers)
    }

    /// Marks the exchange as durable (survives broker restart).
    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Marks the exchange as auto-delete (removed once the last queue unbinds).
    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Marks the exchange as internal (no direct publishes, only exchange-to-exchange).
    #[must_use]
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Sets an arbitrary declare argument.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<ShortString>, value: impl Into<AMQPValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Returns the exchange name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            // Passive declares are only used by the setup engine's idempotence check,
            // never by the descriptor itself.
            passive: false,
            nowait: false,
        }
    }
}
