//! The [`Queue`] topology descriptor.

use std::time::Duration;

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, ShortString},
};

/// A declarative description of an AMQP queue.
///
/// An empty `name` means "ask the broker for an anonymous, server-generated name" —
/// the Setup Engine resolves that name once and the owning Consumer pins it for its
/// whole lifetime (including across reestablish), per the data model's anonymous-queue
/// invariant.
#[derive(Debug, Clone)]
pub struct Queue {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) arguments: FieldTable,
}

impl Queue {
    /// The default value for the prefetch count, used when `Chain::prefetch` is not
    /// called. `0` means unlimited, as specified for `Chain State`.
    pub const UNLIMITED_PREFETCH: u16 = 0;

    /// Creates a new named queue descriptor. Pass an empty string for an anonymous,
    /// server-generated queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            arguments: FieldTable::default(),
        }
    }

    /// Creates an anonymous queue descriptor: exclusive, auto-delete, non-durable.
    /// This is the shape the Publisher uses internally for the RPC reply queue.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new("").exclusive(true).auto_delete(true)
    }

    /// True if this descriptor asks the broker to generate the queue name.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    /// Returns a copy of this descriptor pinned to `name`.
    ///
    /// Used to redeclare an originally-anonymous queue under its broker-assigned name
    /// after a reconnect, since a second anonymous declare would hand back a different
    /// name and break the pinned-name invariant for the lifetime of a Consumer.
    #[must_use]
    pub(crate) fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Marks the queue as durable (survives broker restart).
    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Marks the queue as exclusive to the declaring connection.
    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Marks the queue as auto-delete (removed once the last consumer disconnects).
    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Sets `x-expires`: the queue is deleted after being unused for this long.
    #[must_use]
    pub fn expires(mut self, ttl: Duration) -> Self {
        self.arguments.insert("x-expires".into(), AMQPValue::LongUInt(millis_as_u32(ttl)));
        self
    }

    /// Sets `x-message-ttl`: messages not consumed within this long are dropped (or
    /// dead-lettered, if `x-dead-letter-exchange` is also set).
    #[must_use]
    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(millis_as_u32(ttl)));
        self
    }

    /// Sets `x-max-length`: the queue drops oldest messages past this many.
    #[must_use]
    pub fn max_length(mut self, max: u32) -> Self {
        self.arguments
            .insert("x-max-length".into(), AMQPValue::LongUInt(max));
        self
    }

    /// Sets `x-dead-letter-exchange`.
    #[must_use]
    pub fn dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.into().into()),
        );
        self
    }

    /// Sets an arbitrary declare argument.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<ShortString>, value: impl Into<AMQPValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Returns the queue name as declared (empty for anonymous, before resolution).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            passive: false,
            nowait: false,
        }
    }
}

/// Clamps `ttl` to milliseconds that fit in the `long-uint` AMQP wire type, capping at
/// `u32::MAX` (about 49 days) rather than truncating silently on overflow.
fn millis_as_u32(ttl: Duration) -> u32 {
    u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX)
}
