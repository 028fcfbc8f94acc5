//! The [`Binding`] topology descriptor.

use lapin::types::{AMQPValue, FieldTable};

use super::exchange::ExchangeType;

/// A declarative binding between an exchange and a queue.
///
/// `patterns` are routing keys for `direct`/`topic` exchanges (one binding per
/// pattern is issued against the broker), are ignored for `fanout` exchanges (a single
/// empty-routing-key bind is issued), and are folded into a single `x-match: any`
/// headers argument for `headers` exchanges.
#[derive(Debug, Clone)]
pub struct Binding {
    pub(crate) exchange: String,
    pub(crate) queue: String,
    pub(crate) exchange_kind: ExchangeType,
    pub(crate) patterns: Vec<String>,
}

impl Binding {
    /// Creates a binding from the given exchange to the given queue with the given
    /// routing-key patterns (semantics depend on `exchange_kind`, see the type docs).
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        exchange_kind: ExchangeType,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            exchange_kind,
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the bound exchange's name.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Returns the bound queue's name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns the per-bind routing keys that should actually be sent to the broker
    /// for this binding's exchange kind.
    pub(crate) fn bind_routing_keys(&self) -> Vec<String> {
        match self.exchange_kind {
            ExchangeType::Fanout => vec![String::new()],
            ExchangeType::Headers => vec![String::new()],
            _ if self.patterns.is_empty() => vec![String::new()],
            _ => self.patterns.clone(),
        }
    }

    /// Returns the headers-exchange binding arguments (`x-match: any` plus one entry
    /// per pattern treated as a `key=value` header match), or an empty table otherwise.
    pub(crate) fn bind_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if self.exchange_kind == ExchangeType::Headers {
            args.insert("x-match".into(), AMQPValue::LongString("any".into()));
            for pattern in &self.patterns {
                if let Some((key, value)) = pattern.split_once('=') {
                    args.insert(key.into(), AMQPValue::LongString(value.into()));
                }
            }
        }
        args
    }
}
