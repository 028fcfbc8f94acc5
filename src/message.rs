//! The [`Message`] received-message view and its handled-state machine.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use lapin::{
    acker::Acker, message::Delivery, options::BasicAckOptions, options::BasicNackOptions,
    protocol::basic::AMQPProperties, BasicProperties,
};
use tracing::debug;

use crate::error::{Error, Result};

/// The decoded body of a received message: either raw bytes, or a parsed JSON value,
/// depending on `State::json` and the message's `contentType`.
#[derive(Debug, Clone)]
pub enum Payload {
    /// The payload was not JSON (either `State::json` was false, or the content type
    /// was not `application/json`, or the bytes didn't actually parse as JSON).
    Bytes(Vec<u8>),
    /// The payload was decoded as JSON.
    Json(serde_json::Value),
}

impl Payload {
    /// Returns the payload as a JSON value, deserializing lazily if it was only ever
    /// decoded as bytes and happens to be valid JSON text.
    ///
    /// # Errors
    /// Returns an error if the bytes are not valid JSON.
    pub fn as_json(&self) -> Result<serde_json::Value> {
        match self {
            Self::Json(v) => Ok(v.clone()),
            Self::Bytes(b) => serde_json::from_slice(b)
                .map_err(|e| Error::handler(PayloadDecodeError(e.to_string()))),
        }
    }

    /// Returns the raw bytes of the payload, re-encoding JSON if necessary.
    #[must_use]
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bytes(b) => b.clone(),
            Self::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
        }
    }
}

/// A payload could not be decoded as JSON by a handler that expected it.
#[derive(Debug, thiserror::Error)]
#[error("payload could not be decoded as JSON: {0}")]
pub struct PayloadDecodeError(String);

/// The per-message handled-state machine: `New -> (Acked | Nacked | Replied)`.
///
/// At most one terminal transition may ever take effect; later attempts are recorded
/// (for diagnostics) but are otherwise no-ops. This is the invariant verified by
/// "handled-state monotonicity" in the testable properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandledState {
    /// No terminal action has been taken yet.
    New,
    /// The message was acknowledged.
    Acked,
    /// The message was rejected, optionally with requeue.
    Nacked {
        /// Whether the broker was asked to requeue the message.
        requeue: bool,
    },
    /// A reply was published for this message (RPC-style auto-reply).
    Replied,
}

const STATE_NEW: u8 = 0;
const STATE_ACKED: u8 = 1;
const STATE_NACKED_REQUEUE: u8 = 2;
const STATE_NACKED_NO_REQUEUE: u8 = 3;
const STATE_REPLIED: u8 = 4;

/// Atomic cell backing [`HandledState`] so that `ack`/`nack`/`reply` can race safely
/// from middleware, the runtime's auto-ack/auto-nack fallback, and a cloned `Message`
/// handed to a user handler, without any lock.
#[derive(Debug)]
struct HandledCell(AtomicU8);

impl HandledCell {
    fn new() -> Self {
        Self(AtomicU8::new(STATE_NEW))
    }

    /// Attempts to move from `New` to the given terminal state. Returns `true` if this
    /// call performed the transition (i.e. the caller should actually talk to the
    /// broker), `false` if the message was already handled.
    fn try_transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(STATE_NEW, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

/// An immutable view over a received AMQP delivery, including its decoded payload and
/// handled-state machine.
///
/// Cloning a `Message` is cheap: the handled-state cell and acker are shared, so
/// `ack`/`nack`/`reply` called from any clone observe and affect the same state.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

struct MessageInner {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    delivery_tag: u64,
    consumer_tag: String,
    queue_name: String,
    properties: AMQPProperties,
    raw: Vec<u8>,
    payload: Payload,
    acker: Acker,
    state: HandledCell,
    replied: AtomicBool,
}

impl Message {
    /// Builds a `Message` from a raw `lapin` delivery, decoding the payload as JSON
    /// when `decode_json` is true and the content type says so (or is absent, since
    /// `State::json` defaults to true and most AMQP producers don't bother setting
    /// `contentType`).
    pub(crate) fn from_delivery(
        delivery: Delivery,
        queue_name: String,
        consumer_tag: String,
        decode_json: bool,
    ) -> Self {
        let payload = decode_payload(&delivery.data, &delivery.properties, decode_json);

        Self {
            inner: Arc::new(MessageInner {
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                delivery_tag: delivery.delivery_tag,
                consumer_tag,
                queue_name,
                properties: delivery.properties.clone(),
                raw: delivery.data,
                payload,
                acker: delivery.acker,
                state: HandledCell::new(),
                replied: AtomicBool::new(false),
            }),
        }
    }

    /// The exchange the message was published to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// The routing key the message was published with.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.inner.routing_key
    }

    /// Whether the broker is redelivering this message.
    #[must_use]
    pub fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    /// The broker-assigned delivery tag, unique within the owning channel.
    #[must_use]
    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    /// The consumer tag of the subscription that received this message.
    #[must_use]
    pub fn consumer_tag(&self) -> &str {
        &self.inner.consumer_tag
    }

    /// The pinned queue name this message was consumed from.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    /// The raw AMQP properties of the message.
    #[must_use]
    pub fn properties(&self) -> &AMQPProperties {
        &self.inner.properties
    }

    /// The `correlationId` property, if set.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.inner
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str())
    }

    /// The `replyTo` property, if set.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.inner
            .properties
            .reply_to()
            .as_ref()
            .map(|s| s.as_str())
    }

    /// The `appId` property, if set.
    #[must_use]
    pub fn app_id(&self) -> Option<&str> {
        self.inner.properties.app_id().as_ref().map(|s| s.as_str())
    }

    /// The raw (undecoded) message bytes.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.inner.raw
    }

    /// The decoded payload (bytes or parsed JSON, per `State::json`).
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.inner.payload
    }

    /// The current handled state of this message.
    #[must_use]
    pub fn handled_state(&self) -> HandledState {
        match self.inner.state.load() {
            STATE_ACKED => HandledState::Acked,
            STATE_NACKED_REQUEUE => HandledState::Nacked { requeue: true },
            STATE_NACKED_NO_REQUEUE => HandledState::Nacked { requeue: false },
            STATE_REPLIED => HandledState::Replied,
            _ => HandledState::New,
        }
    }

    /// True iff the handled state is no longer `New`, or a reply has already been
    /// published for this message. Matches the "handled-state monotonicity" invariant.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.inner.state.load() != STATE_NEW || self.inner.replied.load(Ordering::Acquire)
    }

    /// Acknowledges the message. A no-op (returns `Ok(())` without talking to the
    /// broker) if the message was already handled.
    ///
    /// # Errors
    /// Returns an error if the underlying broker call fails.
    pub async fn ack(&self) -> Result<()> {
        if !self.inner.state.try_transition(STATE_ACKED) {
            debug!("ack() called on an already-handled message, ignoring");
            return Ok(());
        }
        self.inner.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    /// Rejects the message with no requeue. A no-op if already handled.
    ///
    /// # Errors
    /// Returns an error if the underlying broker call fails.
    pub async fn nack(&self) -> Result<()> {
        self.nack_with_requeue(false).await
    }

    /// Rejects the message, optionally asking the broker to requeue it. A no-op if
    /// already handled.
    ///
    /// # Errors
    /// Returns an error if the underlying broker call fails.
    pub async fn nack_with_requeue(&self, requeue: bool) -> Result<()> {
        let target = if requeue {
            STATE_NACKED_REQUEUE
        } else {
            STATE_NACKED_NO_REQUEUE
        };
        if !self.inner.state.try_transition(target) {
            debug!("nack() called on an already-handled message, ignoring");
            return Ok(());
        }
        self.inner
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }

    /// True if this delivery carries enough information (`replyTo` + `correlationId`)
    /// for a reply to make sense.
    #[must_use]
    pub fn can_reply(&self) -> bool {
        self.reply_to().is_some() && self.correlation_id().is_some()
    }

    /// Marks that a reply was published for this message, for `is_handled` purposes.
    /// Does not itself publish anything; see `crate::consumer` for the reply call site.
    pub(crate) fn mark_replied(&self) {
        self.inner.replied.store(true, Ordering::Release);
        // Replying is itself a terminal transition: once this succeeds, `is_handled()`
        // is true and the post-handler auto-ack is skipped, same as an explicit ack.
        let _ = self.inner.state.try_transition(STATE_REPLIED);
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("exchange", &self.exchange())
            .field("routing_key", &self.routing_key())
            .field("delivery_tag", &self.delivery_tag())
            .field("handled_state", &self.handled_state())
            .finish()
    }
}

/// Decodes a delivery's raw body into a [`Payload`], applying the same JSON-by-default
/// policy `from_delivery` uses: decode as JSON when `decode_json` is true and the
/// `contentType` property is either `application/json` or absent.
pub(crate) fn decode_payload(data: &[u8], properties: &AMQPProperties, decode_json: bool) -> Payload {
    let content_type_is_json = properties
        .content_type()
        .as_ref()
        .map_or(true, |ct| ct.as_str() == "application/json");

    if decode_json && content_type_is_json {
        match serde_json::from_slice(data) {
            Ok(v) => Payload::Json(v),
            Err(_) => Payload::Bytes(data.to_vec()),
        }
    } else {
        Payload::Bytes(data.to_vec())
    }
}

/// Builds outbound [`BasicProperties`] for a publish, applying the JSON content-type
/// convention from the Publisher's JSON policy.
pub(crate) fn content_type_properties(props: BasicProperties, json: bool) -> BasicProperties {
    if json {
        props
            .with_content_type("application/json".into())
            .with_content_encoding("utf8".into())
    } else {
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{acker::Acker, message::Delivery};

    fn delivery_with(data: Vec<u8>, content_type: Option<&str>) -> Delivery {
        let mut properties = AMQPProperties::default();
        if let Some(ct) = content_type {
            properties = properties.with_content_type(ct.into());
        }
        Delivery {
            delivery_tag: 1,
            exchange: "".into(),
            routing_key: "rk".into(),
            redelivered: false,
            properties,
            data,
            acker: Acker::default(),
        }
    }

    fn message_with(data: Vec<u8>, content_type: Option<&str>, decode_json: bool) -> Message {
        let delivery = delivery_with(data, content_type);
        Message::from_delivery(delivery, "q".into(), "ctag".into(), decode_json)
    }

    #[test]
    fn json_payload_is_decoded_when_content_type_matches() {
        let message = message_with(br#"{"a":1}"#.to_vec(), Some("application/json"), true);
        match message.payload() {
            Payload::Json(v) => assert_eq!(v["a"], 1),
            Payload::Bytes(_) => panic!("expected JSON payload"),
        }
    }

    #[test]
    fn bytes_payload_is_kept_when_json_disabled() {
        let message = message_with(b"hello".to_vec(), None, false);
        assert!(matches!(message.payload(), Payload::Bytes(b) if b == b"hello"));
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let message = message_with(b"hi".to_vec(), None, false);
        assert!(!message.is_handled());
        message.ack().await.unwrap();
        assert!(message.is_handled());
        assert_eq!(message.handled_state(), HandledState::Acked);
        // Second ack is a documented no-op, not an error.
        message.ack().await.unwrap();
        assert_eq!(message.handled_state(), HandledState::Acked);
    }

    #[tokio::test]
    async fn nack_after_ack_is_a_no_op() {
        let message = message_with(b"hi".to_vec(), None, false);
        message.ack().await.unwrap();
        message.nack().await.unwrap();
        assert_eq!(message.handled_state(), HandledState::Acked);
    }

    #[test]
    fn can_reply_requires_both_properties() {
        let message = message_with(b"hi".to_vec(), None, false);
        assert!(!message.can_reply());
    }
}
