//! The [`Publisher`]: publish with/without confirms, and the RPC reply-routing map.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use std::sync::{OnceLock, Weak};

use tokio::sync::{oneshot, RwLock};
use tokio::time::{sleep, timeout};
use tracing::warn;
use uuid::Uuid;

use crate::connection::{ConnectionManager, Reestablish};
use crate::error::{Error, Result, TransientSource};
use crate::message::{decode_payload, Payload};
use crate::state::ChainState;
use crate::topology::Queue;

/// An outbound message body: either raw bytes, or a JSON value to be encoded per
/// `State::json`.
#[derive(Debug, Clone)]
pub enum Publishable {
    /// Passed through to the broker unchanged, regardless of `State::json`.
    Bytes(Vec<u8>),
    /// Encoded as UTF-8 JSON when `State::json` is true; otherwise still serialized to
    /// bytes, but without the JSON content-type headers.
    Json(serde_json::Value),
}

impl From<Vec<u8>> for Publishable {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Publishable {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<String> for Publishable {
    fn from(s: String) -> Self {
        Self::Bytes(s.into_bytes())
    }
}

impl From<&str> for Publishable {
    fn from(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }
}

impl From<serde_json::Value> for Publishable {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

fn encode(payload: Publishable, json_policy: bool) -> (Vec<u8>, bool) {
    match payload {
        Publishable::Bytes(b) => (b, false),
        Publishable::Json(v) => (serde_json::to_vec(&v).unwrap_or_default(), json_policy),
    }
}

/// Per-publish overrides for the AMQP message properties.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// `correlationId` property. Set automatically by `rpc`.
    pub correlation_id: Option<String>,
    /// `replyTo` property. Set automatically by `rpc`.
    pub reply_to: Option<String>,
    /// `messageId` property.
    pub message_id: Option<String>,
    /// `timestamp` property, as Unix seconds.
    pub timestamp: Option<u64>,
    /// `appId` property.
    pub app_id: Option<String>,
    /// `type` property.
    pub kind: Option<String>,
    /// `priority` property (0-255, though most brokers only honor 0-9).
    pub priority: Option<u8>,
    /// `expiration` property, as a broker-formatted millisecond string.
    pub expiration: Option<String>,
    /// User-defined headers.
    pub headers: FieldTable,
    /// How long to wait for the broker's confirm before failing with
    /// [`Error::Timeout`]. Only meaningful when `State::confirm` is true. `None` (the
    /// default) waits indefinitely.
    pub timeout: Option<Duration>,
}

fn build_properties(options: &PublishOptions, set_json_headers: bool) -> BasicProperties {
    let mut properties = BasicProperties::default().with_headers(options.headers.clone());
    if let Some(correlation_id) = &options.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &options.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    if let Some(message_id) = &options.message_id {
        properties = properties.with_message_id(message_id.as_str().into());
    }
    if let Some(timestamp) = options.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if let Some(app_id) = &options.app_id {
        properties = properties.with_app_id(app_id.as_str().into());
    }
    if let Some(kind) = &options.kind {
        properties = properties.with_kind(kind.as_str().into());
    }
    if let Some(priority) = options.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(expiration) = &options.expiration {
        properties = properties.with_expiration(expiration.as_str().into());
    }
    crate::message::content_type_properties(properties, set_json_headers)
}

/// Per-`rpc` call overrides, layered on top of [`PublishOptions`].
#[derive(Debug, Clone, Default)]
pub struct RpcOptions {
    /// How long to wait for a reply before failing with [`Error::Timeout`]. `None`
    /// (the default) waits indefinitely.
    pub timeout: Option<Duration>,
    /// Extra publish options to apply to the request (headers, priority, ...).
    /// `correlation_id` and `reply_to` are always overwritten by `rpc` itself.
    pub publish: PublishOptions,
}

/// How many times a confirm-mode publish is retried against a freshly reestablished
/// channel after its connection is lost mid-publish, before giving up and surfacing the
/// transient error to the caller.
const CONFIRM_RETRY_CAP: u32 = 3;

/// Publishes messages on behalf of one [`crate::Chain`], with or without broker
/// confirms, and drives request/reply (RPC) correlation.
pub(crate) struct Publisher {
    state: Arc<ChainState>,
}

impl Publisher {
    pub(crate) fn new(state: Arc<ChainState>) -> Self {
        Self { state }
    }

    /// `publish(routingKey, payload, options)`: publishes to `State::exchange` (the
    /// default exchange if none is set).
    ///
    /// # Errors
    /// See the module-level error taxonomy: [`Error::Transient`] on a lost channel,
    /// [`Error::Timeout`] on a confirm-mode timeout, [`Error::Setup`] if the broker
    /// rejects a confirmed publish outright.
    pub(crate) async fn publish(
        &self,
        routing_key: &str,
        payload: Publishable,
        options: PublishOptions,
    ) -> Result<()> {
        let exchange = self
            .state
            .exchange
            .as_ref()
            .map(|e| e.name().to_string())
            .unwrap_or_default();
        self.publish_raw(&exchange, routing_key, payload, options)
            .await
    }

    /// `publishToQueue(queue, payload, options)`: publishes directly to `queue` via the
    /// default exchange.
    ///
    /// # Errors
    /// See [`Publisher::publish`].
    pub(crate) async fn publish_to_queue(
        &self,
        queue: &str,
        payload: Publishable,
        options: PublishOptions,
    ) -> Result<()> {
        self.publish_raw("", queue, payload, options).await
    }

    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Publishable,
        options: PublishOptions,
    ) -> Result<()> {
        let (bytes, set_json) = encode(payload, self.state.json);
        let properties = build_properties(&options, set_json);
        let publish_timeout = options.timeout;

        if self.state.confirm {
            if self.state.reestablish {
                self.publish_confirm_with_retry(exchange, routing_key, &bytes, properties, publish_timeout)
                    .await
            } else {
                let channel = self.state.connection_manager.get_confirm_channel().await?;
                publish_with_confirm(&channel, exchange, routing_key, &bytes, properties, publish_timeout).await
            }
        } else {
            let channel = self.state.connection_manager.get_channel().await?;
            channel
                .basic_publish(exchange, routing_key, BasicPublishOptions::default(), &bytes, properties)
                .await?;
            Ok(())
        }
    }

    /// Retries a confirm-mode publish against a freshly reestablished channel when it
    /// fails due to a connection loss, up to [`CONFIRM_RETRY_CAP`] attempts. A broker
    /// `basic.nack` is not retried: the publish reached the broker and was rejected on
    /// its merits, so resending it would just get nacked again.
    async fn publish_confirm_with_retry(
        &self,
        exchange: &str,
        routing_key: &str,
        bytes: &[u8],
        properties: BasicProperties,
        publish_timeout: Option<Duration>,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            let channel = self.state.connection_manager.get_confirm_channel().await?;
            match publish_with_confirm(&channel, exchange, routing_key, bytes, properties.clone(), publish_timeout)
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::Transient(source)) if !matches!(source, TransientSource::Nacked) => {
                    if attempt >= CONFIRM_RETRY_CAP {
                        return Err(Error::Transient(source));
                    }
                    attempt += 1;
                    warn!(attempt, cap = CONFIRM_RETRY_CAP, "confirm-mode publish lost its connection, retrying");
                    sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `rpc(payload, options)`: publishes `payload` to `State::queue` with a fresh
    /// correlation ID and a `replyTo` pointing at this Connection Manager's shared
    /// reply queue, then awaits the matching reply.
    ///
    /// # Errors
    /// [`Error::Config`] if `State::queue` is unset. [`Error::Timeout`] if no reply
    /// arrives within `options.timeout`. [`Error::Transient`] if the connection is
    /// lost before a reply arrives.
    pub(crate) async fn rpc(&self, payload: Publishable, options: RpcOptions) -> Result<Payload> {
        let queue = self
            .state
            .queue
            .as_ref()
            .ok_or_else(|| Error::config("rpc requires a target queue (Chain::queue)"))?;

        let registry = self
            .state
            .connection_manager
            .reply_registry(self.state.json)
            .await?;
        let reply_queue_name = registry.queue_name().await;

        let correlation_id = Uuid::new_v4().to_string();
        let rx = registry.register(correlation_id.clone());

        let mut publish_options = options.publish;
        publish_options.correlation_id = Some(correlation_id.clone());
        publish_options.reply_to = Some(reply_queue_name);

        if let Err(e) = self
            .publish_to_queue(queue.name(), payload, publish_options)
            .await
        {
            registry.cancel(&correlation_id);
            return Err(e);
        }

        let reply = match options.timeout {
            Some(duration) => match timeout(duration, rx).await {
                Ok(result) => result,
                Err(_) => {
                    registry.cancel(&correlation_id);
                    return Err(Error::Timeout);
                }
            },
            None => rx.await,
        };

        reply.map_err(|_| Error::Transient(TransientSource::ManagerClosed))
    }
}

async fn publish_with_confirm(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    bytes: &[u8],
    properties: BasicProperties,
    publish_timeout: Option<Duration>,
) -> Result<()> {
    let confirmation = match publish_timeout {
        Some(duration) => {
            let confirm = timeout(duration, channel.basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                bytes,
                properties,
            ))
            .await
            .map_err(|_| Error::Timeout)??;
            timeout(duration, confirm).await.map_err(|_| Error::Timeout)??
        }
        None => {
            channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    bytes,
                    properties,
                )
                .await?
                .await?
        }
    };

    match confirmation {
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        Confirmation::Nack(_) => Err(Error::Transient(TransientSource::Nacked)),
    }
}

/// The RPC reply-routing map: one per Connection Manager lifetime, shared by every
/// Chain that calls `rpc`. Owns the anonymous, exclusive, auto-delete reply queue and
/// its single subscriber.
pub(crate) struct ReplyRegistry {
    connection_manager: Arc<ConnectionManager>,
    json: bool,
    queue_name: RwLock<String>,
    waiters: DashMap<String, oneshot::Sender<Payload>>,
    /// Set once, right after construction, so `reestablish` can hand its own `Arc` to a
    /// freshly spawned dispatch loop without holding one itself (which would make the
    /// registry keep itself alive forever).
    self_ref: OnceLock<Weak<Self>>,
}

impl ReplyRegistry {
    /// Declares the reply queue, starts its dispatch loop, and registers the registry
    /// to be reestablished after every future reconnect.
    pub(crate) async fn start(connection_manager: Arc<ConnectionManager>, json: bool) -> Result<Arc<Self>> {
        let channel = connection_manager.get_consumer_channel().await?;
        let queue = Queue::anonymous();
        let declared = channel
            .queue_declare(queue.name(), queue.declare_options(), FieldTable::default())
            .await
            .map_err(Error::Setup)?;
        let queue_name = declared.name().as_str().to_string();
        let consumer = channel
            .basic_consume(
                &queue_name,
                "warren-rpc-reply",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(Error::Setup)?;

        let registry = Arc::new(Self {
            connection_manager: Arc::clone(&connection_manager),
            json,
            queue_name: RwLock::new(queue_name),
            waiters: DashMap::new(),
            self_ref: OnceLock::new(),
        });
        let _ = registry.self_ref.set(Arc::downgrade(&registry));

        tokio::spawn(Arc::clone(&registry).run(consumer));
        connection_manager
            .register_consumer(Arc::clone(&registry) as Arc<dyn Reestablish>)
            .await;

        Ok(registry)
    }

    /// The broker-assigned reply queue name, to be set as `replyTo` on RPC requests.
    async fn queue_name(&self) -> String {
        self.queue_name.read().await.clone()
    }

    /// Registers a waiter for `correlation_id`, returning the receiving half of its
    /// one-shot reply slot.
    fn register(&self, correlation_id: String) -> oneshot::Receiver<Payload> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(correlation_id, tx);
        rx
    }

    /// Removes a waiter without fulfilling it (on timeout or publish failure).
    fn cancel(&self, correlation_id: &str) {
        self.waiters.remove(correlation_id);
    }

    async fn run(self: Arc<Self>, mut consumer: lapin::Consumer) {
        use futures::StreamExt;

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    warn!("rpc reply consumer error, stopping dispatch loop: {e}");
                    break;
                }
            };

            let correlation_id = delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|c| c.to_string());
            let payload = decode_payload(&delivery.data, &delivery.properties, self.json);

            match correlation_id.and_then(|id| self.waiters.remove(&id)) {
                Some((_, tx)) => {
                    let _ = tx.send(payload);
                }
                None => {
                    warn!("rpc reply had no matching waiter (late, cancelled, or timed out); dropping");
                }
            }

            if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                warn!("failed to ack rpc reply delivery: {e}");
            }
        }
    }
}

#[async_trait]
impl Reestablish for ReplyRegistry {
    async fn reestablish(&self, connection: &Connection) -> Result<()> {
        let pinned_name = self.queue_name().await;
        let channel = connection.create_channel().await?;
        let queue = Queue::anonymous().renamed(pinned_name.clone());
        channel
            .queue_declare(&pinned_name, queue.declare_options(), FieldTable::default())
            .await
            .map_err(Error::Setup)?;
        let consumer = channel
            .basic_consume(
                &pinned_name,
                "warren-rpc-reply",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(Error::Setup)?;

        // Any RPCs still awaiting a reply lose their waiter here: the connection that
        // would have carried their reply is gone, so nothing will ever fulfill them.
        // Dropping the senders surfaces `Error::Transient(ManagerClosed)` to the caller
        // instead of leaving them waiting forever.
        self.waiters.clear();

        let registry = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Error::Closed("ConnectionManager"))?;
        tokio::spawn(registry.run(consumer));
        Ok(())
    }
}
