//! AMQP gateway for the courier job dispatcher.
//!
//! This crate implements [`Gateway`] over an AMQP 0-9-1 broker such as
//! RabbitMQ, using separate channels for publishing (in confirm mode) and
//! consuming.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_amqp::{AmqpConfig, AmqpGateway};
//! use courier_core::{JobScheduler, SchedulerConfig};
//!
//! #[tokio::main]
//! async fn main() -> courier_core::Result<()> {
//!     let gateway = AmqpGateway::connect(AmqpConfig::default()).await?;
//!     let scheduler = JobScheduler::new(gateway, SchedulerConfig::default());
//!     scheduler.init().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Reconnects
//!
//! When the connection fails the gateway waits `reconnect_delay`, opens a
//! new connection, re-declares every queue, exchange and binding it has seen
//! and restarts its consumers. Existing [`Subscription`]s keep receiving.
//! Deliveries from the failed connection carry an older epoch in their
//! [`DeliveryTag`] and are rejected by `ack`/`nack`; the broker has already
//! requeued them.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use courier_core::{
    generate_consumer_tag, ConnectionState, CourierError, Delivery, DeliveryTag, ExchangeKind,
    Gateway, HeaderValue, Headers, PublishOptions, QueueOptions, Result, Subscription,
};

/// Connection settings.
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    /// Broker URI.
    pub uri: String,
    /// Wait between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            uri: "amqp://localhost:5672/%2f".to_string(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl AmqpConfig {
    /// Create a new AmqpConfig for `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Set the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

struct Link {
    connection: Connection,
    publish: Channel,
    consume: Channel,
    epoch: u64,
}

#[derive(Clone)]
struct ConsumerSpec {
    queue: String,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Everything declared so far, replayed after a reconnect.
#[derive(Default)]
struct Topology {
    queues: Vec<(String, QueueOptions)>,
    exchanges: Vec<(String, ExchangeKind)>,
    bindings: Vec<(String, String, String)>,
}

struct Inner {
    config: AmqpConfig,
    runtime: Handle,
    link: Mutex<Option<Link>>,
    state: Mutex<ConnectionState>,
    epoch: AtomicU64,
    reconnecting: AtomicBool,
    topology: Mutex<Topology>,
    consumers: Mutex<HashMap<String, ConsumerSpec>>,
}

/// AMQP implementation of [`Gateway`].
#[derive(Clone)]
pub struct AmqpGateway {
    inner: Arc<Inner>,
}

impl AmqpGateway {
    /// Connect to the broker.
    ///
    /// Must be called from within a tokio runtime; reconnects run on it.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let gateway = Self {
            inner: Arc::new(Inner {
                config,
                runtime: Handle::current(),
                link: Mutex::new(None),
                state: Mutex::new(ConnectionState::Init),
                epoch: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                topology: Mutex::new(Topology::default()),
                consumers: Mutex::new(HashMap::new()),
            }),
        };
        gateway.establish().await?;
        tracing::info!(uri = %redact(&gateway.inner.config.uri), "Connected to broker");
        Ok(gateway)
    }

    /// Current connection epoch; increases on every reconnect.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    async fn establish(&self) -> Result<()> {
        let connection = Connection::connect(&self.inner.config.uri, ConnectionProperties::default())
            .await
            .map_err(unavailable)?;
        let publish = connection.create_channel().await.map_err(unavailable)?;
        publish
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(unavailable)?;
        let consume = connection.create_channel().await.map_err(unavailable)?;

        let (queues, exchanges, bindings) = {
            let topology = self.inner.topology.lock();
            (
                topology.queues.clone(),
                topology.exchanges.clone(),
                topology.bindings.clone(),
            )
        };
        for (name, options) in &queues {
            declare_queue_on(&publish, name, options).await?;
        }
        for (name, kind) in &exchanges {
            declare_exchange_on(&publish, name, *kind).await?;
        }
        for (queue, exchange, key) in &bindings {
            bind_queue_on(&publish, queue, exchange, key).await?;
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let consumers: Vec<(String, ConsumerSpec)> = self
            .inner
            .consumers
            .lock()
            .iter()
            .map(|(tag, spec)| (tag.clone(), spec.clone()))
            .collect();
        for (tag, spec) in &consumers {
            start_consumer(&consume, epoch, tag, spec).await?;
        }

        let weak = Arc::downgrade(&self.inner);
        connection.on_error(move |err| {
            if let Some(inner) = Weak::upgrade(&weak) {
                AmqpGateway { inner }.schedule_reconnect(err.to_string());
            }
        });

        *self.inner.link.lock() = Some(Link {
            connection,
            publish,
            consume,
            epoch,
        });
        *self.inner.state.lock() = ConnectionState::Ready;

        tracing::debug!(epoch = epoch, consumers = consumers.len(), "Broker channels ready");
        Ok(())
    }

    fn schedule_reconnect(&self, reason: String) {
        if matches!(
            *self.inner.state.lock(),
            ConnectionState::Draining | ConnectionState::Closed
        ) {
            return;
        }
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.inner.state.lock() = ConnectionState::Init;
        self.inner.link.lock().take();

        let gateway = self.clone();
        self.inner.runtime.spawn(async move {
            let delay = gateway.inner.config.reconnect_delay;
            tracing::warn!(reason = %reason, delay_ms = delay.as_millis() as u64, "Broker connection lost, reconnecting");
            loop {
                tokio::time::sleep(delay).await;
                if gateway.state() != ConnectionState::Init {
                    break;
                }
                match gateway.establish().await {
                    Ok(()) => {
                        tracing::info!(epoch = gateway.epoch(), "Reconnected to broker");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Reconnect failed, retrying");
                    }
                }
            }
            gateway.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Reconnect if an operation failure left a channel unusable.
    fn check_health(&self) {
        let broken = match self.inner.link.lock().as_ref() {
            Some(link) => {
                !link.connection.status().connected()
                    || !link.publish.status().connected()
                    || !link.consume.status().connected()
            }
            None => false,
        };
        if broken {
            self.schedule_reconnect("channel closed".to_string());
        }
    }

    fn publish_channel(&self) -> Result<Channel> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.publish.clone())
            .ok_or_else(not_connected)
    }

    fn consume_channel(&self) -> Result<(Channel, u64)> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| (link.consume.clone(), link.epoch))
            .ok_or_else(not_connected)
    }

    fn channel_for(&self, tag: DeliveryTag) -> Result<Channel> {
        let (channel, epoch) = self.consume_channel()?;
        if tag.epoch != epoch {
            return Err(CourierError::InvalidState(format!(
                "delivery tag {} belongs to a previous connection",
                tag
            )));
        }
        Ok(channel)
    }

    fn track<T>(&self, result: std::result::Result<T, lapin::Error>) -> Result<T> {
        result.map_err(|e| {
            self.check_health();
            unavailable(e)
        })
    }
}

#[async_trait]
impl Gateway for AmqpGateway {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let channel = self.publish_channel()?;
        declare_queue_on(&channel, name, &options).await.map_err(|e| {
            self.check_health();
            e
        })?;

        let mut topology = self.inner.topology.lock();
        topology.queues.retain(|(existing, _)| existing != name);
        topology.queues.push((name.to_string(), options));
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let channel = self.publish_channel()?;
        declare_exchange_on(&channel, name, kind).await.map_err(|e| {
            self.check_health();
            e
        })?;

        let mut topology = self.inner.topology.lock();
        topology.exchanges.retain(|(existing, _)| existing != name);
        topology.exchanges.push((name.to_string(), kind));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.publish_channel()?;
        bind_queue_on(&channel, queue, exchange, routing_key)
            .await
            .map_err(|e| {
                self.check_health();
                e
            })?;

        let binding = (queue.to_string(), exchange.to_string(), routing_key.to_string());
        let mut topology = self.inner.topology.lock();
        if !topology.bindings.contains(&binding) {
            topology.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<()> {
        let channel = self.publish_channel().map_err(|e| CourierError::Publish(e.to_string()))?;
        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties(&options),
            )
            .await
            .map_err(|e| {
                self.check_health();
                publish_error(e)
            })?;
        let confirmation = confirm.await.map_err(|e| {
            self.check_health();
            publish_error(e)
        })?;
        if confirmation.is_nack() {
            return Err(CourierError::Publish(format!(
                "broker rejected message for '{}'",
                routing_key
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription> {
        let (channel, epoch) = self.consume_channel()?;
        let tag = generate_consumer_tag(queue);
        let (tx, rx) = mpsc::unbounded_channel();
        let spec = ConsumerSpec {
            queue: queue.to_string(),
            prefetch,
            tx,
        };

        start_consumer(&channel, epoch, &tag, &spec).await.map_err(|e| {
            self.check_health();
            e
        })?;
        self.inner.consumers.lock().insert(tag.clone(), spec);

        tracing::debug!(queue = %queue, consumer_tag = %tag, prefetch = prefetch, "Consumer started");
        Ok(Subscription::new(queue, tag, rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner.consumers.lock().remove(consumer_tag);
        let (channel, _) = self.consume_channel()?;
        let cancelled = channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await;
        self.track(cancelled)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let channel = self.channel_for(tag)?;
        let acked = channel.basic_ack(tag.value, BasicAckOptions::default()).await;
        self.track(acked)
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let channel = self.channel_for(tag)?;
        let nacked = channel
            .basic_nack(
                tag.value,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await;
        self.track(nacked)
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return Ok(());
            }
            *state = ConnectionState::Draining;
        }

        let link = self.inner.link.lock().take();
        self.inner.consumers.lock().clear();

        let closed = match link {
            Some(link) => link.connection.close(200, "OK").await.map_err(unavailable),
            None => Ok(()),
        };
        *self.inner.state.lock() = ConnectionState::Closed;
        tracing::info!("Broker connection closed");
        closed
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }
}

async fn declare_queue_on(channel: &Channel, name: &str, options: &QueueOptions) -> Result<()> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: options.durable,
                ..Default::default()
            },
            queue_arguments(options),
        )
        .await
        .map_err(unavailable)?;
    Ok(())
}

async fn declare_exchange_on(channel: &Channel, name: &str, kind: ExchangeKind) -> Result<()> {
    channel
        .exchange_declare(
            name,
            exchange_kind(kind),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(unavailable)
}

async fn bind_queue_on(channel: &Channel, queue: &str, exchange: &str, key: &str) -> Result<()> {
    channel
        .queue_bind(
            queue,
            exchange,
            key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(unavailable)
}

/// Register a consumer and forward its deliveries into `spec.tx`.
async fn start_consumer(channel: &Channel, epoch: u64, tag: &str, spec: &ConsumerSpec) -> Result<()> {
    channel
        .basic_qos(spec.prefetch, BasicQosOptions::default())
        .await
        .map_err(unavailable)?;
    let mut consumer = channel
        .basic_consume(
            &spec.queue,
            tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(unavailable)?;

    let queue = spec.queue.clone();
    let tx = spec.tx.clone();
    let tag = tag.to_string();
    tokio::spawn(async move {
        while let Some(next) = consumer.next().await {
            match next {
                Ok(delivery) => {
                    if tx.send(convert_delivery(epoch, &queue, delivery)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(consumer_tag = %tag, error = %e, "Consumer stream failed");
                    break;
                }
            }
        }
        tracing::debug!(consumer_tag = %tag, epoch = epoch, "Consumer stream ended");
    });
    Ok(())
}

fn convert_delivery(epoch: u64, queue: &str, delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();
    Delivery {
        tag: DeliveryTag::new(epoch, delivery.delivery_tag),
        queue: queue.to_string(),
        body: delivery.data,
        headers,
        redelivered: delivery.redelivered,
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &options.dead_letter_exchange {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }
    if let Some(key) = &options.dead_letter_routing_key {
        arguments.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(key.as_str())),
        );
    }
    if let Some(ttl) = options.message_ttl {
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)),
        );
    }
    if let Some(max) = options.max_priority {
        arguments.insert(
            ShortString::from("x-max-priority"),
            AMQPValue::LongInt(i32::from(max)),
        );
    }
    arguments
}

fn properties(options: &PublishOptions) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_delivery_mode(if options.persistent { 2 } else { 1 })
        .with_priority(options.priority);
    if let Some(expiration) = options.expiration_millis() {
        properties = properties.with_expiration(ShortString::from(expiration));
    }
    if let Some(content_type) = &options.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.as_str()));
    }
    if !options.headers.is_empty() {
        properties = properties.with_headers(to_field_table(&options.headers));
    }
    properties
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

/// Headers the dispatcher understands; arrays and tables (e.g. `x-death`) are skipped.
fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| header_value(value).map(|v| (key.as_str().to_string(), v)))
        .collect()
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(b) => Some(HeaderValue::Bool(*b)),
        AMQPValue::ShortShortInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::ShortShortUInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::ShortInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::ShortUInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::LongInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::LongUInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::LongLongInt(i) => Some(HeaderValue::Int(*i)),
        AMQPValue::ShortString(s) => Some(HeaderValue::Str(s.as_str().to_string())),
        AMQPValue::LongString(s) => Some(HeaderValue::Str(
            String::from_utf8_lossy(s.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}

fn unavailable(err: lapin::Error) -> CourierError {
    CourierError::BrokerUnavailable(err.to_string())
}

fn publish_error(err: lapin::Error) -> CourierError {
    CourierError::Publish(err.to_string())
}

fn not_connected() -> CourierError {
    CourierError::BrokerUnavailable("not connected".to_string())
}

/// Hide the credentials in a broker URI for logging.
pub fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &uri[..scheme], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}
