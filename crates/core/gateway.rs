//! Gateway abstraction over a durable, at-least-once message broker.
//!
//! The worker pool and scheduler only ever talk to a [`Gateway`]; the AMQP
//! driver and the in-memory broker are interchangeable behind it.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;

/// Name of the default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Message header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<u32> for HeaderValue {
    fn from(v: u32) -> Self {
        HeaderValue::Int(i64::from(v))
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Str(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Str(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

/// Message headers table.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Well-known header names and accessors.
pub mod headers {
    use super::{HeaderValue, Headers};

    /// Number of times the job has been requeued after a failure.
    pub const RETRY_COUNT: &str = "retryCount";
    /// Queue a dead-lettered message originally failed from.
    pub const FAILED_QUEUE: &str = "failedQueue";
    /// Reason a message was dead-lettered without being processed.
    pub const ERROR: &str = "error";

    /// Read the retry count. Missing or malformed values count as 0.
    pub fn retry_count(headers: &Headers) -> u32 {
        match headers.get(RETRY_COUNT) {
            Some(HeaderValue::Int(n)) => u32::try_from(*n).unwrap_or(0),
            Some(HeaderValue::Str(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Copy of `headers` with the retry count replaced.
    pub fn with_retry_count(headers: &Headers, count: u32) -> Headers {
        let mut out = headers.clone();
        out.insert(RETRY_COUNT.to_string(), HeaderValue::from(count));
        out
    }

    /// Read a string header.
    pub fn get_str<'a>(headers: &'a Headers, key: &str) -> Option<&'a str> {
        match headers.get(key) {
            Some(HeaderValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,
    /// Binding key is a pattern with `*` and `#` wildcards.
    Topic,
    /// Every bound queue receives every message.
    Fanout,
}

/// Options for declaring a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Whether the queue survives a broker restart.
    pub durable: bool,
    /// Exchange expired or rejected messages are routed to.
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering.
    pub dead_letter_routing_key: Option<String>,
    /// Queue-wide time-to-live. Every message expires this long after it
    /// was enqueued, so expiry order matches arrival order.
    pub message_ttl: Option<Duration>,
    /// Highest priority the queue honours. Without it the broker ignores
    /// [`PublishOptions::priority`].
    pub max_priority: Option<u8>,
}

impl QueueOptions {
    /// A durable queue with no dead-letter routing.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Route expired messages to `queue` through the default exchange.
    pub fn dead_letter_to(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(DEFAULT_EXCHANGE.to_string());
        self.dead_letter_routing_key = Some(queue.into());
        self
    }

    /// Expire every message `ttl` after it was enqueued.
    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Enable priorities from 0 to `max`.
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }
}

/// Per-message publish options.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    /// Persist the message to disk.
    pub persistent: bool,
    /// Message priority, 0 when unset. Only honoured by queues declared
    /// with [`QueueOptions::max_priority`].
    pub priority: u8,
    /// Time-to-live; sent on the wire as milliseconds-as-string.
    pub expiration: Option<Duration>,
    /// Content type of the body.
    pub content_type: Option<String>,
    /// Header table.
    pub headers: Headers,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            priority: 0,
            expiration: None,
            content_type: Some("application/json".to_string()),
            headers: Headers::new(),
        }
    }
}

impl PublishOptions {
    /// Set the priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the expiration.
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Replace the headers.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Expiration formatted the way the wire protocol carries it.
    pub fn expiration_millis(&self) -> Option<String> {
        self.expiration.map(|d| d.as_millis().to_string())
    }
}

/// Handle identifying a delivered message for ack/nack.
///
/// `epoch` changes every time the gateway re-opens its consume channel, so a
/// tag issued on a dead channel can never acknowledge a message on a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub epoch: u64,
    pub value: u64,
}

impl DeliveryTag {
    pub fn new(epoch: u64, value: u64) -> Self {
        Self { epoch, value }
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.epoch, self.value)
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    /// Queue the message was consumed from.
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
}

/// An active consumer registration.
///
/// Deliveries arrive in broker order. The stream ends when the consumer is
/// cancelled or the gateway is closed.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            rx,
        }
    }

    /// Wait for the next delivery.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Ready,
    Draining,
    Closed,
}

/// Operations the dispatcher needs from a message broker.
///
/// Exactly one of [`ack`](Gateway::ack) / [`nack`](Gateway::nack) must be
/// issued per delivery. Callers are responsible for never acknowledging the
/// same tag twice.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Assert a queue exists. Idempotent.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Assert a durable exchange exists. Idempotent.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Bind a queue to an exchange with a routing key or pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message. Returns once the broker has accepted it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<()>;

    /// Start consuming a queue with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription>;

    /// Stop a consumer. Already-delivered messages stay unacknowledged.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Acknowledge a delivery.
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// Negatively acknowledge a delivery, optionally requeueing it.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Close the connection. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<()>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;
}

/// A type-erased gateway that can be shared across threads.
pub type DynGateway = Arc<dyn Gateway>;

/// Wrapper around Arc<dyn Gateway> for convenience.
#[derive(Clone)]
pub struct SharedGateway {
    inner: DynGateway,
}

impl SharedGateway {
    /// Create a new SharedGateway from any Gateway implementation.
    pub fn new<G: Gateway + 'static>(gateway: G) -> Self {
        Self {
            inner: Arc::new(gateway),
        }
    }

    /// Get a reference to the inner gateway.
    pub fn inner(&self) -> &DynGateway {
        &self.inner
    }
}

#[async_trait]
impl Gateway for SharedGateway {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.inner.declare_queue(name, options).await
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.inner.declare_exchange(name, kind).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<()> {
        self.inner.publish(exchange, routing_key, body, options).await
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription> {
        self.inner.consume(queue, prefetch).await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner.cancel(consumer_tag).await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.inner.ack(tag).await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.inner.nack(tag, requeue).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }
}

/// Generate a consumer tag unique to this process.
pub fn generate_consumer_tag(queue: &str) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}-{}", queue, host, pid, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_count_missing_is_zero() {
        assert_eq!(headers::retry_count(&Headers::new()), 0);
    }

    #[test]
    fn test_retry_count_malformed_is_zero() {
        let mut h = Headers::new();
        h.insert(headers::RETRY_COUNT.to_string(), HeaderValue::Str("three".into()));
        assert_eq!(headers::retry_count(&h), 0);

        h.insert(headers::RETRY_COUNT.to_string(), HeaderValue::Int(-4));
        assert_eq!(headers::retry_count(&h), 0);

        h.insert(headers::RETRY_COUNT.to_string(), HeaderValue::Bool(true));
        assert_eq!(headers::retry_count(&h), 0);
    }

    #[test]
    fn test_retry_count_numeric_string() {
        let mut h = Headers::new();
        h.insert(headers::RETRY_COUNT.to_string(), HeaderValue::Str("2".into()));
        assert_eq!(headers::retry_count(&h), 2);
    }

    #[test]
    fn test_with_retry_count_keeps_other_headers() {
        let mut h = Headers::new();
        h.insert("traceId".to_string(), HeaderValue::from("abc"));
        let updated = headers::with_retry_count(&h, 3);
        assert_eq!(headers::retry_count(&updated), 3);
        assert_eq!(headers::get_str(&updated, "traceId"), Some("abc"));
        assert_eq!(headers::retry_count(&h), 0);
    }

    #[test]
    fn test_publish_options_default_is_persistent_json() {
        let opts = PublishOptions::default();
        assert!(opts.persistent);
        assert_eq!(opts.priority, 0);
        assert_eq!(opts.content_type.as_deref(), Some("application/json"));
        assert!(opts.expiration_millis().is_none());
    }

    #[test]
    fn test_expiration_is_millis_string() {
        let opts = PublishOptions::default().expiration(Duration::from_secs(3600));
        assert_eq!(opts.expiration_millis().as_deref(), Some("3600000"));
    }

    #[test]
    fn test_queue_options_dead_letter_to() {
        let opts = QueueOptions::durable().dead_letter_to("image_processing");
        assert!(opts.durable);
        assert_eq!(opts.dead_letter_exchange.as_deref(), Some(DEFAULT_EXCHANGE));
        assert_eq!(opts.dead_letter_routing_key.as_deref(), Some("image_processing"));
    }

    #[test]
    fn test_consumer_tag_contains_queue() {
        let a = generate_consumer_tag("reports_generation");
        let b = generate_consumer_tag("reports_generation");
        assert!(a.starts_with("reports_generation-"));
        assert_ne!(a, b);
    }
}
