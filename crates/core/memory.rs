//! In-memory broker for tests and local development.
//!
//! Implements the same at-least-once semantics the worker pool relies on:
//! per-consumer prefetch windows, ack/nack with requeue, redelivery of
//! unacknowledged messages on close, exchanges with direct/topic/fanout
//! routing, and per-message or per-queue expiration with dead-letter routing.
//! As on RabbitMQ, an expired message only leaves its queue once it reaches
//! the head, so a long expiry delays every message queued behind it.
//! [`MemoryBroker::connect`] opens further connections onto the same queues,
//! each closing independently.
//! Priority ordering is not modelled; queues are strictly FIFO.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{CourierError, Result};
use crate::gateway::{
    generate_consumer_tag, ConnectionState, Delivery, DeliveryTag, ExchangeKind, Gateway, Headers,
    PublishOptions, QueueOptions, Subscription, DEFAULT_EXCHANGE,
};
use crate::topic;

/// Snapshot of a message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub priority: u8,
    pub expiration: Option<Duration>,
    pub persistent: bool,
    pub redelivered: bool,
}

#[derive(Debug, Clone)]
struct Stored {
    message: Message,
    expires_at: Option<Instant>,
}

struct QueueState {
    options: QueueOptions,
    messages: VecDeque<Stored>,
}

struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct Consumer {
    conn: u64,
    tag: String,
    queue: String,
    prefetch: u16,
    unacked: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    conn: u64,
    queue: String,
    consumer_tag: String,
    stored: Stored,
}

struct BrokerState {
    closed: HashSet<u64>,
    next_conn: u64,
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    consumers: Vec<Consumer>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    publish_count: u64,
    fail_publishes: bool,
}

impl BrokerState {
    fn ensure_open(&self, conn: u64) -> Result<()> {
        if self.closed.contains(&conn) {
            return Err(CourierError::BrokerUnavailable(
                "connection closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Queues a message published to `exchange` with `routing_key` lands in.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let kind = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| CourierError::Publish(format!("no exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic::matches(&b.routing_key, routing_key),
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    /// Enqueue a copy of `message` on each target; returns the expiry sweeps to schedule.
    fn enqueue(&mut self, targets: &[String], message: &Message) -> Vec<(String, Duration)> {
        let mut timers = Vec::new();
        let now = Instant::now();
        for queue in targets {
            if let Some(state) = self.queues.get_mut(queue) {
                let ttl = match (message.expiration, state.options.message_ttl) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                state.messages.push_back(Stored {
                    message: message.clone(),
                    expires_at: ttl.map(|ttl| now + ttl),
                });
                if let Some(ttl) = ttl {
                    timers.push((queue.clone(), ttl));
                }
            }
        }
        timers
    }

    /// Dead-letter expired messages from the head of `queue`, stopping at the
    /// first live one.
    fn sweep(&mut self, queue: &str) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let mut timers = Vec::new();
        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                break;
            };
            let expired = q
                .messages
                .front()
                .and_then(|s| s.expires_at)
                .is_some_and(|at| at <= now);
            if !expired {
                break;
            }
            let Some(stored) = q.messages.pop_front() else {
                break;
            };
            tracing::trace!(queue = %queue, "Message expired");
            timers.extend(self.dead_letter(queue, stored.message));
        }
        timers
    }

    /// Route a rejected or expired message through its queue's dead-letter settings.
    fn dead_letter(&mut self, queue: &str, mut message: Message) -> Vec<(String, Duration)> {
        let Some(options) = self.queues.get(queue).map(|q| q.options.clone()) else {
            return Vec::new();
        };
        let (Some(exchange), Some(key)) = (
            options.dead_letter_exchange.as_deref(),
            options.dead_letter_routing_key.as_deref(),
        ) else {
            return Vec::new();
        };
        message.expiration = None;
        message.redelivered = false;
        match self.route(exchange, key) {
            Ok(targets) => self.enqueue(&targets, &message),
            Err(_) => Vec::new(),
        }
    }

    /// Push queued messages to consumers with room in their prefetch window.
    fn dispatch(&mut self) {
        let mut closed = Vec::new();
        for idx in 0..self.consumers.len() {
            loop {
                let consumer = &self.consumers[idx];
                if consumer.prefetch > 0 && consumer.unacked >= usize::from(consumer.prefetch) {
                    break;
                }
                let queue_name = consumer.queue.clone();
                let Some(stored) = self
                    .queues
                    .get_mut(&queue_name)
                    .and_then(|q| q.messages.pop_front())
                else {
                    break;
                };

                self.next_tag += 1;
                let tag = self.next_tag;
                let delivery = Delivery {
                    tag: DeliveryTag::new(consumer.conn, tag),
                    queue: queue_name.clone(),
                    body: stored.message.body.clone(),
                    headers: stored.message.headers.clone(),
                    redelivered: stored.message.redelivered,
                };

                let consumer = &mut self.consumers[idx];
                if consumer.tx.send(delivery).is_err() {
                    if let Some(q) = self.queues.get_mut(&queue_name) {
                        q.messages.push_front(stored);
                    }
                    closed.push(consumer.tag.clone());
                    break;
                }
                consumer.unacked += 1;
                let consumer_tag = consumer.tag.clone();
                let conn = consumer.conn;
                self.unacked.insert(
                    tag,
                    Unacked {
                        conn,
                        queue: queue_name,
                        consumer_tag,
                        stored,
                    },
                );
            }
        }
        self.consumers.retain(|c| !closed.contains(&c.tag));
    }

    /// Take the unacked entry for `tag`; tags only settle on their own connection.
    fn settle(&mut self, conn: u64, tag: DeliveryTag) -> Result<Unacked> {
        let owned = self
            .unacked
            .get(&tag.value)
            .is_some_and(|entry| entry.conn == conn && tag.epoch == conn);
        if !owned {
            return Err(CourierError::InvalidState(format!(
                "unknown delivery tag {}",
                tag
            )));
        }
        let entry = self
            .unacked
            .remove(&tag.value)
            .ok_or_else(|| CourierError::InvalidState(format!("unknown delivery tag {}", tag)))?;
        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.tag == entry.consumer_tag)
        {
            consumer.unacked = consumer.unacked.saturating_sub(1);
        }
        Ok(entry)
    }
}

/// An in-process broker implementing [`Gateway`].
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    conn: u64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker in the `Ready` state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                closed: HashSet::new(),
                next_conn: 1,
                queues: HashMap::new(),
                exchanges: HashMap::new(),
                bindings: Vec::new(),
                consumers: Vec::new(),
                unacked: HashMap::new(),
                next_tag: 0,
                publish_count: 0,
                fail_publishes: false,
            })),
            conn: 0,
        }
    }

    /// Open another connection to the same broker.
    ///
    /// Clones share one connection; closing it affects every clone. A handle
    /// from `connect` owns its consumers and unacked deliveries, and closing
    /// it leaves other connections running.
    pub fn connect(&self) -> Self {
        let mut state = self.state.lock();
        let conn = state.next_conn;
        state.next_conn += 1;
        Self {
            state: self.state.clone(),
            conn,
        }
    }

    /// Number of ready (undelivered) messages in a queue.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Snapshot of the ready messages in a queue.
    pub fn messages(&self, queue: &str) -> Vec<Message> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether a queue has been declared.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Options a queue was declared with.
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.state.lock().queues.get(queue).map(|q| q.options.clone())
    }

    /// Number of delivered but unacknowledged messages.
    pub fn unacked_len(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Number of active consumers on a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .count()
    }

    /// Number of successful publishes since creation.
    pub fn publish_count(&self) -> u64 {
        self.state.lock().publish_count
    }

    /// Make every subsequent publish fail as if the channel were closed.
    pub fn set_publish_failure(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    fn start_timers(&self, timers: Vec<(String, Duration)>) {
        for (queue, ttl) in timers {
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                broker.expire(&queue);
            });
        }
    }

    fn expire(&self, queue: &str) {
        let timers = {
            let mut state = self.state.lock();
            let timers = state.sweep(queue);
            state.dispatch();
            timers
        };
        self.start_timers(timers);
    }
}

#[async_trait]
impl Gateway for MemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open(self.conn)?;
        if let Some(existing) = state.queues.get(name) {
            if existing.options != options {
                return Err(CourierError::InvalidState(format!(
                    "queue '{}' already declared with different options",
                    name
                )));
            }
            return Ok(());
        }
        state.queues.insert(
            name.to_string(),
            QueueState {
                options,
                messages: VecDeque::new(),
            },
        );
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open(self.conn)?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(CourierError::InvalidState(format!(
                "exchange '{}' already declared as {:?}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open(self.conn)?;
        if !state.queues.contains_key(queue) {
            return Err(CourierError::InvalidState(format!("no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(CourierError::InvalidState(format!("no exchange '{}'", exchange)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
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
        let timers = {
            let mut state = self.state.lock();
            if state.fail_publishes || state.closed.contains(&self.conn) {
                return Err(CourierError::Publish("channel closed".to_string()));
            }
            let targets = state.route(exchange, routing_key)?;
            let message = Message {
                body: body.to_vec(),
                headers: options.headers,
                priority: options.priority,
                expiration: options.expiration,
                persistent: options.persistent,
                redelivered: false,
            };
            let timers = state.enqueue(&targets, &message);
            state.publish_count += 1;
            state.dispatch();
            timers
        };
        self.start_timers(timers);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription> {
        let mut state = self.state.lock();
        state.ensure_open(self.conn)?;
        if !state.queues.contains_key(queue) {
            return Err(CourierError::InvalidState(format!("no queue '{}'", queue)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let tag = generate_consumer_tag(queue);
        state.consumers.push(Consumer {
            conn: self.conn,
            tag: tag.clone(),
            queue: queue.to_string(),
            prefetch,
            unacked: 0,
            tx,
        });
        state.dispatch();
        Ok(Subscription::new(queue, tag, rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.consumers.retain(|c| c.tag != consumer_tag);
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open(self.conn)?;
        state.settle(self.conn, tag)?;
        state.dispatch();
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let timers = {
            let mut state = self.state.lock();
            state.ensure_open(self.conn)?;
            let entry = state.settle(self.conn, tag)?;
            let timers = if requeue {
                let mut stored = entry.stored;
                stored.message.redelivered = true;
                if let Some(q) = state.queues.get_mut(&entry.queue) {
                    q.messages.push_front(stored);
                }
                Vec::new()
            } else {
                state.dead_letter(&entry.queue, entry.stored.message)
            };
            state.dispatch();
            timers
        };
        self.start_timers(timers);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.closed.insert(self.conn) {
            return Ok(());
        }
        let conn = self.conn;
        state.consumers.retain(|c| c.conn != conn);
        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, entry)| entry.conn == conn)
            .map(|(tag, _)| *tag)
            .collect();
        let mut returned: Vec<(u64, Unacked)> = tags
            .into_iter()
            .filter_map(|tag| state.unacked.remove(&tag).map(|entry| (tag, entry)))
            .collect();
        // Highest tag first so push_front restores delivery order.
        returned.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, entry) in returned {
            let mut stored = entry.stored;
            stored.message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&entry.queue) {
                q.messages.push_front(stored);
            }
        }
        state.dispatch();
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.state.lock().closed.contains(&self.conn) {
            ConnectionState::Closed
        } else {
            ConnectionState::Ready
        }
    }
}
