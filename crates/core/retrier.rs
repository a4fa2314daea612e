//! Retry and dead-letter policy applied to failed jobs.
//!
//! A failed delivery is either republished with its retry counter
//! incremented after an exponential backoff, or moved to the dead-letter
//! queue once the attempt bound is exceeded. In both cases the original
//! delivery is acknowledged only after the replacement publish succeeded;
//! if that publish fails the original is requeued instead, so a crash or
//! broker error never loses the job.

use std::time::Duration;

use crate::error::Result;
use crate::gateway::{
    headers, Delivery, Gateway, HeaderValue, PublishOptions, QueueOptions, DEFAULT_EXCHANGE,
};
use crate::registry::Slot;

/// How a delayed retry is held until it is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Park the message in `<queue>.retry.<attempt>`, a queue whose
    /// message TTL is that attempt's backoff; the broker dead-letters it back
    /// onto `<queue>` when it expires. One queue per attempt keeps expiry in
    /// arrival order, since the broker only expires messages at the head.
    /// Survives a worker restart.
    BrokerDelay,
    /// Hold the message unacknowledged and republish from an in-process
    /// timer. Each pending retry occupies a prefetch slot beyond the
    /// concurrency limit (see `WorkerConfig::retry_headroom`). A restart
    /// returns the message to the queue unretried.
    Timer,
}

/// Bounds and timing for retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of requeues before dead-lettering.
    pub max_attempts: u32,
    /// Backoff base; the n-th retry waits `2^n * base_delay`.
    pub base_delay: Duration,
    /// Reserved queue for jobs that exhausted their attempts.
    pub dead_letter_queue: String,
    pub strategy: RetryStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            dead_letter_queue: "dead_letter".to_string(),
            strategy: RetryStrategy::BrokerDelay,
        }
    }
}

/// What the policy decided for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish with `attempt` in headers after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Move to the dead-letter queue.
    DeadLetter,
}

impl RetryPolicy {
    /// Backoff before retrying a job that failed with `attempt` prior requeues.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_add(1));
        self.base_delay.saturating_mul(multiplier)
    }

    /// Decide the fate of a job that failed with `attempt` prior requeues.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        let next = attempt.saturating_add(1);
        if next <= self.max_attempts {
            RetryDecision::Retry {
                attempt: next,
                delay: self.backoff(attempt),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }

    /// Delay queue holding the `attempt`-th retry of `queue` under
    /// [`RetryStrategy::BrokerDelay`].
    pub fn retry_queue(queue: &str, attempt: u32) -> String {
        format!("{}.retry.{}", queue, attempt)
    }
}

/// Applies a [`RetryPolicy`] through a gateway.
#[derive(Clone)]
pub struct Retrier<G: Gateway + Clone + 'static> {
    gateway: G,
    policy: RetryPolicy,
}

impl<G: Gateway + Clone + 'static> Retrier<G> {
    /// Create a new Retrier.
    pub fn new(gateway: G, policy: RetryPolicy) -> Self {
        Self { gateway, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Declare the dead-letter queue and, for broker-held retries, one delay
    /// queue per attempt for `queue`.
    pub async fn prepare(&self, queue: &str) -> Result<()> {
        self.gateway
            .declare_queue(&self.policy.dead_letter_queue, QueueOptions::durable())
            .await?;
        if self.policy.strategy == RetryStrategy::BrokerDelay {
            for attempt in 1..=self.policy.max_attempts {
                self.gateway
                    .declare_queue(
                        &RetryPolicy::retry_queue(queue, attempt),
                        QueueOptions::durable()
                            .dead_letter_to(queue)
                            .message_ttl(self.policy.backoff(attempt - 1)),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Handle a delivery whose handler reported a failure.
    ///
    /// `slot` is held until the delivery is settled. A timer-held retry keeps
    /// it in the background and republishes early once the slot is released.
    pub async fn handle_failure(&self, delivery: Delivery, error: &str, slot: Slot) -> RetryDecision {
        let attempt = headers::retry_count(&delivery.headers);
        let decision = self.policy.decide(attempt);

        match decision {
            RetryDecision::Retry { attempt: next, delay } => {
                tracing::info!(
                    queue = %delivery.queue,
                    attempt = next,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job scheduled for retry"
                );
                match self.policy.strategy {
                    RetryStrategy::BrokerDelay => {
                        self.retry_via_broker(&delivery, next).await;
                        drop(slot);
                    }
                    RetryStrategy::Timer => {
                        let retrier = self.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = slot.released() => {
                                    tracing::info!(
                                        queue = %delivery.queue,
                                        attempt = next,
                                        "Shutting down, republishing pending retry early"
                                    );
                                }
                            }
                            retrier.retry_now(&delivery, next).await;
                            drop(slot);
                        });
                    }
                }
            }
            RetryDecision::DeadLetter => {
                tracing::warn!(
                    queue = %delivery.queue,
                    attempts = attempt.saturating_add(1),
                    error = %error,
                    "Job moved to dead-letter queue"
                );
                let mut extra = headers::with_retry_count(&delivery.headers, attempt);
                extra.insert(
                    headers::FAILED_QUEUE.to_string(),
                    HeaderValue::from(delivery.queue.as_str()),
                );
                self.publish_then_ack(&delivery, &self.policy.dead_letter_queue, extra)
                    .await;
                drop(slot);
            }
        }

        decision
    }

    /// Move an undecodable delivery to the dead-letter queue.
    pub async fn dead_letter_malformed(&self, delivery: &Delivery, reason: &str) {
        let mut extra = delivery.headers.clone();
        extra.insert(
            headers::FAILED_QUEUE.to_string(),
            HeaderValue::from(delivery.queue.as_str()),
        );
        extra.insert(headers::ERROR.to_string(), HeaderValue::from(reason));

        let published = self
            .gateway
            .publish(
                DEFAULT_EXCHANGE,
                &self.policy.dead_letter_queue,
                &delivery.body,
                PublishOptions::default().headers(extra),
            )
            .await;

        let settled = match published {
            Ok(()) => self.gateway.ack(delivery.tag).await,
            Err(e) => {
                tracing::error!(queue = %delivery.queue, error = %e, "Failed to dead-letter malformed message, discarding");
                self.gateway.nack(delivery.tag, false).await
            }
        };
        if let Err(e) = settled {
            tracing::error!(queue = %delivery.queue, error = %e, "Failed to settle malformed message");
        }
    }

    async fn retry_via_broker(&self, delivery: &Delivery, attempt: u32) {
        let retry_queue = RetryPolicy::retry_queue(&delivery.queue, attempt);
        let updated = headers::with_retry_count(&delivery.headers, attempt);
        self.publish_then_ack(delivery, &retry_queue, updated).await;
    }

    async fn retry_now(&self, delivery: &Delivery, attempt: u32) {
        let updated = headers::with_retry_count(&delivery.headers, attempt);
        self.publish_then_ack(delivery, &delivery.queue, updated).await;
    }

    async fn publish_then_ack(&self, delivery: &Delivery, queue: &str, headers: crate::gateway::Headers) {
        let options = PublishOptions::default().headers(headers);

        let published = self
            .gateway
            .publish(DEFAULT_EXCHANGE, queue, &delivery.body, options)
            .await;

        let settled = match published {
            Ok(()) => self.gateway.ack(delivery.tag).await,
            Err(e) => {
                tracing::error!(
                    queue = %queue,
                    error = %e,
                    "Replacement publish failed, requeueing original"
                );
                self.gateway.nack(delivery.tag, true).await
            }
        };
        if let Err(e) = settled {
            tracing::error!(tag = %delivery.tag, error = %e, "Failed to settle delivery");
        }
    }
}
