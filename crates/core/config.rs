//! Configuration types for the job dispatch library.

use std::time::Duration;

use crate::error::{CourierError, Result};
use crate::job::QueueMap;
use crate::retrier::{RetryPolicy, RetryStrategy};

/// Default per-job execution timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Default prefetch room for retries held by [`RetryStrategy::Timer`].
pub const DEFAULT_RETRY_HEADROOM: usize = 32;

/// Default grace period for in-flight jobs during shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with a delivery whose body does not decode into a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Publish to the dead-letter queue with the decode error attached.
    #[default]
    DeadLetter,
    /// Reject without requeue, discarding the message.
    Drop,
}

/// Configuration for the JobScheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Job type to queue routing.
    pub queues: QueueMap,
    /// Dead-letter queue declared alongside the job queues.
    pub dead_letter_queue: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queues: QueueMap::defaults(),
            dead_letter_queue: RetryPolicy::default().dead_letter_queue,
        }
    }
}

impl SchedulerConfig {
    /// Create a new SchedulerConfig routing with `queues`.
    pub fn new(queues: QueueMap) -> Self {
        Self {
            queues,
            ..Default::default()
        }
    }

    /// Set the dead-letter queue name.
    pub fn dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = queue.into();
        self
    }
}

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to consume from.
    pub queue: String,
    /// Maximum simultaneously running jobs.
    pub concurrency: usize,
    /// Hard per-job execution limit.
    pub job_timeout: Duration,
    /// How long shutdown waits for in-flight jobs before killing them.
    pub drain_timeout: Duration,
    /// Retry and dead-letter behaviour.
    pub retry: RetryPolicy,
    /// Handling of undecodable messages.
    pub malformed: MalformedPolicy,
    /// Extra prefetch for deliveries held unacknowledged while a
    /// [`RetryStrategy::Timer`] backoff runs, so pending retries do not stop
    /// new jobs from arriving. Unused with broker-held retries.
    pub retry_headroom: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            concurrency: 1,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            retry: RetryPolicy::default(),
            malformed: MalformedPolicy::default(),
            retry_headroom: DEFAULT_RETRY_HEADROOM,
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Check the values a pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(CourierError::Config("Queue name is required".to_string()));
        }
        if self.concurrency == 0 {
            return Err(CourierError::Config(
                "Concurrency must be at least 1".to_string(),
            ));
        }
        if u16::try_from(self.unbounded_prefetch()).is_err() {
            return Err(CourierError::Config(format!(
                "Concurrency {} exceeds the broker prefetch limit",
                self.concurrency
            )));
        }
        if self.job_timeout.is_zero() {
            return Err(CourierError::Config(
                "Job timeout must be positive".to_string(),
            ));
        }
        if self.retry.dead_letter_queue == self.queue {
            return Err(CourierError::Config(
                "Dead-letter queue must differ from the consumed queue".to_string(),
            ));
        }
        Ok(())
    }

    /// Broker prefetch: the concurrency limit, plus the retry headroom when
    /// failed deliveries are held for a timer.
    pub fn prefetch(&self) -> u16 {
        u16::try_from(self.unbounded_prefetch()).unwrap_or(u16::MAX)
    }

    fn unbounded_prefetch(&self) -> usize {
        match self.retry.strategy {
            RetryStrategy::BrokerDelay => self.concurrency,
            RetryStrategy::Timer => self.concurrency.saturating_add(self.retry_headroom),
        }
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue to consume.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue = queue.into();
        self
    }

    /// Set the concurrency limit.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.config.concurrency = limit;
        self
    }

    /// Set the per-job timeout.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the prefetch room reserved for timer-held retries.
    pub fn retry_headroom(mut self, headroom: usize) -> Self {
        self.config.retry_headroom = headroom;
        self
    }

    /// Set the malformed message policy.
    pub fn malformed(mut self, policy: MalformedPolicy) -> Self {
        self.config.malformed = policy;
        self
    }

    /// Build and validate the WorkerConfig.
    pub fn build(self) -> Result<WorkerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
