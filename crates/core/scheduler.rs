//! Producer side: validates job requests and publishes them to their queues.

use serde::Serialize;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::gateway::{Gateway, Headers, PublishOptions, QueueOptions, SharedGateway, DEFAULT_EXCHANGE};
use crate::job::{Job, JobId, QueueMap};

/// Per-job delivery options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleOptions {
    /// Message priority, 0 is lowest.
    pub priority: u8,
    /// Discard the message if it is not consumed within this window.
    pub ttl: Option<Duration>,
    /// Extra headers carried with the message.
    pub headers: Headers,
}

impl ScheduleOptions {
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    fn into_publish_options(self) -> PublishOptions {
        let mut options = PublishOptions::default()
            .priority(self.priority)
            .headers(self.headers);
        options.expiration = self.ttl;
        options
    }
}

/// Schedules jobs onto durable queues.
///
/// Performs no deduplication: scheduling the same payload twice yields two
/// jobs with distinct identifiers.
#[derive(Clone)]
pub struct JobScheduler<G: Gateway + Clone = SharedGateway> {
    gateway: G,
    config: SchedulerConfig,
}

impl JobScheduler<SharedGateway> {
    /// Create a new scheduler over a shared gateway.
    pub fn new(gateway: impl Gateway + 'static, config: SchedulerConfig) -> Self {
        Self {
            gateway: SharedGateway::new(gateway),
            config,
        }
    }
}

impl<G: Gateway + Clone> JobScheduler<G> {
    /// Create a new scheduler with a specific gateway.
    pub fn with_gateway(gateway: G, config: SchedulerConfig) -> Self {
        Self { gateway, config }
    }

    /// Queue routing in use.
    pub fn queues(&self) -> &QueueMap {
        &self.config.queues
    }

    /// Declare every mapped queue and the dead-letter queue. Idempotent.
    pub async fn init(&self) -> Result<()> {
        for queue in self.config.queues.queues() {
            self.gateway
                .declare_queue(queue, QueueOptions::durable())
                .await?;
        }
        self.gateway
            .declare_queue(&self.config.dead_letter_queue, QueueOptions::durable())
            .await?;

        tracing::info!(
            queues = self.config.queues.queues().len(),
            dead_letter_queue = %self.config.dead_letter_queue,
            "Scheduler queues declared"
        );
        Ok(())
    }

    /// Schedule a job with default options.
    pub async fn schedule<T: Serialize>(&self, job_type: &str, payload: T) -> Result<JobId> {
        self.schedule_job(job_type, payload, ScheduleOptions::default())
            .await
    }

    /// Schedule a job of `job_type` carrying `payload`.
    ///
    /// Fails with `UnknownJobType` before anything is published if the type
    /// has no queue mapping. Returns once the gateway accepted the publish.
    pub async fn schedule_job<T: Serialize>(
        &self,
        job_type: &str,
        payload: T,
        options: ScheduleOptions,
    ) -> Result<JobId> {
        let queue = self.config.queues.queue_for(job_type)?;
        let data = serde_json::to_value(payload)?;
        let job = Job::new(job_type, data);
        let body = job.to_bytes()?;

        self.gateway
            .publish(
                DEFAULT_EXCHANGE,
                queue,
                &body,
                options.into_publish_options(),
            )
            .await?;

        tracing::debug!(job_id = %job.id, job_type = %job_type, queue = %queue, "Job scheduled");
        Ok(job.id)
    }

    /// Close the underlying connection.
    pub async fn close(&self) -> Result<()> {
        self.gateway.close().await
    }
}
