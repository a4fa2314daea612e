//! Worker pool for processing jobs.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use crate::config::{MalformedPolicy, WorkerConfig};
use crate::error::{CourierError, Result};
use crate::gateway::{Delivery, Gateway, QueueOptions, SharedGateway};
use crate::job::{Job, JobId};
use crate::registry::InFlightRegistry;
use crate::retrier::{Retrier, RetryDecision, RetryPolicy};
use crate::shutdown::{shutdown_signal, DrainOutcome, PoolState, ShutdownCoordinator};
use crate::worker::{Executor, JobResult, Outcome, TaskExecutor};

/// How long a duplicate delivery is held before it is requeued.
const DUPLICATE_REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Counters describing what a pool has done since it started.
#[derive(Debug, Default)]
pub struct PoolStats {
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    timed_out: AtomicU64,
    crashed: AtomicU64,
    malformed: AtomicU64,
    duplicates: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub timed_out: u64,
    pub crashed: u64,
    pub malformed: u64,
    pub duplicates: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            crashed: self.crashed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Builder for WorkerPool.
#[derive(Default)]
pub struct WorkerPoolBuilder {
    config: WorkerConfig,
    executor: Option<Arc<dyn Executor>>,
    gateway: Option<SharedGateway>,
}

impl WorkerPoolBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the gateway.
    pub fn gateway(mut self, gateway: impl Gateway + 'static) -> Self {
        self.gateway = Some(SharedGateway::new(gateway));
        self
    }

    /// Set the queue to consume.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue = queue.into();
        self
    }

    /// Set the maximum number of simultaneously running jobs.
    ///
    /// With broker-held retries this is also the broker prefetch, so the
    /// broker never hands this consumer more messages than it can run.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.config.concurrency = limit;
        self
    }

    /// Set the per-job execution timeout.
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

    /// Set the executor that runs each job.
    pub fn executor(mut self, executor: impl Executor) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Run jobs with an async handler on dedicated tasks.
    pub fn handler<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.executor(TaskExecutor::new(handler))
    }

    /// Build the WorkerPool with the configured gateway.
    pub fn build(mut self) -> Result<WorkerPool<SharedGateway>> {
        let gateway = self
            .gateway
            .take()
            .ok_or_else(|| CourierError::Config("Gateway is required".to_string()))?;
        self.build_with_gateway(gateway)
    }

    /// Build the WorkerPool with a specific gateway.
    pub fn build_with_gateway<G: Gateway + Clone + 'static>(
        self,
        gateway: G,
    ) -> Result<WorkerPool<G>> {
        let executor = self
            .executor
            .ok_or_else(|| CourierError::Config("Executor is required".to_string()))?;
        self.config.validate()?;
        Ok(WorkerPool::new(self.config, executor, gateway))
    }
}

struct PoolInner<G: Gateway + Clone + 'static> {
    config: WorkerConfig,
    gateway: G,
    executor: Arc<dyn Executor>,
    registry: InFlightRegistry,
    retrier: Retrier<G>,
    stats: PoolStats,
}

/// Consumes one queue and runs each job in its own execution unit.
pub struct WorkerPool<G: Gateway + Clone + 'static = SharedGateway> {
    inner: Arc<PoolInner<G>>,
    coordinator: ShutdownCoordinator<G>,
    permits: Arc<Semaphore>,
    started: AtomicBool,
}

impl WorkerPool<SharedGateway> {
    /// Create a new builder for WorkerPool.
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }
}

impl<G: Gateway + Clone + 'static> WorkerPool<G> {
    /// Create a new worker pool. `config` is assumed valid.
    pub fn new(config: WorkerConfig, executor: Arc<dyn Executor>, gateway: G) -> Self {
        let registry = InFlightRegistry::new();
        let coordinator =
            ShutdownCoordinator::new(gateway.clone(), registry.clone(), config.drain_timeout);
        let permits = Arc::new(Semaphore::new(config.concurrency));
        let retrier = Retrier::new(gateway.clone(), config.retry.clone());

        Self {
            inner: Arc::new(PoolInner {
                config,
                gateway,
                executor,
                registry,
                retrier,
                stats: PoolStats::default(),
            }),
            coordinator,
            permits,
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.coordinator.state()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<PoolState> {
        self.coordinator.subscribe()
    }

    /// Number of jobs currently running.
    pub fn in_flight_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Ids of jobs currently running.
    pub fn in_flight_jobs(&self) -> Vec<JobId> {
        self.inner.registry.job_ids()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Run the pool until Ctrl+C or SIGTERM, then shut down gracefully.
    pub async fn run(&self) -> Result<DrainOutcome> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the pool until `shutdown` completes, then drain and close.
    ///
    /// A pool runs once; after it stopped every further call fails with
    /// `InvalidState`.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<DrainOutcome>
    where
        S: Future<Output = ()> + Send,
    {
        if self.state() != PoolState::Running || self.started.swap(true, Ordering::SeqCst) {
            return Err(CourierError::InvalidState(
                "worker pool can only be started once".to_string(),
            ));
        }

        let config = &self.inner.config;
        let gateway = &self.inner.gateway;

        gateway
            .declare_queue(&config.queue, QueueOptions::durable())
            .await?;
        self.inner.retrier.prepare(&config.queue).await?;
        let mut subscription = gateway.consume(&config.queue, config.prefetch()).await?;

        tracing::info!(
            queue = %config.queue,
            concurrency = config.concurrency,
            consumer_tag = %subscription.consumer_tag(),
            "Worker pool started"
        );

        tokio::pin!(shutdown);
        loop {
            // Capacity first, so a delivery is only taken when it can run.
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                delivery = subscription.next() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        tracing::warn!(queue = %config.queue, "Subscription ended, shutting down");
                        break;
                    }
                },
            };

            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.process(delivery).await;
                drop(permit);
            });
        }

        tracing::info!(
            queue = %config.queue,
            in_flight = self.inner.registry.len(),
            "Shutdown requested, draining..."
        );

        let outcome = self
            .coordinator
            .drain(Some(subscription.consumer_tag()))
            .await?;

        tracing::info!(queue = %config.queue, stats = ?self.stats(), "Worker pool stopped");
        Ok(outcome)
    }
}

impl<G: Gateway + Clone + 'static> PoolInner<G> {
    async fn process(&self, delivery: Delivery) {
        let job = match Job::from_delivery(&delivery) {
            Ok(job) => job,
            Err(e) => {
                self.reject_malformed(delivery, e).await;
                return;
            }
        };

        let job_id = job.id.clone();
        let tag = delivery.tag;
        let attempt = job.attempt;
        let job_type = job.job_type.clone();

        let executor = self.executor.clone();
        let Some((mut unit, slot)) = self
            .registry
            .register(job_id.clone(), tag, move || executor.launch(job))
        else {
            PoolStats::bump(&self.stats.duplicates);
            tracing::warn!(job_id = %job_id, "Job already in flight, requeueing duplicate delivery");
            tokio::time::sleep(DUPLICATE_REQUEUE_DELAY).await;
            self.settle(delivery.tag, Some(true)).await;
            return;
        };

        tracing::debug!(
            job_id = %job_id,
            job_type = %job_type,
            attempt = attempt,
            redelivered = delivery.redelivered,
            "Processing job"
        );

        let outcome = tokio::time::timeout(self.config.job_timeout, unit.join())
            .await
            .ok();

        let Some(entry) = self.registry.remove(&job_id) else {
            // Forced shutdown took the entry; the connection close returns the message.
            tracing::debug!(job_id = %job_id, "Job released to shutdown");
            return;
        };

        match outcome {
            None => {
                entry.unit.kill();
                PoolStats::bump(&self.stats.timed_out);
                tracing::warn!(
                    job_id = %job_id,
                    timeout_ms = self.config.job_timeout.as_millis() as u64,
                    "Job exceeded execution timeout, requeueing"
                );
                self.settle(tag, Some(true)).await;
            }
            Some(Outcome::Success(_)) => {
                PoolStats::bump(&self.stats.succeeded);
                tracing::debug!(
                    job_id = %job_id,
                    elapsed_ms = entry.unit.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );
                self.settle(tag, None).await;
            }
            Some(Outcome::Failure(error)) => {
                match self.retrier.handle_failure(delivery, &error, slot).await {
                    RetryDecision::Retry { .. } => PoolStats::bump(&self.stats.retried),
                    RetryDecision::DeadLetter => PoolStats::bump(&self.stats.dead_lettered),
                }
            }
            Some(Outcome::Crash(reason)) => {
                PoolStats::bump(&self.stats.crashed);
                tracing::warn!(job_id = %job_id, reason = %reason, "Execution unit crashed, requeueing");
                self.settle(tag, Some(true)).await;
            }
            Some(Outcome::Killed) => {
                PoolStats::bump(&self.stats.crashed);
                tracing::warn!(job_id = %job_id, "Execution unit terminated externally, requeueing");
                self.settle(tag, Some(true)).await;
            }
        }
    }

    async fn reject_malformed(&self, delivery: Delivery, error: CourierError) {
        PoolStats::bump(&self.stats.malformed);
        tracing::warn!(
            queue = %delivery.queue,
            tag = %delivery.tag,
            error = %error,
            "Malformed message"
        );
        match self.config.malformed {
            MalformedPolicy::DeadLetter => {
                self.retrier
                    .dead_letter_malformed(&delivery, &error.to_string())
                    .await
            }
            MalformedPolicy::Drop => self.settle(delivery.tag, Some(false)).await,
        }
    }

    /// Ack when `requeue` is `None`, otherwise nack.
    async fn settle(&self, tag: crate::gateway::DeliveryTag, requeue: Option<bool>) {
        let result = match requeue {
            None => self.gateway.ack(tag).await,
            Some(requeue) => self.gateway.nack(tag, requeue).await,
        };
        if let Err(e) = result {
            tracing::error!(tag = %tag, error = %e, "Failed to settle delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{headers, PublishOptions};
    use crate::memory::MemoryBroker;
    use crate::retrier::RetryStrategy;
    use crate::worker::JobError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, oneshot};

    const QUEUE: &str = "image_processing";

    async fn publish(broker: &MemoryBroker, job: &Job) {
        broker
            .declare_queue(QUEUE, QueueOptions::durable())
            .await
            .unwrap();
        broker
            .publish("", QUEUE, &job.to_bytes().unwrap(), PublishOptions::default())
            .await
            .unwrap();
    }

    fn builder() -> WorkerPoolBuilder {
        WorkerPool::builder().queue(QUEUE)
    }

    fn start(
        pool: WorkerPool<MemoryBroker>,
    ) -> (
        oneshot::Sender<()>,
        tokio::task::JoinHandle<(WorkerPool<MemoryBroker>, Result<DrainOutcome>)>,
    ) {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = pool
                .run_until(async {
                    let _ = rx.await;
                })
                .await;
            (pool, result)
        });
        (tx, handle)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acks_message() {
        let broker = MemoryBroker::new();
        let job = Job::new("imageProcessing", json!({"image": "cat.png"}));
        publish(&broker, &job).await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let pool = builder()
            .handler(move |job: Job| {
                let seen_tx = seen_tx.clone();
                async move {
                    seen_tx.send(job.clone()).ok();
                    Ok(json!({"thumbnail": "cat-small.png"}))
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen.id, job.id);
        assert_eq!(seen.job_type, job.job_type);
        assert_eq!(seen.data, job.data);
        assert_eq!(seen.attempt, 0);

        stop.send(()).unwrap();
        let (pool, result) = handle.await.unwrap();
        assert_eq!(result.unwrap(), DrainOutcome::Drained);
        assert_eq!(pool.stats().succeeded, 1);
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(broker.queue_len(QUEUE), 0);
        assert_eq!(broker.unacked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_retry_then_dead_letter() {
        let broker = MemoryBroker::new();
        let job = Job::new("imageProcessing", json!({"image": "corrupt.png"}));
        publish(&broker, &job).await;

        let (attempt_tx, mut attempt_rx) = mpsc::unbounded_channel();
        let pool = builder()
            .handler(move |job: Job| {
                let attempt_tx = attempt_tx.clone();
                async move {
                    attempt_tx.send(job.attempt).ok();
                    Err(JobError::new("unsupported format"))
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        let started = tokio::time::Instant::now();
        let mut attempts = Vec::new();
        for _ in 0..4 {
            attempts.push(attempt_rx.recv().await.unwrap());
        }
        assert_eq!(attempts, vec![0, 1, 2, 3]);
        // 2s + 4s + 8s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(14));

        eventually(|| broker.queue_len("dead_letter") == 1).await;
        stop.send(()).unwrap();
        let (pool, result) = handle.await.unwrap();
        result.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.dead_lettered, 1);

        let dead = broker.messages("dead_letter");
        assert_eq!(Job::from_slice(&dead[0].body).unwrap().id, job.id);
        assert_eq!(headers::get_str(&dead[0].headers, headers::FAILED_QUEUE), Some(QUEUE));
        assert_eq!(broker.queue_len(QUEUE), 0);
        for attempt in 1..=3 {
            assert_eq!(broker.queue_len(&format!("image_processing.retry.{}", attempt)), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_kills_and_requeues() {
        let broker = MemoryBroker::new();
        let job = Job::new("imageProcessing", json!({}));
        publish(&broker, &job).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let handler_calls = calls.clone();
        let pool = builder()
            .job_timeout(Duration::from_secs(5))
            .handler(move |_job: Job| {
                let call = handler_calls.fetch_add(1, Ordering::SeqCst);
                let done_tx = done_tx.clone();
                async move {
                    if call == 0 {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    done_tx.send(()).ok();
                    Ok(serde_json::Value::Null)
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        done_rx.recv().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        stop.send(()).unwrap();
        let (pool, result) = handle.await.unwrap();
        assert_eq!(result.unwrap(), DrainOutcome::Drained);
        let stats = pool.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.retried, 0);
        assert!(pool.in_flight_jobs().is_empty());
        assert_eq!(broker.queue_len(QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_job_leaves_registry() {
        let broker = MemoryBroker::new();
        let job = Job::new("imageProcessing", json!({}));
        publish(&broker, &job).await;

        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let pool = builder()
            .job_timeout(Duration::from_secs(5))
            .handler(move |_job: Job| {
                let started_tx = started_tx.clone();
                async move {
                    started_tx.send(()).ok();
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(serde_json::Value::Null)
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let pool = Arc::new(pool);
        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run_until(std::future::pending()).await })
        };

        started_rx.recv().await.unwrap();
        assert_eq!(pool.in_flight_jobs(), vec![job.id.clone()]);

        // Redelivered after the timeout; the first unit is gone by then.
        started_rx.recv().await.unwrap();
        assert_eq!(pool.stats().timed_out, 1);
        assert_eq!(pool.in_flight_count(), 1);
        runner.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_requeues_without_backoff() {
        let broker = MemoryBroker::new();
        publish(&broker, &Job::new("imageProcessing", json!({}))).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let pool = builder()
            .handler(move |_job: Job| {
                let call = handler_calls.fetch_add(1, Ordering::SeqCst);
                let done_tx = done_tx.clone();
                async move {
                    if call == 0 {
                        panic!("segfault");
                    }
                    done_tx.send(()).ok();
                    Ok(serde_json::Value::Null)
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        let started = tokio::time::Instant::now();
        done_rx.recv().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        stop.send(()).unwrap();
        let (pool, _) = handle.await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.crashed, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.retried, 0);
        assert!(broker.messages("image_processing.retry.1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound() {
        let broker = MemoryBroker::new();
        for i in 0..6 {
            publish(&broker, &Job::new("imageProcessing", json!({"n": i}))).await;
        }

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let (r, p) = (running.clone(), peak.clone());
        let pool = builder()
            .concurrency(2)
            .handler(move |_job: Job| {
                let (running, peak, done_tx) = (r.clone(), p.clone(), done_tx.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done_tx.send(()).ok();
                    Ok(serde_json::Value::Null)
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }
        stop.send(()).unwrap();
        let (pool, _) = handle.await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().succeeded, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_dead_lettered() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue(QUEUE, QueueOptions::durable())
            .await
            .unwrap();
        broker
            .publish("", QUEUE, b"{not json", PublishOptions::default())
            .await
            .unwrap();

        let pool = builder()
            .handler(|_job: Job| async move { Ok(serde_json::Value::Null) })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        eventually(|| broker.queue_len("dead_letter") == 1).await;
        stop.send(()).unwrap();
        let (pool, _) = handle.await.unwrap();

        assert_eq!(pool.stats().malformed, 1);
        let dead = broker.messages("dead_letter");
        assert_eq!(dead[0].body, b"{not json");
        assert!(headers::get_str(&dead[0].headers, headers::ERROR).is_some());
        assert_eq!(broker.queue_len(QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_dropped() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue(QUEUE, QueueOptions::durable())
            .await
            .unwrap();
        broker
            .publish("", QUEUE, b"42", PublishOptions::default())
            .await
            .unwrap();

        let pool = builder()
            .malformed(MalformedPolicy::Drop)
            .handler(|_job: Job| async move { Ok(serde_json::Value::Null) })
            .build_with_gateway(broker.clone())
            .unwrap();
        let pool = Arc::new(pool);
        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run_until(std::future::pending()).await })
        };

        eventually(|| pool.stats().malformed == 1).await;
        eventually(|| broker.unacked_len() == 0).await;
        assert_eq!(broker.queue_len(QUEUE), 0);
        assert_eq!(broker.queue_len("dead_letter"), 0);
        runner.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_in_flight_job_waits_its_turn() {
        let broker = MemoryBroker::new();
        let job = Job::new("imageProcessing", json!({}));
        publish(&broker, &job).await;
        publish(&broker, &job).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let pool = builder()
            .concurrency(2)
            .handler(move |_job: Job| {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                let done_tx = done_tx.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    done_tx.send(()).ok();
                    Ok(serde_json::Value::Null)
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        done_rx.recv().await.unwrap();
        done_rx.recv().await.unwrap();
        stop.send(()).unwrap();
        let (pool, _) = handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stats = pool.stats();
        assert!(stats.duplicates >= 1);
        assert_eq!(stats.succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_shutdown_returns_message() {
        let broker = MemoryBroker::new();
        publish(&broker, &Job::new("imageProcessing", json!({}))).await;

        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let pool = builder()
            .drain_timeout(Duration::from_secs(10))
            .handler(move |_job: Job| {
                let started_tx = started_tx.clone();
                async move {
                    started_tx.send(()).ok();
                    tokio::time::sleep(Duration::from_secs(120)).await;
                    Ok(serde_json::Value::Null)
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        started_rx.recv().await.unwrap();
        stop.send(()).unwrap();
        let (pool, result) = handle.await.unwrap();

        assert_eq!(result.unwrap(), DrainOutcome::Forced { terminated: 1 });
        assert_eq!(pool.stats().succeeded, 0);
        assert_eq!(broker.queue_len(QUEUE), 1);
        assert!(broker.messages(QUEUE)[0].redelivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_lets_running_job_finish() {
        let broker = MemoryBroker::new();
        publish(&broker, &Job::new("imageProcessing", json!({}))).await;

        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let pool = builder()
            .handler(move |_job: Job| {
                let started_tx = started_tx.clone();
                async move {
                    started_tx.send(()).ok();
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Ok(serde_json::Value::Null)
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let mut state = pool.subscribe_state();
        let (stop, handle) = start(pool);

        started_rx.recv().await.unwrap();
        stop.send(()).unwrap();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), PoolState::Draining);

        let (pool, result) = handle.await.unwrap();
        assert_eq!(result.unwrap(), DrainOutcome::Drained);
        assert_eq!(pool.stats().succeeded, 1);
        assert_eq!(broker.queue_len(QUEUE), 0);
    }

    fn timer_retries(base_delay: Duration) -> RetryPolicy {
        RetryPolicy {
            base_delay,
            strategy: RetryStrategy::Timer,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_backoff_does_not_block_next_job() {
        let broker = MemoryBroker::new();
        let failing = Job::new("imageProcessing", json!({"image": "corrupt.png"}));
        let healthy = Job::new("imageProcessing", json!({"image": "cat.png"}));
        publish(&broker, &failing).await;
        publish(&broker, &healthy).await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let failing_id = failing.id.clone();
        let pool = builder()
            .concurrency(1)
            .retry(timer_retries(Duration::from_secs(1)))
            .handler(move |job: Job| {
                let seen_tx = seen_tx.clone();
                let fail = job.id == failing_id && job.attempt == 0;
                async move {
                    seen_tx.send((job.id, tokio::time::Instant::now())).ok();
                    if fail {
                        Err(JobError::new("unsupported format"))
                    } else {
                        Ok(serde_json::Value::Null)
                    }
                }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        let (first, failed_at) = seen_rx.recv().await.unwrap();
        assert_eq!(first, failing.id);
        let (second, started_at) = seen_rx.recv().await.unwrap();
        assert_eq!(second, healthy.id);
        // The 2s backoff of the first job runs alongside the second.
        assert!(started_at - failed_at < Duration::from_secs(1));

        let (third, _) = seen_rx.recv().await.unwrap();
        assert_eq!(third, failing.id);

        stop.send(()).unwrap();
        let (pool, result) = handle.await.unwrap();
        assert_eq!(result.unwrap(), DrainOutcome::Drained);
        assert_eq!(pool.stats().succeeded, 2);
        assert_eq!(pool.stats().retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_pending_timer_retry() {
        let broker = MemoryBroker::new();
        publish(&broker, &Job::new("imageProcessing", json!({}))).await;

        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        let pool = builder()
            .retry(timer_retries(Duration::from_secs(1)))
            .drain_timeout(Duration::from_secs(10))
            .handler(move |_job: Job| {
                failed_tx.send(()).ok();
                async move { Err(JobError::new("unsupported format")) }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        failed_rx.recv().await.unwrap();
        let stopped_at = tokio::time::Instant::now();
        stop.send(()).unwrap();
        let (_pool, result) = handle.await.unwrap();

        assert_eq!(result.unwrap(), DrainOutcome::Drained);
        assert!(stopped_at.elapsed() >= Duration::from_secs(1));
        let waiting = broker.messages(QUEUE);
        assert_eq!(waiting.len(), 1);
        assert_eq!(headers::retry_count(&waiting[0].headers), 1);
        assert_eq!(broker.unacked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_deadline_republishes_pending_timer_retry() {
        let broker = MemoryBroker::new();
        publish(&broker, &Job::new("imageProcessing", json!({}))).await;

        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        let pool = builder()
            .retry(timer_retries(Duration::from_secs(30)))
            .drain_timeout(Duration::from_secs(1))
            .handler(move |_job: Job| {
                failed_tx.send(()).ok();
                async move { Err(JobError::new("unsupported format")) }
            })
            .build_with_gateway(broker.clone())
            .unwrap();
        let (stop, handle) = start(pool);

        failed_rx.recv().await.unwrap();
        let stopped_at = tokio::time::Instant::now();
        stop.send(()).unwrap();
        let (_pool, result) = handle.await.unwrap();

        assert_eq!(result.unwrap(), DrainOutcome::Forced { terminated: 0 });
        assert!(stopped_at.elapsed() < Duration::from_secs(60));
        // Republished with the attempt counted, not returned unretried.
        let waiting = broker.messages(QUEUE);
        assert_eq!(waiting.len(), 1);
        assert_eq!(headers::retry_count(&waiting[0].headers), 1);
        assert!(!waiting[0].redelivered);
        assert_eq!(broker.unacked_len(), 0);
    }

    #[tokio::test]
    async fn test_pool_runs_once() {
        let broker = MemoryBroker::new();
        let pool = builder()
            .handler(|_job: Job| async move { Ok(serde_json::Value::Null) })
            .build_with_gateway(broker)
            .unwrap();
        pool.run_until(async {}).await.unwrap();

        let err = pool.run_until(async {}).await.unwrap_err();
        assert!(matches!(err, CourierError::InvalidState(_)));
    }

    #[test]
    fn test_builder_requires_executor_and_gateway() {
        let err = builder().build_with_gateway(MemoryBroker::new()).err().unwrap();
        assert_eq!(err.to_string(), "Configuration error: Executor is required");

        let err = builder()
            .handler(|_job: Job| async move { Ok(serde_json::Value::Null) })
            .build()
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Configuration error: Gateway is required");
    }
}
