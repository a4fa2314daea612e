//! # courier-core - Core types and traits for reliable job dispatch
//!
//! This crate provides the broker-agnostic parts of the courier job system:
//! - `Gateway` trait over an at-least-once message broker, plus `MemoryBroker`
//! - `Job`, `JobId`, `QueueMap` types and the `JobScheduler` producer
//! - `WorkerPool` consuming a queue with bounded concurrency and per-job timeouts
//! - `Retrier` applying exponential backoff and dead-lettering
//! - `ShutdownCoordinator` draining in-flight jobs on termination
//! - Error types

mod config;
mod error;
mod gateway;
mod job;
mod memory;
mod pool;
mod registry;
pub mod report;
mod retrier;
mod scheduler;
mod shutdown;
pub mod topic;
mod worker;

// Re-export main types
pub use config::{
    MalformedPolicy, SchedulerConfig, WorkerConfig, WorkerConfigBuilder, DEFAULT_DRAIN_TIMEOUT,
    DEFAULT_JOB_TIMEOUT, DEFAULT_RETRY_HEADROOM,
};
pub use error::{CourierError, Result};
pub use gateway::{
    generate_consumer_tag, headers, ConnectionState, Delivery, DeliveryTag, DynGateway,
    ExchangeKind, Gateway, HeaderValue, Headers, PublishOptions, QueueOptions, SharedGateway,
    Subscription, DEFAULT_EXCHANGE,
};
pub use job::{Job, JobId, QueueMap};
pub use memory::{MemoryBroker, Message};
pub use pool::{PoolStats, PoolStatsSnapshot, WorkerPool, WorkerPoolBuilder};
pub use registry::{InFlightEntry, InFlightRegistry, Slot};
pub use report::ExecutionReport;
pub use retrier::{Retrier, RetryDecision, RetryPolicy, RetryStrategy};
pub use scheduler::{JobScheduler, ScheduleOptions};
pub use shutdown::{shutdown_signal, DrainOutcome, PoolState, ShutdownCoordinator};
pub use worker::{
    ExecutionUnit, Executor, JobError, JobResult, Outcome, ProcessExecutor, TaskExecutor,
    UnitHandle,
};
