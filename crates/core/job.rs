//! Job definition and related types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{CourierError, Result};
use crate::gateway::{headers, Delivery};

/// Unique identifier for a job, stable across retries.
///
/// Identifiers produced by other publishers are accepted verbatim, so the
/// inner value is an opaque string rather than a parsed UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A job envelope as carried in a message body.
///
/// The wire form is `{id, type, data, createdAt}`. The retry counter lives in
/// message headers, never in the body, so `attempt` is skipped by serde and
/// filled in from the delivery when the job is decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Job kind; selects the destination queue and the handler.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque payload.
    pub data: serde_json::Value,
    /// Creation time, immutable.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Number of times this job has been requeued after a failure.
    #[serde(skip)]
    pub attempt: u32,
}

impl Job {
    /// Create a new job with a fresh identifier.
    pub fn new(job_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            data,
            created_at: Utc::now(),
            attempt: 0,
        }
    }

    /// Serialize the job envelope to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Serialize the job envelope to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a job envelope from JSON bytes. `attempt` is left at 0.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Decode the job carried by a delivery, reading `attempt` from headers.
    pub fn from_delivery(delivery: &Delivery) -> Result<Self> {
        let mut job = Self::from_slice(&delivery.body)?;
        job.attempt = headers::retry_count(&delivery.headers);
        Ok(job)
    }
}

/// Mapping from job type to destination queue name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMap {
    routes: BTreeMap<String, String>,
}

impl QueueMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The job kinds served by the reference producer.
    pub fn defaults() -> Self {
        Self::new()
            .with("reports", "reports_generation")
            .with("emails", "email_sending")
            .with("imageProcessing", "image_processing")
    }

    /// Map a job type to a queue, replacing any previous mapping.
    pub fn with(mut self, job_type: impl Into<String>, queue: impl Into<String>) -> Self {
        self.routes.insert(job_type.into(), queue.into());
        self
    }

    /// Look up the queue for a job type.
    pub fn queue_for(&self, job_type: &str) -> Result<&str> {
        self.routes
            .get(job_type)
            .map(String::as_str)
            .ok_or_else(|| CourierError::UnknownJobType(job_type.to_string()))
    }

    /// Distinct queue names, in sorted order.
    pub fn queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = self.routes.values().map(String::as_str).collect();
        queues.sort_unstable();
        queues.dedup();
        queues
    }

    /// Registered job types, in sorted order.
    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
