//! In-flight registry: which job each running execution unit belongs to.
//!
//! Whoever removes an entry owns the settlement of its delivery. The pool's
//! completion path removes entries it finished; the shutdown coordinator
//! removes whatever is left when it forcibly terminates. A delivery is
//! therefore acknowledged or rejected at most once.
//!
//! Work that still owns a delivery after its unit finished, such as a retry
//! waiting on a timer, keeps its [`Slot`] until it settles. The coordinator
//! calls [`InFlightRegistry::release`] at the drain deadline to tell such work
//! to settle immediately.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use crate::gateway::DeliveryTag;
use crate::job::JobId;
use crate::worker::{ExecutionUnit, UnitHandle};

/// A registered execution unit and the delivery it answers for.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub unit: UnitHandle,
    pub tag: DeliveryTag,
}

struct Inner {
    entries: Mutex<HashMap<JobId, InFlightEntry>>,
    // Registered jobs whose delivery is not yet settled.
    active: AtomicUsize,
    idle: Notify,
    released: watch::Sender<bool>,
}

/// Shared registry of running jobs keyed by job id.
#[derive(Clone)]
pub struct InFlightRegistry {
    inner: Arc<Inner>,
}

impl Default for InFlightRegistry {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                released: watch::channel(false).0,
            }),
        }
    }
}

/// Held by the completion path until the delivery is settled.
pub struct Slot {
    registry: InFlightRegistry,
}

impl Slot {
    /// Resolves once the registry has been released for shutdown.
    pub async fn released(&self) {
        self.registry.released().await
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.registry.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.registry.inner.idle.notify_waiters();
        }
    }
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch and register a unit for `job_id` unless one is already running.
    ///
    /// `launch` runs under the registry lock, so two deliveries of the same
    /// job can never both start.
    pub fn register<F>(
        &self,
        job_id: JobId,
        tag: DeliveryTag,
        launch: F,
    ) -> Option<(ExecutionUnit, Slot)>
    where
        F: FnOnce() -> ExecutionUnit,
    {
        let mut entries = self.inner.entries.lock();
        if entries.contains_key(&job_id) {
            return None;
        }
        let unit = launch();
        entries.insert(
            job_id,
            InFlightEntry {
                unit: unit.handle(),
                tag,
            },
        );
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        Some((
            unit,
            Slot {
                registry: self.clone(),
            },
        ))
    }

    /// Take ownership of a job's entry.
    pub fn remove(&self, job_id: &JobId) -> Option<InFlightEntry> {
        self.inner.entries.lock().remove(job_id)
    }

    /// Take ownership of every remaining entry.
    pub fn take_all(&self) -> Vec<(JobId, InFlightEntry)> {
        self.inner.entries.lock().drain().collect()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.inner.entries.lock().contains_key(job_id)
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of registered jobs, sorted.
    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.inner.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ask every slot holder to settle now.
    pub fn release(&self) {
        self.inner.released.send_replace(true);
    }

    /// Resolves once [`release`](Self::release) has been called.
    pub async fn released(&self) {
        let mut rx = self.inner.released.subscribe();
        let _ = rx.wait_for(|released| *released).await;
    }

    /// Registered jobs whose delivery is not yet settled.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until every registered job has been settled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}
