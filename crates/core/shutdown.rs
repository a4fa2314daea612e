//! Graceful shutdown: stop consuming, drain in-flight jobs, close.

use std::time::Duration;
use tokio::sync::watch;

use crate::error::{CourierError, Result};
use crate::gateway::Gateway;
use crate::registry::InFlightRegistry;

/// How long released work gets to settle after the drain deadline.
const RELEASE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of a worker pool. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How the drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight job finished before the deadline.
    Drained,
    /// The deadline passed; this many units were killed.
    Forced { terminated: usize },
}

/// Drives a pool from `Running` through `Draining` to `Stopped`.
pub struct ShutdownCoordinator<G: Gateway> {
    gateway: G,
    registry: InFlightRegistry,
    drain_timeout: Duration,
    state: watch::Sender<PoolState>,
}

impl<G: Gateway> ShutdownCoordinator<G> {
    /// Create a new coordinator in the `Running` state.
    pub fn new(gateway: G, registry: InFlightRegistry, drain_timeout: Duration) -> Self {
        let (state, _) = watch::channel(PoolState::Running);
        Self {
            gateway,
            registry,
            drain_timeout,
            state,
        }
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PoolState> {
        self.state.subscribe()
    }

    /// Cancel `consumer_tag`, wait for in-flight jobs up to the drain
    /// deadline, kill whatever remains, then close the gateway.
    ///
    /// Killed jobs are neither acked nor rejected; closing the connection
    /// returns their messages to the queue. Retries still waiting on a timer
    /// are released at the deadline and republish at once, so their attempt
    /// count is kept. A failing close is returned as an error after the state
    /// reached `Stopped`.
    pub async fn drain(&self, consumer_tag: Option<&str>) -> Result<DrainOutcome> {
        let mut transitioned = false;
        self.state.send_if_modified(|state| {
            if *state == PoolState::Running {
                *state = PoolState::Draining;
                transitioned = true;
            }
            transitioned
        });
        if !transitioned {
            return Err(CourierError::InvalidState(format!(
                "cannot drain a {} pool",
                self.state()
            )));
        }

        if let Some(tag) = consumer_tag {
            if let Err(e) = self.gateway.cancel(tag).await {
                tracing::warn!(consumer_tag = %tag, error = %e, "Failed to cancel consumer");
            }
        }

        tracing::info!(
            in_flight = self.registry.len(),
            drain_timeout_ms = self.drain_timeout.as_millis() as u64,
            "Draining in-flight jobs"
        );

        let outcome = match tokio::time::timeout(self.drain_timeout, self.registry.wait_idle()).await
        {
            Ok(()) => DrainOutcome::Drained,
            Err(_) => {
                let remaining = self.registry.take_all();
                for (job_id, entry) in &remaining {
                    tracing::warn!(
                        job_id = %job_id,
                        elapsed_ms = entry.unit.elapsed().as_millis() as u64,
                        "Forcibly terminating job"
                    );
                    entry.unit.kill();
                }
                self.registry.release();
                if tokio::time::timeout(RELEASE_GRACE, self.registry.wait_idle())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        unsettled = self.registry.active(),
                        "Closing with deliveries still unsettled"
                    );
                }
                DrainOutcome::Forced {
                    terminated: remaining.len(),
                }
            }
        };

        let closed = self.gateway.close().await;
        self.state.send_replace(PoolState::Stopped);

        if let Err(e) = closed {
            tracing::error!(error = %e, "Failed to close broker connection");
            return Err(e);
        }

        tracing::info!(outcome = ?outcome, "Shutdown complete");
        Ok(outcome)
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
