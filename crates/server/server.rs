//! Server implementation running one worker pool per queue.

use std::future::Future;

use courier_amqp::{AmqpConfig, AmqpGateway};
use courier_core::{
    shutdown_signal, CourierError, DrainOutcome, Gateway, ProcessExecutor, Result, WorkerPool,
};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::ServerConfig;

/// Worker daemon: connects to the broker and serves every configured queue
/// until asked to stop.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes, opening one broker connection per queue.
    pub async fn run_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let amqp = AmqpConfig::new(self.config.amqp_uri.clone())
            .reconnect_delay(self.config.reconnect_delay);
        self.serve(|_queue| AmqpGateway::connect(amqp.clone()), shutdown)
            .await
    }

    /// Run every pool over gateways produced by `connect`.
    ///
    /// All pools share one stop signal. When any pool exits on its own the
    /// rest are stopped too, and its error is returned.
    pub async fn serve<G, C, Fut, S>(self, connect: C, shutdown: S) -> Result<()>
    where
        G: Gateway + Clone + 'static,
        C: Fn(&str) -> Fut,
        Fut: Future<Output = Result<G>>,
        S: Future<Output = ()> + Send,
    {
        self.config.validate()?;

        let mut pools = Vec::with_capacity(self.config.queues.len());
        for queue in &self.config.queues {
            let gateway = connect(queue.as_str()).await?;
            let pool = WorkerPool::builder()
                .config(self.config.worker_config(queue)?)
                .executor(self.executor())
                .build_with_gateway(gateway)?;
            pools.push(pool);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut running = JoinSet::new();
        for pool in pools {
            let mut stop = stop_rx.clone();
            running.spawn(async move {
                let queue = pool.config().queue.clone();
                let result = pool
                    .run_until(async move {
                        let _ = stop.wait_for(|stop| *stop).await;
                    })
                    .await;
                (queue, result)
            });
        }

        tracing::info!(
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            handler = ?self.config.handler,
            "Courier server started"
        );

        let mut first_error: Option<CourierError> = None;
        tokio::pin!(shutdown);
        tokio::select! {
            _ = &mut shutdown => {}
            Some(joined) = running.join_next() => {
                first_error = record(joined, first_error);
                tracing::warn!("Worker pool exited early, stopping the server");
            }
        }

        let _ = stop_tx.send(true);
        while let Some(joined) = running.join_next().await {
            first_error = record(joined, first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Courier server stopped");
                Ok(())
            }
        }
    }

    fn executor(&self) -> ProcessExecutor {
        let (program, args) = match self.config.handler.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => ("", &[][..]),
        };
        ProcessExecutor::new(program).args(args.iter().cloned())
    }
}

fn record(
    joined: std::result::Result<(String, Result<DrainOutcome>), tokio::task::JoinError>,
    first_error: Option<CourierError>,
) -> Option<CourierError> {
    let error = match joined {
        Ok((queue, Ok(DrainOutcome::Drained))) => {
            tracing::info!(queue = %queue, "Pool drained cleanly");
            return first_error;
        }
        Ok((queue, Ok(DrainOutcome::Forced { terminated }))) => {
            tracing::warn!(queue = %queue, terminated, "Pool stopped after killing jobs");
            return first_error;
        }
        Ok((queue, Err(e))) => {
            tracing::error!(queue = %queue, error = %e, "Worker pool failed");
            e
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker pool task panicked");
            CourierError::InvalidState(format!("worker pool task failed: {}", e))
        }
    };
    first_error.or(Some(error))
}
