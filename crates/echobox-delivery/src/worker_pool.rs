//! Worker pool management with structured concurrency.
//!
//! Lifecycle management and graceful shutdown for supervised delivery
//! worker tasks.

use std::{sync::Arc, time::Duration};

use echobox_core::{events::AuditSink, time::Clock};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatch::Dispatcher,
    error::{DeliveryError, Result},
    store::JobStore,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats},
};

/// Pool of supervised delivery workers.
///
/// Workers share the cancellation token and stats; shutdown cancels them
/// collectively and waits for in-flight batches to finish within the
/// timeout.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a new worker pool.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Dispatcher,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            stats,
            cancellation_token,
            audit,
            clock,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns all configured workers and begins processing.
    ///
    /// Returns immediately after spawning; workers run until cancellation.
    ///
    /// # Errors
    ///
    /// Currently never fails; the signature allows for future validation.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.store.clone(),
                self.dispatcher.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.audit.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref worker_error) = result {
                    error!(worker_id, error = %worker_error, "delivery worker terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned = self.worker_handles.len(), "all delivery workers spawned");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Signals cancellation and waits for in-flight batches to finish
    /// within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not finish in time.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let shutdown_future = async {
            let mut failures = 0usize;

            for (worker_id, handle) in
                std::mem::take(&mut self.worker_handles).into_iter().enumerate()
            {
                match handle.await {
                    Ok(worker_result) => {
                        if let Err(worker_error) = worker_result {
                            warn!(
                                worker_id,
                                error = %worker_error,
                                "worker completed with error during shutdown"
                            );
                            failures += 1;
                        }
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                        failures += 1;
                    },
                }
            }

            {
                let mut stats = self.stats.write().await;
                stats.active_workers = 0;
            }

            failures
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(failures) => {
                if failures > 0 {
                    warn!(failures, "some workers completed with errors during shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.worker_handles.is_empty() {
            return;
        }

        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active,
                "WorkerPool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}
