//! Delivery engine facade wiring store, dispatcher, workers, and sweeps.
//!
//! The engine owns the worker pool and the stale-job reclaimer. Any number
//! of engine instances may run as separate processes against the same job
//! store; the claim operation is the only coordination point between them.

use std::sync::Arc;

use echobox_core::{events::AuditSink, storage::Storage, time::Clock};
use sqlx::PgPool;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    artifact::ArtifactResolver,
    channel::{EmailSender, SmsSender},
    dispatch::Dispatcher,
    error::Result,
    store::{JobStore, PostgresJobStore},
    worker::{DeliveryConfig, DeliveryWorker, EngineStats},
    worker_pool::WorkerPool,
};

/// Main delivery engine coordinating scheduled delivery workers.
pub struct DeliveryEngine {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    worker_pool: Option<WorkerPool>,
    reclaimer: Option<JoinHandle<()>>,
}

impl DeliveryEngine {
    /// Creates an engine over explicit components.
    ///
    /// This constructor allows dependency injection of the store, channel
    /// senders, resolver, audit sink, and clock, enabling isolated testing
    /// without a database or live providers.
    pub fn with_components(
        store: Arc<dyn JobStore>,
        resolver: Arc<dyn ArtifactResolver>,
        email: Arc<dyn EmailSender>,
        sms: Arc<dyn SmsSender>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(resolver, email, sms, config.url_ttl);

        Self {
            store,
            dispatcher,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            audit,
            clock,
            worker_pool: None,
            reclaimer: None,
        }
    }

    /// Creates a production engine over a Postgres pool.
    pub fn new(
        pool: &PgPool,
        resolver: Arc<dyn ArtifactResolver>,
        email: Arc<dyn EmailSender>,
        sms: Arc<dyn SmsSender>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        let storage = Arc::new(Storage::new(pool.clone()));
        let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(storage));
        Self::with_components(store, resolver, email, sms, audit, clock, config)
    }

    /// Starts the worker pool and the stale-job reclaimer.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "starting delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.audit.clone(),
            self.clock.clone(),
        );

        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);
        self.reclaimer = Some(self.spawn_reclaimer());

        info!("delivery engine started");
        Ok(())
    }

    /// Spawns the background sweep recovering jobs stuck `in_progress`
    /// after a worker crash.
    fn spawn_reclaimer(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let token = self.cancellation_token.clone();
        let stale_after = self.config.stale_after;
        let interval = self.config.reclaim_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = clock.sleep(interval) => {}
                    () = token.cancelled() => break,
                }

                let Ok(stale_window) = chrono::Duration::from_std(stale_after) else {
                    warn!("stale_after out of range, reclaimer disabled");
                    break;
                };
                let cutoff = clock.now() - stale_window;

                match store.reclaim_stale(cutoff).await {
                    Ok(0) => debug!("stale sweep found nothing to reclaim"),
                    Ok(reclaimed) => {
                        warn!(reclaimed, "reclaimed jobs abandoned by crashed workers");
                    },
                    Err(sweep_error) => {
                        warn!(error = %sweep_error, "stale sweep failed, retrying next interval");
                    },
                }
            }
        })
    }

    /// Gracefully shuts down the engine.
    ///
    /// Signals workers and the reclaimer to stop, then waits for in-flight
    /// deliveries within the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns error if graceful shutdown times out.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        self.cancellation_token.cancel();

        if let Some(reclaimer) = self.reclaimer.take() {
            let _ = reclaimer.await;
        }

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Processes exactly one batch synchronously.
    ///
    /// Designed for tests and controlled batch processing: claims one
    /// batch, processes it to completion, and returns the number of jobs
    /// handled without starting persistent workers.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = DeliveryWorker::new(
            0,
            self.store.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.audit.clone(),
            self.clock.clone(),
        );

        worker.process_batch().await
    }

    /// Runs one stale sweep immediately. Exposed for tests.
    ///
    /// # Errors
    ///
    /// Returns error if the sweep update fails.
    pub async fn reclaim_stale_now(&self) -> Result<u64> {
        let stale_window = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let cutoff = self.clock.now() - stale_window;
        self.store
            .reclaim_stale(cutoff)
            .await
            .map_err(|e| crate::error::DeliveryError::store(e.to_string()))
    }
}
