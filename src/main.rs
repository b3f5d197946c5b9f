//! Echobox scheduled delivery service.
//!
//! Main entry point. Initializes logging, configuration, the database
//! pool, the delivery engine, and the HTTP API, then coordinates graceful
//! shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use echobox_api::{AppState, Config};
use echobox_core::{events::TracingAuditSink, storage::Storage, time::RealClock};
use echobox_delivery::{
    artifact::HttpArtifactResolver,
    channel::{HttpEmailSender, HttpSmsSender},
    DeliveryEngine,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting echobox scheduled delivery service");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        worker_pool_size = config.worker_pool_size,
        poll_interval_secs = config.poll_interval_secs,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database migrations completed");

    // Shared collaborators: clock, audit sink, provider clients.
    let clock = Arc::new(RealClock::new());
    let audit = Arc::new(TracingAuditSink::new());
    let client_config = config.to_client_config();

    let resolver = Arc::new(
        HttpArtifactResolver::new(&config.media_service_url, &client_config)
            .context("failed to build artifact resolver")?,
    );
    let email = Arc::new(
        HttpEmailSender::new(&config.email_gateway_url, &config.email_gateway_key, &client_config)
            .context("failed to build email sender")?,
    );
    let sms = Arc::new(
        HttpSmsSender::new(&config.sms_gateway_url, &config.sms_gateway_key, &client_config)
            .context("failed to build sms sender")?,
    );

    let mut engine = DeliveryEngine::new(
        &db_pool,
        resolver,
        email,
        sms,
        audit.clone(),
        clock,
        config.to_delivery_config(),
    );
    engine.start().await.context("failed to start delivery engine")?;

    let shutdown_token = CancellationToken::new();
    let server_handle = tokio::spawn({
        let state = AppState { storage: Arc::new(Storage::new(db_pool.clone())), audit };
        let addr = config.parse_server_addr()?;
        let shutdown = shutdown_token.clone().cancelled_owned();
        async move {
            if let Err(server_error) = echobox_api::start_server(state, addr, shutdown).await {
                error!(error = %server_error, "HTTP server failed");
            }
        }
    });

    info!("echobox is ready");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    shutdown_token.cancel();
    if let Err(engine_error) = engine.shutdown().await {
        error!(error = %engine_error, "delivery engine shutdown incomplete");
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            info!("shutdown grace period expired");
        }
        _ = server_handle => {
            info!("HTTP server stopped");
        }
    }

    db_pool.close().await;
    info!("echobox shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,echobox=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(connect_error) => {
                return Err(connect_error)
                    .context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Runs idempotent schema setup for the job store.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id UUID PRIMARY KEY,
            owner_id UUID NOT NULL,
            content_ref TEXT NOT NULL,
            contact_id UUID,
            recipient_email TEXT,
            recipient_phone TEXT,
            channels TEXT NOT NULL,
            scheduled_for TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            last_attempt_at TIMESTAMPTZ,
            next_attempt_at TIMESTAMPTZ,
            delivered_at TIMESTAMPTZ,
            failed_at TIMESTAMPTZ,
            cancelled_at TIMESTAMPTZ,
            last_error TEXT,
            metadata JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CHECK (attempts <= max_attempts)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create scheduled_jobs table")?;

    // Partial index keeps the claim query fast even with a large terminal
    // backlog.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_due
        ON scheduled_jobs(scheduled_for, next_attempt_at)
        WHERE status IN ('scheduled', 'in_progress')
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create due-jobs index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_owner
        ON scheduled_jobs(owner_id, created_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create owner index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
