//! HTTP server configuration and request routing.
//!
//! Axum server setup with tracing, timeout enforcement, request IDs, and
//! graceful shutdown for the job CRUD surface.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use echobox_core::{events::AuditSink, storage::Storage};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Repository access to the job store.
    pub storage: Arc<Storage>,
    /// Audit sink receiving user-action transitions (cancel).
    pub audit: Arc<dyn AuditSink>,
}

/// Creates the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use echobox_api::server::{create_router, AppState};
/// use echobox_core::{events::TracingAuditSink, storage::Storage};
/// use sqlx::PgPool;
///
/// fn build(db: PgPool) {
///     let state = AppState {
///         storage: Arc::new(Storage::new(db)),
///         audit: Arc::new(TracingAuditSink::new()),
///     };
///     let app = create_router(state);
///     // Serve the app...
/// }
/// ```
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check));

    let job_routes = Router::new()
        .route("/jobs", post(handlers::create_job).get(handlers::list_jobs))
        .route("/jobs/{job_id}", get(handlers::get_job).patch(handlers::update_job))
        .route("/jobs/{job_id}/cancel", post(handlers::cancel_job));

    Router::new()
        .merge(health_routes)
        .merge(job_routes)
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Middleware injecting a request ID into all responses for tracing
/// requests across services.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Starts the HTTP server, serving until the shutdown future resolves.
///
/// # Errors
///
/// Returns `std::io::Error` if the port is unavailable or the listener
/// fails.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}
