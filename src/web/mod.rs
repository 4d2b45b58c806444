//! # Status Interface
//!
//! HTTP endpoints for triggering syncs and watching them: health, manual
//! triggers, run status, progress (polled or streamed) and queue control.

use axum::http::StatusCode;
use axum::Router;
use std::future::Future;
use std::{sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::error::{Result, SyncError};

pub mod handlers;
pub mod response_types;
pub mod routes;
pub mod state;

pub use response_types::{ApiError, ApiResult};
pub use state::AppState;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the router with all routes and middleware
pub fn create_app(state: Arc<AppState>) -> Router {
    let common_middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ));

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::sync_routes())
        .merge(routes::queue_routes())
        .layer(common_middleware)
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(state: Arc<AppState>, bind_address: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| SyncError::Configuration(format!("cannot bind {bind_address}: {e}")))?;
    info!(address = %bind_address, "🌐 Status interface listening");

    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| SyncError::fatal(format!("web server failed: {e}")))
}
