// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway HTTP server built on axum.
//!
//! Sets up routes, middleware, and shared state for the control-plane API.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use conops_core::{ConopsError, RuntimeApplier, RuntimeCleaner};
use conops_registry::Registry;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Shared state for axum request handlers.
#[derive(Clone)]
pub struct GatewayState {
    /// The registry façade all handlers go through.
    pub registry: Arc<Registry>,
    /// Applies desired state for force-sync; absent in degraded deployments.
    pub applier: Option<Arc<dyn RuntimeApplier>>,
    /// Tears down runtime resources before delete.
    pub cleaner: Option<Arc<dyn RuntimeCleaner>>,
    /// Root shutdown token; force-sync applies derive from this rather than
    /// the request so client disconnects cannot abort them.
    pub shutdown: CancellationToken,
}

/// Build the application router.
pub fn build_router(state: GatewayState) -> Router {
    let api = Router::new()
        .route("/apps", post(handlers::register_app).get(handlers::list_apps))
        .route("/apps/{id}", get(handlers::get_app).delete(handlers::delete_app))
        .route("/apps/{id}/sync", post(handlers::force_sync_app))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until the process shuts down.
pub async fn start_server(host: &str, port: u16, state: GatewayState) -> Result<(), ConopsError> {
    let addr = format!("{host}:{port}");
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| ConopsError::Internal(format!("failed to bind gateway to {addr}: {err}")))?;

    tracing::info!("gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| ConopsError::Internal(format!("gateway server error: {err}")))
}
