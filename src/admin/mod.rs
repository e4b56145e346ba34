//! Admin HTTP API.
//!
//! # Responsibilities
//! - `/health` liveness check (always open)
//! - `/admin/*` introspection: status, pool counters, compiled routes
//! - Bearer-key protection of `/admin/*` when a key is configured
//! - Permissive CORS, so browser dashboards can read the API

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::proxy::ProxyContext;

use self::auth::admin_auth_middleware;
use self::handlers::{get_health, get_pool, get_routes, get_status};

/// Upper bound for one admin request.
const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// State injected into admin handlers.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub ctx: ProxyContext,
    pub api_key: Option<Arc<str>>,
}

impl AdminState {
    pub fn new(ctx: ProxyContext, api_key: Option<String>) -> Self {
        Self {
            ctx,
            api_key: api_key.filter(|key| !key.is_empty()).map(Arc::from),
        }
    }
}

#[allow(deprecated)]
pub fn setup_admin_router(state: AdminState) -> Router {
    let admin = Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/pool", get(get_pool))
        .route("/admin/routes", get(get_routes))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/health", get(get_health))
        .merge(admin)
        .with_state(state)
        .layer(TimeoutLayer::new(ADMIN_REQUEST_TIMEOUT))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// Outside the auth layer so preflight requests never need the key.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Bind the admin API and serve it in the background.
///
/// Bind failure is returned to the caller; the server task runs until aborted.
pub async fn spawn(addr: SocketAddr, state: AdminState) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let app = setup_admin_router(state);

    tracing::info!(address = %local_addr, "Admin API listening");
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Admin API stopped");
        }
    });
    Ok((local_addr, handle))
}
