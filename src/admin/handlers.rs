use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::framer::FramerMode;
use crate::lifecycle::state::LifecycleState;
use crate::pool::TargetStats;
use crate::routing::TunnelRule;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub state: LifecycleState,
    pub snapshot_version: u64,
    pub active_connections: u64,
    pub accepted_connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct RouteView {
    pub name: String,
    pub pattern: String,
    pub target: String,
}

#[derive(Debug, Serialize)]
pub struct TunnelView {
    pub passthrough: bool,
    pub rules: Vec<TunnelRule>,
}

#[derive(Debug, Serialize)]
pub struct RoutesView {
    pub snapshot_version: u64,
    pub mode: FramerMode,
    pub routes: Vec<RouteView>,
    pub tunnel: TunnelView,
}

pub async fn get_health() -> &'static str {
    "ok"
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let ctx = &state.ctx;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        state: ctx.state.get(),
        snapshot_version: ctx.store.version(),
        active_connections: ctx.tracker.active_count(),
        accepted_connections: ctx.tracker.accepted_total(),
        uptime_secs: ctx.started_at.elapsed().as_secs(),
    })
}

pub async fn get_pool(State(state): State<AdminState>) -> Json<Vec<TargetStats>> {
    Json(state.ctx.pool.stats())
}

pub async fn get_routes(State(state): State<AdminState>) -> Json<RoutesView> {
    let snapshot = state.ctx.store.load();
    let routes = snapshot
        .routes
        .rules()
        .iter()
        .map(|rule| RouteView {
            name: rule.name.clone(),
            pattern: rule.pattern.as_str().to_string(),
            target: rule.target.to_string(),
        })
        .collect();

    Json(RoutesView {
        snapshot_version: snapshot.version,
        mode: snapshot.mode,
        routes,
        tunnel: TunnelView {
            passthrough: snapshot.tunnel.passthrough,
            rules: snapshot.tunnel.rules().to_vec(),
        },
    })
}
