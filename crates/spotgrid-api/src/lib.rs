//! spotgrid-api: REST API for SpotGrid.
//!
//! Telemetry intake, decision lookup, the approval workflow and read
//! access to the risk registry, event log and downtime log.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/telemetry` | Queue a telemetry sample for the control loop |
//! | GET | `/api/v1/instances/{id}` | Instance record |
//! | GET | `/api/v1/instances/{id}/decision` | Latest decision |
//! | GET | `/api/v1/instances/{id}/decisions` | Decision history, newest first |
//! | GET | `/api/v1/instances/{id}/actions` | Action records |
//! | GET | `/api/v1/approvals` | List approval requests (`?status=`) |
//! | GET | `/api/v1/approvals/{id}` | Get an approval request |
//! | POST | `/api/v1/approvals/{id}/approve` | Approve a pending request |
//! | POST | `/api/v1/approvals/{id}/reject` | Reject a pending request |
//! | GET | `/api/v1/pools` | Risk registry snapshot |
//! | GET | `/api/v1/pools/{region}/{zone}/{family}` | One pool |
//! | GET | `/api/v1/risk-events` | Event log (`?from=&to=&pool=`) |
//! | GET | `/api/v1/downtime` | Downtime log (`?from=&to=&cause=`) |
//! | GET | `/api/v1/replicas/{primary}` | Replica links for a primary |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::{Notify, mpsc};

use spotgrid_approval::ApprovalGate;
use spotgrid_control::ControlLoop;
use spotgrid_core::Telemetry;
use spotgrid_metrics::ControlMetrics;
use spotgrid_risk::RiskRegistry;
use spotgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub registry: Arc<RiskRegistry>,
    pub gate: ApprovalGate,
    pub metrics: Arc<ControlMetrics>,
    /// Intake of the running control loop. `None` serves read-only.
    pub telemetry: Option<mpsc::Sender<Telemetry>>,
    /// Woken after an approval so the loop dispatches right away.
    pub approved: Option<Arc<Notify>>,
}

impl ApiState {
    /// State backed by a running control loop.
    pub fn for_loop(control: &ControlLoop, telemetry: mpsc::Sender<Telemetry>) -> Self {
        Self {
            store: control.store().clone(),
            registry: Arc::clone(control.registry()),
            gate: control.gate().clone(),
            metrics: Arc::clone(control.metrics()),
            telemetry: Some(telemetry),
            approved: Some(control.approval_signal()),
        }
    }
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/telemetry", post(handlers::submit_telemetry))
        .route("/instances/{id}", get(handlers::get_instance))
        .route("/instances/{id}/decision", get(handlers::latest_decision))
        .route("/instances/{id}/decisions", get(handlers::list_decisions))
        .route("/instances/{id}/actions", get(handlers::list_actions))
        .route("/approvals", get(handlers::list_approvals))
        .route("/approvals/{id}", get(handlers::get_approval))
        .route("/approvals/{id}/approve", post(handlers::approve))
        .route("/approvals/{id}/reject", post(handlers::reject))
        .route("/pools", get(handlers::list_pools))
        .route("/pools/{region}/{zone}/{family}", get(handlers::get_pool))
        .route("/risk-events", get(handlers::list_risk_events))
        .route("/downtime", get(handlers::list_downtime))
        .route("/replicas/{primary}", get(handlers::list_replicas))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
