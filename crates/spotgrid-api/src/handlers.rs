//! REST API handlers.
//!
//! Reads go straight to the store, registry and gate; telemetry is queued
//! for the control loop and answered with 202.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use spotgrid_approval::{ApprovalError, Resolution};
use spotgrid_core::Telemetry;
use spotgrid_metrics::{StateGauges, render_prometheus};
use spotgrid_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

// ── Telemetry ──────────────────────────────────────────────────

/// POST /api/v1/telemetry
pub async fn submit_telemetry(
    State(state): State<ApiState>,
    payload: Result<Json<Telemetry>, JsonRejection>,
) -> Response {
    let telemetry = match payload {
        Ok(Json(telemetry)) => telemetry,
        Err(e) => {
            state.metrics.record_telemetry(false);
            return error_response(&e.body_text(), StatusCode::BAD_REQUEST);
        }
    };
    if let Err(e) = telemetry.validate() {
        state.metrics.record_telemetry(false);
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }

    let Some(tx) = &state.telemetry else {
        return error_response("control loop not running", StatusCode::SERVICE_UNAVAILABLE);
    };

    let instance_id = telemetry.instance_id.clone();
    match tx.try_send(telemetry) {
        Ok(()) => {
            debug!(instance = %instance_id, "telemetry queued");
            (
                StatusCode::ACCEPTED,
                ApiResponse::ok(serde_json::json!({ "instance_id": instance_id, "status": "queued" })),
            )
                .into_response()
        }
        Err(TrySendError::Full(_)) => {
            warn!(instance = %instance_id, "telemetry backlog full");
            error_response("telemetry backlog full, retry later", StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(TrySendError::Closed(_)) => {
            error_response("control loop not running", StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

// ── Instances and decisions ────────────────────────────────────

/// GET /api/v1/instances/:id
pub async fn get_instance(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_instance(&id) {
        Ok(Some(instance)) => ApiResponse::ok(instance).into_response(),
        Ok(None) => error_response("instance not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/instances/:id/decision
pub async fn latest_decision(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.latest_decision(&id) {
        Ok(Some(decision)) => ApiResponse::ok(decision).into_response(),
        Ok(None) => error_response("no decision for instance", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /api/v1/instances/:id/decisions
pub async fn list_decisions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state.store.list_decisions(&id, query.limit) {
        Ok(decisions) => ApiResponse::ok(decisions).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/instances/:id/actions
pub async fn list_actions(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.list_actions_for_instance(&id) {
        Ok(actions) => ApiResponse::ok(actions).into_response(),
        Err(e) => internal(e),
    }
}

// ── Approvals ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ApprovalQuery {
    pub status: Option<ApprovalStatus>,
}

/// GET /api/v1/approvals
pub async fn list_approvals(
    State(state): State<ApiState>,
    Query(query): Query<ApprovalQuery>,
) -> Response {
    match state.gate.list(query.status) {
        Ok(requests) => ApiResponse::ok(requests).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/approvals/:id
pub async fn get_approval(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.gate.get(&id) {
        Ok(request) => ApiResponse::ok(request).into_response(),
        Err(ApprovalError::NotFound(_)) => {
            error_response("approval request not found", StatusCode::NOT_FOUND)
        }
        Err(e) => internal(e),
    }
}

/// Body of approve and reject calls.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/approvals/:id/approve
pub async fn approve(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Response {
    if req.actor.trim().is_empty() {
        return error_response("actor is required", StatusCode::BAD_REQUEST);
    }
    let result = state.gate.approve(&id, &req.actor);
    if matches!(result, Ok(Resolution::Applied(_)))
        && let Some(signal) = &state.approved
    {
        signal.notify_one();
    }
    resolution_response(result)
}

/// POST /api/v1/approvals/:id/reject
pub async fn reject(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Response {
    if req.actor.trim().is_empty() {
        return error_response("actor is required", StatusCode::BAD_REQUEST);
    }
    resolution_response(state.gate.reject(&id, &req.actor, req.reason))
}

fn resolution_response(result: Result<Resolution, ApprovalError>) -> Response {
    match result {
        Ok(Resolution::Applied(request)) => {
            info!(
                approval = %request.id,
                status = request.status.as_str(),
                actor = ?request.resolved_by,
                "approval resolved"
            );
            ApiResponse::ok(request).into_response()
        }
        Ok(Resolution::AlreadyResolved(request)) => error_response(
            &format!("approval request already {}", request.status.as_str()),
            StatusCode::CONFLICT,
        ),
        Err(ApprovalError::NotFound(_)) => {
            error_response("approval request not found", StatusCode::NOT_FOUND)
        }
        Err(e) => internal(e),
    }
}

// ── Risk registry ──────────────────────────────────────────────

/// GET /api/v1/pools
pub async fn list_pools(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.registry.snapshot()).into_response()
}

/// GET /api/v1/pools/:region/:zone/:family
pub async fn get_pool(
    State(state): State<ApiState>,
    Path((region, zone, family)): Path<(String, String, String)>,
) -> Response {
    let pool = PoolKey::new(&region, &zone, &family);
    ApiResponse::ok(state.registry.query(&pool)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RiskEventQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
    /// `region/zone/family`
    pub pool: Option<String>,
}

/// GET /api/v1/risk-events
pub async fn list_risk_events(
    State(state): State<ApiState>,
    Query(query): Query<RiskEventQuery>,
) -> Response {
    let pool = match query.pool.as_deref().map(str::parse::<PoolKey>).transpose() {
        Ok(pool) => pool,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    };
    let from = query.from.unwrap_or(0);
    let to = query.to.unwrap_or(u64::MAX);
    match state.registry.event_log().range(from, to, pool.as_ref()) {
        Ok(events) => ApiResponse::ok(events).into_response(),
        Err(e) => internal(e),
    }
}

// ── Downtime ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DowntimeQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub cause: Option<DowntimeCause>,
}

/// GET /api/v1/downtime
pub async fn list_downtime(
    State(state): State<ApiState>,
    Query(query): Query<DowntimeQuery>,
) -> Response {
    let from = query.from.unwrap_or(0);
    let to = query.to.unwrap_or(u64::MAX);
    match state.store.list_downtime(from, to, query.cause) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => internal(e),
    }
}

// ── Replicas ───────────────────────────────────────────────────

/// GET /api/v1/replicas/:primary
pub async fn list_replicas(
    State(state): State<ApiState>,
    Path(primary): Path<String>,
) -> Response {
    match state.store.list_replicas_for_primary(&primary) {
        Ok(links) => ApiResponse::ok(links).into_response(),
        Err(e) => internal(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let mut approvals = BTreeMap::from(
        [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Expired,
        ]
        .map(|s| (s.as_str().to_string(), 0u64)),
    );
    for request in state.gate.list(None).unwrap_or_default() {
        *approvals
            .entry(request.status.as_str().to_string())
            .or_insert(0) += 1;
    }

    let pools = state.registry.snapshot();
    let instances = state.store.list_instances().unwrap_or_default();
    let retired = instances.iter().filter(|i| i.retired).count() as u64;

    let gauges = StateGauges {
        approvals,
        pools_tracked: pools.len() as u64,
        pools_poisoned: pools.iter().filter(|p| p.is_poisoned).count() as u64,
        downtime_open: state
            .store
            .list_open_downtime()
            .map(|d| d.len() as u64)
            .unwrap_or(0),
        instances_active: instances.len() as u64 - retired,
        instances_retired: retired,
    };

    let body = render_prometheus(&state.metrics.snapshot(), &gauges);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
