use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common_metrics::setup_metrics_routes;
use conductor_core::{
    AssignmentStatus, BreakerState, RebalanceReason, StreamAssignment, WorkerCommand,
};
use eyre::Result;
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::api::errors::ApiError;
use crate::api::types::*;
use crate::app_context::AppContext;
use crate::metrics_consts::*;

pub async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(context: Arc<AppContext>) -> Router {
    let metrics_enabled = context.config.export_metrics;
    let request_timeout = Duration::from_secs(context.config.request_timeout_s);
    let concurrency = context.config.max_concurrency;

    let status_router = Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/ready", get(ready));

    let api_router = Router::new()
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/streams/assign", post(request_assignment))
        .route("/release", post(release))
        .route("/update_stream", post(update_stream))
        .route("/assignments", get(get_assignments))
        .route("/instances", get(list_instances))
        .route("/instances/:id", get(get_instance))
        .route("/diagnostics/inconsistencies", get(diagnostics))
        .route("/rebalance", post(trigger_rebalance))
        .route("/rebalance/check", get(rebalance_check))
        .route("/rebalance/stats", get(rebalance_stats))
        .route("/force_recovery", post(force_recovery))
        .layer(ConcurrencyLimitLayer::new(concurrency))
        .layer(TimeoutLayer::new(request_timeout));

    let router = Router::new()
        .merge(status_router)
        .merge(api_router)
        .with_state(context);

    // The metrics recorder touches process globals, so tests switch it off.
    if metrics_enabled {
        setup_metrics_routes(router)
    } else {
        router
    }
}

async fn index() -> &'static str {
    "conductor stream orchestrator"
}

// ── Idempotency plumbing ─────────────────────────────────────────

fn idem_key(headers: &HeaderMap, scope: &str) -> Option<String> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| format!("{scope}:{v}"))
}

fn replay(context: &AppContext, key: &Option<String>) -> Option<Response> {
    let (status, body) = key.as_ref().and_then(|k| context.idempotency.get(k))?;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    Some((status, Json(body)).into_response())
}

fn remember<T: Serialize>(context: &AppContext, key: Option<String>, body: &T) -> Response {
    let value = serde_json::to_value(body).unwrap_or(serde_json::Value::Null);
    if let Some(key) = key {
        context.idempotency.store(key, 200, value.clone());
    }
    (StatusCode::OK, Json(value)).into_response()
}

/// Migration commands for one worker: pick up inbound handoffs, drop
/// outbound ones.
async fn pending_commands(
    context: &AppContext,
    instance_id: &str,
) -> Result<Vec<WorkerCommand>, ApiError> {
    let owned = context.store.list_by_instance(instance_id).await?;
    let inbound = context.store.inbound_migrations(instance_id).await?;

    let mut commands: Vec<WorkerCommand> = inbound
        .into_iter()
        .map(|stream_id| WorkerCommand::AddStream { stream_id })
        .collect();
    commands.extend(
        owned
            .iter()
            .filter(|a| a.status == AssignmentStatus::Migrating)
            .map(|a| WorkerCommand::RemoveStream {
                stream_id: a.stream_id,
            }),
    );
    Ok(commands)
}

// ── Worker-facing endpoints ──────────────────────────────────────

async fn register(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    if request.id.trim().is_empty() {
        return Err(ApiError::BadRequest("id must not be empty".into()));
    }
    if request.capacity_max == 0 {
        return Err(ApiError::BadRequest("capacity_max must be positive".into()));
    }

    let key = idem_key(&headers, "register");
    if let Some(response) = replay(&context, &key) {
        return Ok(response);
    }

    let outcome = context
        .registry
        .register(
            &request.id,
            request.address.clone(),
            request.capacity_max as i32,
            request.metadata.clone(),
        )
        .await?;

    let initial_assignment: Vec<i64> = context
        .store
        .list_by_instance(&request.id)
        .await?
        .iter()
        .map(|a| a.stream_id)
        .collect();
    let commands = pending_commands(&context, &request.id).await?;

    common_metrics::inc(REGISTRATIONS_COUNT, &[], 1);
    info!(instance = %request.id, ?outcome, "instance registered");

    let response = RegisterResponse {
        outcome,
        heartbeat_interval_s: context.config.heartbeat_interval_s,
        initial_assignment,
        commands,
    };
    Ok(remember(&context, key, &response))
}

async fn heartbeat(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Response, ApiError> {
    let key = idem_key(&headers, "heartbeat");
    if let Some(response) = replay(&context, &key) {
        return Ok(response);
    }

    let signal = context.take_heartbeat_signal(&request.id);
    let result = context
        .registry
        .record_heartbeat(&request.id, request.sent_at, signal)
        .await
        .map_err(|e| {
            if matches!(e, conductor_core::StoreError::StaleHeartbeat(_)) {
                common_metrics::inc(STALE_HEARTBEATS_COUNT, &[], 1);
            }
            ApiError::from(e)
        })?;

    if let Some(metrics) = request.metrics.clone() {
        if let Err(e) = context.registry.store_metrics(&request.id, metrics).await {
            warn!(instance = %request.id, error = %e, "failed to store worker metrics");
        }
    }

    if result.became_active {
        let rebalancer = context.rebalancer.clone();
        let id = request.id.clone();
        tokio::spawn(async move {
            match rebalancer.evaluate(RebalanceReason::NewInstance, true).await {
                Ok(summary) => info!(instance = %id, ?summary, "post-activation rebalance"),
                Err(e) => warn!(instance = %id, error = %e, "post-activation rebalance failed"),
            }
        });
    }

    let commands = pending_commands(&context, &request.id).await?;
    common_metrics::inc(HEARTBEATS_COUNT, &[], 1);

    let response = HeartbeatResponse {
        status: result.instance.status,
        commands,
    };
    Ok(remember(&context, key, &response))
}

async fn request_assignment(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<AssignRequest>,
) -> Result<Response, ApiError> {
    let key = idem_key(&headers, "assign");
    if let Some(response) = replay(&context, &key) {
        return Ok(response);
    }

    let instance = context
        .registry
        .get(&request.id)
        .await?
        .ok_or_else(|| ApiError::UnknownInstance(request.id.clone()))?;
    if !instance.status.accepts_assignments() {
        return Err(ApiError::Conflict {
            code: "not_eligible",
            detail: format!("instance {} cannot receive assignments", request.id),
        });
    }

    let owned = context.store.list_by_instance(&request.id).await?.len() as i64;
    let headroom = (instance.capacity_max as i64 - owned).max(0) as usize;

    let catalog = context.catalog.snapshot().as_ref().clone();
    let unassigned = context.store.unassigned_from(catalog).await?;

    let count = (request.desired_count as usize)
        .min(headroom)
        .min(unassigned.len());
    let picked: Vec<i64> = unassigned.into_iter().take(count).collect();

    let stream_ids = if picked.is_empty() {
        Vec::new()
    } else {
        context.store.assign(&request.id, picked).await?
    };

    common_metrics::inc(STREAMS_ASSIGNED_COUNT, &[], stream_ids.len() as u64);
    let response = AssignResponse { stream_ids };
    Ok(remember(&context, key, &response))
}

async fn release(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<ReleaseRequest>,
) -> Result<Response, ApiError> {
    let key = idem_key(&headers, "release");
    if let Some(response) = replay(&context, &key) {
        return Ok(response);
    }

    let outcome = context
        .store
        .release(&request.id, request.stream_ids)
        .await?;

    common_metrics::inc(STREAMS_RELEASED_COUNT, &[], outcome.released.len() as u64);
    let response = ReleaseResponse {
        released: outcome.released,
        ignored: outcome.ignored,
    };
    Ok(remember(&context, key, &response))
}

async fn update_stream(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<UpdateStreamRequest>,
) -> Result<Response, ApiError> {
    // A replayed report must not count twice into the performance score,
    // even when the retry carries a fresh timestamp.
    let key = idem_key(&headers, "update_stream");
    if let Some(response) = replay(&context, &key) {
        return Ok(response);
    }

    context
        .registry
        .get(&request.id)
        .await?
        .ok_or_else(|| ApiError::UnknownInstance(request.id.clone()))?;

    // Duplicates and out-of-order reports are silently absorbed; the call
    // only feeds the performance score and observability.
    context.record_stream_update(
        &request.id,
        request.stream_id,
        request.status,
        request.timestamp,
    );
    Ok(remember(&context, key, &serde_json::json!({})))
}

// ── Diagnostics and operator endpoints ───────────────────────────

async fn get_assignments(
    State(context): State<Arc<AppContext>>,
    Query(query): Query<AssignmentsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(instance) = &query.instance {
        let stream_ids: Vec<i64> = context
            .store
            .list_by_instance(instance)
            .await?
            .iter()
            .map(|a| a.stream_id)
            .collect();
        return Ok(Json(serde_json::json!({ "stream_ids": stream_ids })));
    }

    let rows: Vec<StreamAssignment> = context.store.list_live().await?;
    let entries: Vec<AssignmentsEntry> = rows
        .into_iter()
        .map(|a| AssignmentsEntry {
            stream_id: a.stream_id,
            instance_id: a.instance_id,
            status: a.status,
            migration_target: a.migration_target,
        })
        .collect();
    Ok(Json(serde_json::json!({ "assignments": entries })))
}

async fn list_instances(
    State(context): State<Arc<AppContext>>,
) -> Result<Json<Vec<InstanceSummary>>, ApiError> {
    let instances = context.registry.list().await?;
    let counts: HashMap<String, i64> = context
        .store
        .counts_by_instance()
        .await?
        .into_iter()
        .collect();

    Ok(Json(
        instances
            .into_iter()
            .map(|i| InstanceSummary {
                load: counts.get(&i.id).copied().unwrap_or(0),
                id: i.id,
                status: i.status,
                capacity_max: i.capacity_max,
                performance_score: i.performance_score,
                last_heartbeat: i.last_heartbeat,
            })
            .collect(),
    ))
}

async fn get_instance(
    State(context): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<InstanceDetail>, ApiError> {
    let instance = context
        .registry
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::UnknownInstance(id.clone()))?;
    let assignments = context.store.list_by_instance(&id).await?;

    Ok(Json(InstanceDetail {
        summary: InstanceSummary {
            id: instance.id,
            status: instance.status,
            capacity_max: instance.capacity_max,
            load: assignments.len() as i64,
            performance_score: instance.performance_score,
            last_heartbeat: instance.last_heartbeat,
        },
        registered_at: instance.registered_at,
        failure_count: instance.failure_count,
        status_reason: instance.status_reason,
        stream_ids: assignments.iter().map(|a| a.stream_id).collect(),
        metadata: instance.metadata,
    }))
}

async fn health_check(State(context): State<Arc<AppContext>>) -> Response {
    let gatekeeper = context.gatekeeper.health();
    let liveness = context.liveness.get_status();

    let overall = match (gatekeeper.breaker, liveness.verdict) {
        (BreakerState::Open, _) | (_, health::Verdict::Unhealthy) => "unhealthy",
        (BreakerState::HalfOpen, _) | (_, health::Verdict::Degraded) => "degraded",
        _ => "healthy",
    };

    let status = if overall == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = HealthResponse {
        overall,
        gatekeeper,
        components: liveness.components,
    };
    (status, Json(body)).into_response()
}

async fn ready(State(context): State<Arc<AppContext>>) -> Response {
    let breaker_closed = context.gatekeeper.breaker_state() == BreakerState::Closed;
    let warmed_up = context.first_cycle_done.load(Ordering::Relaxed);

    if breaker_closed && warmed_up {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn diagnostics(
    State(context): State<Arc<AppContext>>,
) -> Result<Json<DiagnosticsResponse>, ApiError> {
    let defects = context.checker.run_once().await?;
    Ok(Json(DiagnosticsResponse { defects }))
}

async fn trigger_rebalance(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let key = idem_key(&headers, "rebalance");
    if let Some(response) = replay(&context, &key) {
        return Ok(response);
    }

    // Operator-initiated: bypasses the periodic cooldown.
    let summary = context
        .rebalancer
        .evaluate(RebalanceReason::Manual, true)
        .await?;
    common_metrics::inc(REBALANCE_RUNS, &[], 1);
    Ok(remember(&context, key, &summary))
}

async fn rebalance_check(
    State(context): State<Arc<AppContext>>,
) -> Result<Json<conductor_core::balancer::ImbalanceReport>, ApiError> {
    Ok(Json(context.rebalancer.check().await?))
}

async fn rebalance_stats(
    State(context): State<Arc<AppContext>>,
) -> Result<Json<conductor_core::RebalanceStats>, ApiError> {
    Ok(Json(context.rebalancer.stats().await?))
}

async fn force_recovery(
    State(context): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<ForceRecoveryRequest>,
) -> Result<Response, ApiError> {
    let key = idem_key(&headers, "force_recovery");
    if let Some(response) = replay(&context, &key) {
        return Ok(response);
    }

    context
        .registry
        .get(&request.id)
        .await?
        .ok_or_else(|| ApiError::UnknownInstance(request.id.clone()))?;

    let reason = request.reason.as_deref().unwrap_or("operator request");
    info!(instance = %request.id, reason, "forced emergency recovery");
    context.detector.emergency_recovery(&request.id, reason).await?;
    common_metrics::inc(DETECTOR_EMERGENCIES, &[], 1);

    Ok(remember(
        &context,
        key,
        &serde_json::json!({ "instance": request.id, "recovered": true }),
    ))
}
