use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;

use aircheck_common::api::control::{
    AssignRequest, AssignResponse, AssignmentsResponse, ErrorBody, HeartbeatAck, HeartbeatRequest,
    InstanceTotals, InstancesResponse, RegisterRequest, RegisterResponse, ReleaseRequest,
    ReleaseResponse, StatusResponse, StreamTotals,
};
use aircheck_common::api::diagnostic::{
    DiagnosticDelta, DiagnosticRequest, DiagnosticResponse, DiagnosticSide, DiagnosticWorkerInfo,
};
use aircheck_common::error::OrchestratorError;
use aircheck_common::ids::{StreamId, WorkerId};
use aircheck_common::types::{RebalanceKind, WorkerInstance};

use crate::assignments;
use crate::placement::RebalanceSummary;

use super::AppState;

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn error_response(e: OrchestratorError) -> ApiError {
    let status = match &e {
        OrchestratorError::Invalid(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Inactive(_)
        | OrchestratorError::NoCapacity(_)
        | OrchestratorError::AlreadyAssigned(_) => StatusCode::CONFLICT,
        OrchestratorError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorBody {
            error: e.kind().to_string(),
            message: e.to_string(),
        }),
    )
}

/// POST /register — register or re-register a worker.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<RegisterResponse> {
    let outcome = state.registry.register(&req).await.map_err(error_response)?;

    if outcome.reregistration && !outcome.refilled.is_empty() {
        state
            .placement
            .record_history(
                RebalanceKind::Immediate,
                &format!("worker re-registered: {}", req.worker_id),
                &RebalanceSummary {
                    streams_moved: outcome.refilled.len(),
                    instances_affected: 1,
                },
            )
            .await;
    }

    // The imbalance evaluation runs after the registration committed; a
    // failure here never fails the registration itself.
    let mut auto_rebalanced = false;
    if !outcome.reregistration {
        match state
            .placement
            .maybe_rebalance_after_register(&req.worker_id)
            .await
        {
            Ok(ran) => auto_rebalanced = ran,
            Err(e) => {
                tracing::warn!(worker_id = %req.worker_id, error = %e, "Post-registration rebalance failed");
            }
        }
    }

    Ok(Json(RegisterResponse {
        worker_id: req.worker_id,
        capacity: req.capacity,
        reregistration: outcome.reregistration,
        auto_rebalanced,
        assigned_streams: outcome.refilled,
    }))
}

/// POST /heartbeat — record a worker heartbeat.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<HeartbeatAck> {
    state
        .registry
        .heartbeat(&req.worker_id, req.status, req.load, req.metrics.as_ref())
        .await
        .map_err(error_response)?;

    Ok(Json(HeartbeatAck {
        worker_id: req.worker_id,
        acknowledged_at: Utc::now(),
    }))
}

/// POST /assign_streams — hand available streams to a worker.
pub async fn assign_streams(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<AssignResponse> {
    let assigned = state
        .placement
        .assign_to(&req.worker_id, req.requested_count)
        .await
        .map_err(error_response)?;

    Ok(Json(AssignResponse {
        worker_id: req.worker_id,
        count: assigned.len(),
        assigned_streams: assigned,
    }))
}

/// POST /release_streams — give streams back to the pool.
pub async fn release_streams(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<ReleaseResponse> {
    let released = state
        .placement
        .release(&req.worker_id, &req.stream_ids)
        .await
        .map_err(error_response)?;

    Ok(Json(ReleaseResponse {
        worker_id: req.worker_id,
        count: released.len(),
        released_streams: released,
    }))
}

/// GET /status — fleet and persistence aggregate. Always answers; sections
/// that failed to report are named in `degraded`.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let mut degraded = Vec::new();

    let instances = match state.registry.totals().await {
        Ok(totals) => totals,
        Err(e) => {
            tracing::warn!(error = %e, "Status: registry totals unavailable");
            degraded.push("registry".to_string());
            InstanceTotals::default()
        }
    };

    let streams = match stream_totals(&state).await {
        Ok(totals) => totals,
        Err(e) => {
            tracing::warn!(error = %e, "Status: stream totals unavailable");
            degraded.push("assignments".to_string());
            StreamTotals::default()
        }
    };

    let load_percentage = if instances.total_capacity > 0 {
        (instances.current_load as f64 / instances.total_capacity as f64 * 100.0 * 100.0).round()
            / 100.0
    } else {
        0.0
    };

    Json(StatusResponse {
        instances,
        streams,
        load_percentage,
        persistence: Some(state.db.health_snapshot()),
        consistency: state.reconciler.last_report(),
        degraded,
    })
}

async fn stream_totals(state: &AppState) -> Result<StreamTotals, OrchestratorError> {
    let mut conn = state.db.acquire("api.stream_totals").await?;
    let assigned = assignments::count_active(&mut conn).await?;
    let available = assignments::count_available(&mut conn).await?;

    Ok(StreamTotals {
        assigned,
        available,
        total: assigned + available,
    })
}

/// GET /instances — every registered worker.
pub async fn instances(State(state): State<Arc<AppState>>) -> ApiResult<InstancesResponse> {
    let instances = state.registry.list().await.map_err(error_response)?;

    Ok(Json(InstancesResponse {
        total: instances.len(),
        instances,
    }))
}

/// GET /instances/{worker_id} — one worker.
pub async fn instance(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> ApiResult<WorkerInstance> {
    let worker = state
        .registry
        .get(&WorkerId(worker_id))
        .await
        .map_err(error_response)?;

    Ok(Json(worker))
}

/// GET /stream_assignments — every assignment row.
pub async fn stream_assignments(
    State(state): State<Arc<AppState>>,
) -> ApiResult<AssignmentsResponse> {
    let mut conn = state
        .db
        .acquire("api.stream_assignments")
        .await
        .map_err(|e| error_response(e.into()))?;
    let rows = assignments::list_all(&mut conn)
        .await
        .map_err(|e| error_response(e.into()))?;

    Ok(Json(AssignmentsResponse {
        total: rows.len(),
        assignments: rows,
    }))
}

/// POST /diagnostic — compare a worker's self-reported stream set with the
/// authoritative table. The self-report also feeds the reconciler.
pub async fn diagnostic(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DiagnosticRequest>,
) -> ApiResult<DiagnosticResponse> {
    let worker = state
        .registry
        .get(&req.worker_id)
        .await
        .map_err(error_response)?;

    let mut conn = state
        .db
        .acquire("api.diagnostic")
        .await
        .map_err(|e| error_response(e.into()))?;
    let mut authoritative = assignments::list_active_by_worker(&mut conn, &req.worker_id)
        .await
        .map_err(|e| error_response(e.into()))?;
    drop(conn);
    authoritative.sort_unstable();

    state
        .reconciler
        .note_worker_report(&req.worker_id, req.local_streams.clone());

    let local: HashSet<StreamId> = req.local_streams.iter().copied().collect();
    let table: HashSet<StreamId> = authoritative.iter().copied().collect();

    let mut only_local: Vec<StreamId> = local.difference(&table).copied().collect();
    only_local.sort_unstable();
    let mut only_table: Vec<StreamId> = table.difference(&local).copied().collect();
    only_table.sort_unstable();
    let mut in_sync: Vec<StreamId> = local.intersection(&table).copied().collect();
    in_sync.sort_unstable();

    let count_mismatch = req.local_stream_count != authoritative.len();
    let load_mismatch = worker.load as usize != authoritative.len();
    let is_synchronized =
        only_local.is_empty() && only_table.is_empty() && !count_mismatch && !load_mismatch;

    let heartbeat_age_seconds = (Utc::now() - worker.last_heartbeat).num_seconds();

    let mut recommendations = Vec::new();
    if !only_local.is_empty() {
        recommendations.push(format!(
            "Worker processes {} streams the orchestrator has not assigned to it; drop them",
            only_local.len()
        ));
    }
    if !only_table.is_empty() {
        recommendations.push(format!(
            "Orchestrator assigns {} streams the worker is not processing; pick them up",
            only_table.len()
        ));
    }
    if count_mismatch {
        recommendations.push("Local stream count disagrees with the assignment table".to_string());
    }
    if load_mismatch {
        recommendations
            .push("Recorded load disagrees with active assignments; reconciler will repair".to_string());
    }
    if heartbeat_age_seconds > 120 {
        recommendations.push(format!(
            "Last heartbeat was {heartbeat_age_seconds}s ago; check worker connectivity"
        ));
    }
    if !is_synchronized {
        recommendations.push("Re-register to resynchronise if drift persists".to_string());
    }

    tracing::info!(
        worker_id = %req.worker_id,
        synchronized = is_synchronized,
        "Diagnostic check"
    );

    Ok(Json(DiagnosticResponse {
        worker_id: req.worker_id,
        checked_at: Utc::now(),
        is_synchronized,
        local_state: DiagnosticSide {
            stream_count: req.local_stream_count,
            streams: {
                let mut streams = req.local_streams;
                streams.sort_unstable();
                streams
            },
        },
        orchestrator_state: DiagnosticSide {
            stream_count: authoritative.len(),
            streams: authoritative,
        },
        inconsistencies: DiagnosticDelta {
            streams_only_local: only_local,
            streams_only_orchestrator: only_table,
            count_mismatch,
            load_mismatch,
        },
        streams_in_sync: in_sync,
        worker_info: DiagnosticWorkerInfo {
            status: worker.status,
            capacity: worker.capacity,
            recorded_load: worker.load,
            last_heartbeat: worker.last_heartbeat,
            heartbeat_age_seconds,
        },
        recommendations,
    }))
}

/// GET /health — liveness of the orchestrator and its database.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database_ok = state.db.health_check().await.is_ok();

    let status = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": if database_ok { "healthy" } else { "unhealthy" },
        "services": {
            "postgres": if database_ok { "healthy" } else { "unhealthy" },
        }
    });

    (status, Json(body))
}

/// GET /metrics — Prometheus exposition.
pub async fn metrics_export(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
