use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{StreamId, WorkerId};
use crate::types::{
    ConsistencyReport, ResourceMetrics, StreamAssignment, WorkerInstance, WorkerStatus,
};

/// POST /register request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: WorkerId,
    pub host: String,
    pub port: i32,
    pub capacity: i32,
}

/// POST /register response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: WorkerId,
    pub capacity: i32,
    /// True when the id already existed; prior assignments were released.
    pub reregistration: bool,
    /// True when registration triggered a full rebalance.
    pub auto_rebalanced: bool,
    /// Streams handed to a re-registered worker immediately.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assigned_streams: Vec<StreamId>,
}

/// POST /heartbeat request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    /// The worker's authoritative self-reported load.
    pub load: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResourceMetrics>,
}

/// POST /heartbeat response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub worker_id: WorkerId,
    pub acknowledged_at: DateTime<Utc>,
}

/// POST /assign_streams request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignRequest {
    pub worker_id: WorkerId,
    pub requested_count: u32,
}

/// POST /assign_streams response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignResponse {
    pub worker_id: WorkerId,
    pub assigned_streams: Vec<StreamId>,
    pub count: usize,
}

/// POST /release_streams request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub worker_id: WorkerId,
    pub stream_ids: Vec<StreamId>,
}

/// POST /release_streams response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub worker_id: WorkerId,
    pub released_streams: Vec<StreamId>,
    pub count: usize,
}

/// GET /status response body. Always returned, even when subcomponents
/// degrade; degraded subcomponents are named in `degraded`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub instances: InstanceTotals,
    pub streams: StreamTotals,
    /// Fleet load as a percentage of total capacity.
    pub load_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceHealth>,
    /// Outcome of the most recent reconciliation cycle, if one has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstanceTotals {
    pub total: i64,
    pub active: i64,
    pub total_capacity: i64,
    pub current_load: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamTotals {
    pub assigned: i64,
    pub available: i64,
    pub total: i64,
}

/// Persistence-layer health snapshot included in /status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceHealth {
    pub pool: PoolState,
    pub acquires_total: u64,
    pub acquire_failures: u64,
    /// Successful acquires over total, as a percentage.
    pub success_rate: f64,
    pub avg_acquire_ms: f64,
    pub max_acquire_ms: u64,
    pub deadlock_count: u64,
    pub retry_count: u64,
    pub active_transactions: Vec<ActiveTransaction>,
    pub error_patterns: Vec<ErrorPatternSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolState {
    pub size: u32,
    pub idle: usize,
    pub min: u32,
    pub max: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActiveTransaction {
    pub id: String,
    /// Call-site label, e.g. "placement.assign_to".
    pub context: String,
    pub elapsed_ms: u64,
    pub query_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPatternSummary {
    pub pattern: String,
    pub count: u64,
    pub severity: String,
    pub last_seen: DateTime<Utc>,
}

/// GET /instances response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstancesResponse {
    pub instances: Vec<WorkerInstance>,
    pub total: usize,
}

/// GET /stream_assignments response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignmentsResponse {
    pub assignments: Vec<StreamAssignment>,
    pub total: usize,
}

/// Error body returned by every failed operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error kind, see `OrchestratorError::kind`.
    pub error: String,
    pub message: String,
}
