use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{StreamId, WorkerId};
use crate::types::WorkerStatus;

/// POST /diagnostic request body: a worker's self-reported view of its
/// assignment set, to be compared against the authoritative table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticRequest {
    pub worker_id: WorkerId,
    pub local_streams: Vec<StreamId>,
    pub local_stream_count: usize,
}

/// POST /diagnostic response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticResponse {
    pub worker_id: WorkerId,
    pub checked_at: DateTime<Utc>,
    pub is_synchronized: bool,
    pub local_state: DiagnosticSide,
    pub orchestrator_state: DiagnosticSide,
    pub inconsistencies: DiagnosticDelta,
    pub streams_in_sync: Vec<StreamId>,
    pub worker_info: DiagnosticWorkerInfo,
    pub recommendations: Vec<String>,
}

/// One side of the comparison (worker-local or authoritative).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticSide {
    pub stream_count: usize,
    pub streams: Vec<StreamId>,
}

/// The differences between the two sides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticDelta {
    /// Streams the worker processes without an active row.
    pub streams_only_local: Vec<StreamId>,
    /// Streams the table assigns that the worker does not process.
    pub streams_only_orchestrator: Vec<StreamId>,
    /// Worker's self-reported count disagrees with its authoritative set.
    pub count_mismatch: bool,
    /// Worker row's load counter disagrees with its active-row count.
    pub load_mismatch: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticWorkerInfo {
    pub status: WorkerStatus,
    pub capacity: i32,
    pub recorded_load: i32,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_age_seconds: i64,
}
