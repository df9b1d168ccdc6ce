use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{StreamId, WorkerId};

/// The six anomaly classes the reconciler detects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Active assignment whose worker is missing, inactive, or stale.
    Orphaned,
    /// More than one active row for the same stream.
    Duplicate,
    /// Worker reports a stream it has no active row for.
    Unauthorized,
    /// Worker load counter disagrees with its active-row count.
    StateMismatch,
    /// Worker marked active but its heartbeat is past the timeout.
    HeartbeatTimeout,
    /// Active worker load deviates from the fleet mean by more than the threshold.
    LoadImbalance,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orphaned => "orphaned",
            Self::Duplicate => "duplicate",
            Self::Unauthorized => "unauthorized",
            Self::StateMismatch => "state_mismatch",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::LoadImbalance => "load_imbalance",
        }
    }
}

/// Anomaly severity, ordered from least to most serious.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// One detected inconsistency between authoritative and observed state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    /// Workers involved: the assignee(s) for stream anomalies, the worker
    /// itself for worker-level anomalies.
    #[serde(default)]
    pub worker_ids: Vec<WorkerId>,
    pub severity: Severity,
    pub description: String,
}

impl Anomaly {
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Outcome of one reconciliation cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub checked_at: DateTime<Utc>,
    pub total_streams_checked: usize,
    pub total_workers_checked: usize,
    pub anomalies: Vec<Anomaly>,
    /// Scalar in [0, 1]; 1.0 means no issues were found.
    pub consistency_score: f64,
    pub recommendations: Vec<String>,
    /// How many anomalies were repaired automatically this cycle.
    pub repaired: usize,
}

impl ConsistencyReport {
    pub fn is_healthy(&self) -> bool {
        self.anomalies.is_empty()
    }

    pub fn critical_count(&self) -> usize {
        self.anomalies.iter().filter(|a| a.is_critical()).count()
    }
}
