use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;

/// Worker lifecycle states.
///
/// A worker is created `Active` by registration, becomes `Inactive` when its
/// heartbeat goes stale, and returns to `Active` on re-registration. Rows
/// persist after going inactive for audit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Inactive,
}

impl WorkerStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Parse a worker status from its database representation.
/// Unknown values are treated as inactive so a bad row never looks healthy.
pub fn parse_worker_status(s: &str) -> WorkerStatus {
    match s {
        "active" => WorkerStatus::Active,
        "inactive" => WorkerStatus::Inactive,
        other => {
            tracing::warn!(status = other, "Unknown worker status, treating as inactive");
            WorkerStatus::Inactive
        }
    }
}

/// A registered worker instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: WorkerId,
    /// Host and port are informational, used by operators.
    pub host: String,
    pub port: i32,
    /// Maximum concurrent streams this worker accepts.
    pub capacity: i32,
    /// Streams currently assigned. Invariant: 0 <= load <= capacity.
    pub load: i32,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerInstance {
    /// Remaining placement slots.
    pub fn remaining_capacity(&self) -> i32 {
        (self.capacity - self.load).max(0)
    }
}

/// Resource metrics optionally attached to a heartbeat. Stored as a
/// time-series for display; never used for placement decisions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<f64>,
    /// 1/5/15-minute load averages, in that order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_average: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
}
