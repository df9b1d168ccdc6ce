use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{StreamId, WorkerId};

/// Assignment row states.
///
/// `Active` binds a stream to a worker. `Unassigned` marks a row whose worker
/// was evicted before a new home was found. `Released` marks a row cancelled
/// by the worker or the reconciler. Non-active rows are deleted when the
/// stream is placed again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Active,
    Unassigned,
    Released,
}

impl AssignmentStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unassigned => "unassigned",
            Self::Released => "released",
        }
    }
}

/// Parse an assignment status from its database representation.
/// Unknown values parse as released so they never count against capacity.
pub fn parse_assignment_status(s: &str) -> AssignmentStatus {
    match s {
        "active" => AssignmentStatus::Active,
        "unassigned" => AssignmentStatus::Unassigned,
        "released" => AssignmentStatus::Released,
        other => {
            tracing::warn!(status = other, "Unknown assignment status, treating as released");
            AssignmentStatus::Released
        }
    }
}

/// One stream-to-worker binding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamAssignment {
    pub stream_id: StreamId,
    pub worker_id: WorkerId,
    pub assigned_at: DateTime<Utc>,
    pub status: AssignmentStatus,
}
