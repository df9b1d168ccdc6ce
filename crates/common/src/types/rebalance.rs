use serde::{Deserialize, Serialize};

/// What kind of reshuffle produced a rebalance-history row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceKind {
    /// Capacity-proportional redistribution of every active assignment.
    Full,
    /// Refill of a re-registered worker from the available pool.
    Immediate,
    /// Orphan redistribution after a worker went away.
    Failover,
}

impl RebalanceKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Immediate => "immediate",
            Self::Failover => "failover",
        }
    }
}
