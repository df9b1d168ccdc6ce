use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration, deserialized from orchestrator.toml.
///
/// Every section has workable defaults; an empty file yields the documented
/// default behaviour. `DATABASE_URL` is taken from the environment, not from
/// this file, so credentials never land in version control.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub tx: TransactionConfig,
}

/// Connection pool sizing and per-connection session limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections kept open even when idle.
    #[serde(default = "default_pool_min")]
    pub min: u32,
    /// Hard cap on live connections.
    #[serde(default = "default_pool_max")]
    pub max: u32,
    /// Bounded wait to acquire a connection before failing the request.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-statement execution limit applied on every connection.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    /// Row-lock wait limit; short so deadlock risk becomes a retryable error.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Idle-in-transaction session limit.
    #[serde(default = "default_idle_in_tx_timeout_ms")]
    pub idle_in_tx_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: default_pool_min(),
            max: default_pool_max(),
            connect_timeout_ms: default_connect_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            idle_in_tx_timeout_ms: default_idle_in_tx_timeout_ms(),
        }
    }
}

fn default_pool_min() -> u32 {
    3
}

fn default_pool_max() -> u32 {
    15
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_statement_timeout_ms() -> u64 {
    30_000
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_idle_in_tx_timeout_ms() -> u64 {
    60_000
}

/// Retry parameters for transient persistence failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling. Deadlock retries are additionally capped at 5s.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Heartbeat staleness policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// A worker whose last heartbeat is older than this is stale.
    #[serde(default = "default_heartbeat_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Period of the background stale-worker sweep.
    #[serde(default = "default_sweep_period_seconds")]
    pub sweep_period_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_heartbeat_timeout_seconds(),
            sweep_period_seconds: default_sweep_period_seconds(),
        }
    }
}

fn default_heartbeat_timeout_seconds() -> u64 {
    300
}

fn default_sweep_period_seconds() -> u64 {
    60
}

/// Load-balancing policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Period of the background imbalance evaluation.
    #[serde(default = "default_rebalance_period_seconds")]
    pub period_seconds: u64,
    /// Fractional deviation of max load from the mean that triggers a full
    /// rebalance (0.20 = 20%).
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            period_seconds: default_rebalance_period_seconds(),
            imbalance_threshold: default_imbalance_threshold(),
        }
    }
}

fn default_rebalance_period_seconds() -> u64 {
    300
}

fn default_imbalance_threshold() -> f64 {
    0.20
}

/// Orphaned-assignment sweep policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_failover_period_seconds")]
    pub period_seconds: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            period_seconds: default_failover_period_seconds(),
        }
    }
}

fn default_failover_period_seconds() -> u64 {
    10
}

/// Consistency-check policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconciler_period_seconds")]
    pub period_seconds: u64,
    /// Auto-repair attempts per distinct issue before giving up on it.
    #[serde(default = "default_max_attempts_per_issue")]
    pub max_attempts_per_issue: u32,
    /// Reports kept in the in-memory history.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            period_seconds: default_reconciler_period_seconds(),
            max_attempts_per_issue: default_max_attempts_per_issue(),
            history_size: default_history_size(),
        }
    }
}

fn default_reconciler_period_seconds() -> u64 {
    120
}

fn default_max_attempts_per_issue() -> u32 {
    3
}

fn default_history_size() -> usize {
    100
}

/// Long-transaction monitoring policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// A transaction open longer than this is logged as long-running;
    /// past twice this it is marked for forced rollback.
    #[serde(default = "default_tx_timeout_threshold_seconds")]
    pub timeout_threshold_seconds: u64,
    /// Period of the watchdog scan.
    #[serde(default = "default_tx_monitor_period_seconds")]
    pub monitor_period_seconds: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_threshold_seconds: default_tx_timeout_threshold_seconds(),
            monitor_period_seconds: default_tx_monitor_period_seconds(),
        }
    }
}

fn default_tx_timeout_threshold_seconds() -> u64 {
    30
}

fn default_tx_monitor_period_seconds() -> u64 {
    5
}
