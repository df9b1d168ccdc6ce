pub mod monitor;
pub mod patterns;
pub mod retry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use aircheck_common::api::control::{PersistenceHealth, PoolState};
use aircheck_common::config::{PoolConfig, RetryConfig, TransactionConfig};

use monitor::{TransactionMonitor, TransactionStatus, TxGuard};
use patterns::ErrorPatternTable;

/// PostgreSQL client for the orchestrator control plane.
///
/// Owns the connection pool, the transaction monitor, and the error-pattern
/// table. All database access in the orchestrator goes through this type;
/// component instances receive it as an explicit `Arc<Db>` handle.
pub struct Db {
    // Swappable so the pool can be rebuilt after persistent unavailability.
    pool: RwLock<PgPool>,
    database_url: String,
    pool_config: PoolConfig,
    retry_config: RetryConfig,
    monitor: Arc<TransactionMonitor>,
    patterns: ErrorPatternTable,
    acquires_total: AtomicU64,
    acquire_failures: AtomicU64,
    acquire_total_ms: AtomicU64,
    acquire_max_ms: AtomicU64,
    deadlock_count: AtomicU64,
    retry_count: AtomicU64,
}

impl Db {
    /// Connect to PostgreSQL with exponential backoff on startup.
    pub async fn connect(
        database_url: &str,
        pool_config: PoolConfig,
        retry_config: RetryConfig,
        tx_config: &TransactionConfig,
    ) -> Result<Self, DbError> {
        tracing::info!(
            min = pool_config.min,
            max = pool_config.max,
            "Connecting to PostgreSQL"
        );

        let mut backoff = Duration::from_millis(500);
        let mut attempt = 1u32;
        let pool = loop {
            match build_pool(database_url, &pool_config).await {
                Ok(pool) => break pool,
                Err(e) if attempt < 5 => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        delay_ms = backoff.as_millis() as u64,
                        "PostgreSQL connection failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(10));
                    attempt += 1;
                }
                Err(e) => return Err(DbError::Connection(e.to_string())),
            }
        };

        let db = Self {
            pool: RwLock::new(pool),
            database_url: database_url.to_string(),
            pool_config,
            retry_config,
            monitor: Arc::new(TransactionMonitor::new(Duration::from_secs(
                tx_config.timeout_threshold_seconds,
            ))),
            patterns: ErrorPatternTable::new(),
            acquires_total: AtomicU64::new(0),
            acquire_failures: AtomicU64::new(0),
            acquire_total_ms: AtomicU64::new(0),
            acquire_max_ms: AtomicU64::new(0),
            deadlock_count: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
        };

        db.health_check().await?;
        tracing::info!("PostgreSQL connection established");
        Ok(db)
    }

    /// Verify the connection is alive.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool())
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), DbError> {
        tracing::info!("Running PostgreSQL migrations");

        sqlx::migrate!("src/db/migrations")
            .run(&self.pool())
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;

        tracing::info!("PostgreSQL migrations complete");
        Ok(())
    }

    /// Get a clone of the current connection pool.
    pub fn pool(&self) -> PgPool {
        self.pool.read().expect("pool lock poisoned").clone()
    }

    /// The transaction monitor, for wiring the watchdog task.
    pub fn monitor(&self) -> &Arc<TransactionMonitor> {
        &self.monitor
    }

    /// Rebuild the pool after it reports closed or persistently unavailable.
    pub async fn recreate_pool(&self) -> Result<(), DbError> {
        tracing::warn!("Recreating PostgreSQL connection pool");

        let fresh = build_pool(&self.database_url, &self.pool_config)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let old = {
            let mut slot = self.pool.write().expect("pool lock poisoned");
            std::mem::replace(&mut *slot, fresh)
        };
        old.close().await;

        metrics::counter!("orchestrator.db.pool_recreated").increment(1);
        tracing::info!("PostgreSQL connection pool recreated");
        Ok(())
    }

    /// Acquire a pooled connection. The connection returns to the pool when
    /// the handle drops, on every exit path. The label identifies the call
    /// site for diagnostics.
    pub async fn acquire(&self, label: &str) -> Result<PoolConnection<Postgres>, DbError> {
        let started = Instant::now();
        match self.pool().acquire().await {
            Ok(conn) => {
                self.note_acquire(started.elapsed(), true);
                Ok(conn)
            }
            Err(e) => {
                self.note_acquire(started.elapsed(), false);
                let err = DbError::from_sqlx(e);
                self.patterns.record(label, &err);
                Err(err)
            }
        }
    }

    /// Begin a monitored transaction. Commit explicitly with
    /// [`ScopedTx::commit`]; a handle dropped without committing (including
    /// on `?` early returns) rolls the transaction back and ledgers it as
    /// rolled back.
    pub async fn begin(&self, label: &str) -> Result<ScopedTx<'_>, DbError> {
        let started = Instant::now();
        let tx = match self.pool().begin().await {
            Ok(tx) => {
                self.note_acquire(started.elapsed(), true);
                tx
            }
            Err(e) => {
                self.note_acquire(started.elapsed(), false);
                let err = DbError::from_sqlx(e);
                self.patterns.record(label, &err);
                return Err(err);
            }
        };

        Ok(ScopedTx {
            db: self,
            tx: Some(tx),
            guard: Some(self.monitor.begin(label)),
        })
    }

    /// Full health snapshot for the /status endpoint.
    pub fn health_snapshot(&self) -> PersistenceHealth {
        let pool = self.pool();
        let total = self.acquires_total.load(Ordering::Relaxed);
        let failures = self.acquire_failures.load(Ordering::Relaxed);

        PersistenceHealth {
            pool: PoolState {
                size: pool.size(),
                idle: pool.num_idle(),
                min: self.pool_config.min,
                max: self.pool_config.max,
            },
            acquires_total: total,
            acquire_failures: failures,
            success_rate: (total.saturating_sub(failures)) as f64 / total.max(1) as f64 * 100.0,
            avg_acquire_ms: self.acquire_total_ms.load(Ordering::Relaxed) as f64
                / total.max(1) as f64,
            max_acquire_ms: self.acquire_max_ms.load(Ordering::Relaxed),
            deadlock_count: self.deadlock_count.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            active_transactions: self.monitor.active_snapshot(),
            error_patterns: self.patterns.top(10),
        }
    }

    pub(crate) fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    pub(crate) fn record_error(&self, label: &str, err: &DbError) {
        self.patterns.record(label, err);
    }

    pub(crate) fn note_deadlock(&self) {
        self.deadlock_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("orchestrator.db.deadlocks").increment(1);
    }

    pub(crate) fn note_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("orchestrator.db.retries").increment(1);
    }

    fn note_acquire(&self, elapsed: Duration, success: bool) {
        let ms = elapsed.as_millis() as u64;
        self.acquires_total.fetch_add(1, Ordering::Relaxed);
        self.acquire_total_ms.fetch_add(ms, Ordering::Relaxed);
        self.acquire_max_ms.fetch_max(ms, Ordering::Relaxed);
        if !success {
            self.acquire_failures.fetch_add(1, Ordering::Relaxed);
        }
        metrics::histogram!("orchestrator.db.acquire_ms").record(ms as f64);
    }
}

/// A monitored transaction scope.
///
/// Dropping the scope without committing rolls back: the underlying sqlx
/// transaction rolls back on drop, and the monitor guard ledgers the
/// transaction as rolled back.
pub struct ScopedTx<'d> {
    db: &'d Db,
    tx: Option<Transaction<'static, Postgres>>,
    guard: Option<TxGuard>,
}

impl ScopedTx<'_> {
    /// The transaction's connection, for executing statements.
    pub fn conn(&mut self) -> &mut PgConnection {
        self.tx.as_mut().expect("transaction already completed")
    }

    /// Record one executed statement against the monitor ledger.
    pub fn note_query(&self) {
        if let Some(guard) = &self.guard {
            guard.note_query();
        }
    }

    /// Commit. A transaction the watchdog marked for forced abort is rolled
    /// back instead and surfaces as a retryable error.
    pub async fn commit(mut self) -> Result<(), DbError> {
        let tx = self.tx.take().expect("transaction already completed");
        let guard = self.guard.take().expect("transaction already completed");
        let label = guard.label().to_string();

        if guard.is_marked_for_abort() {
            let _ = tx.rollback().await;
            guard.complete(TransactionStatus::Timeout);
            let err = DbError::TxAborted(format!("{label} exceeded the transaction deadline"));
            self.db.patterns.record(&label, &err);
            return Err(err);
        }

        match tx.commit().await {
            Ok(()) => {
                guard.complete(TransactionStatus::Committed);
                Ok(())
            }
            Err(e) => {
                let err = DbError::from_sqlx(e);
                guard.complete(completion_status(&err));
                self.db.patterns.record(&label, &err);
                Err(err)
            }
        }
    }

    /// Explicit rollback, for paths that abandon the work without an error.
    pub async fn rollback(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.rollback().await;
        }
        if let Some(guard) = self.guard.take() {
            guard.complete(TransactionStatus::RolledBack);
        }
    }
}

/// Build a pool whose connections carry the session limits from `cfg` and
/// pass a liveness probe before being handed out.
async fn build_pool(database_url: &str, cfg: &PoolConfig) -> Result<PgPool, sqlx::Error> {
    let statement_timeout = cfg.statement_timeout_ms;
    let lock_timeout = cfg.lock_timeout_ms;
    let idle_in_tx_timeout = cfg.idle_in_tx_timeout_ms;

    PgPoolOptions::new()
        .min_connections(cfg.min)
        .max_connections(cfg.max)
        .acquire_timeout(Duration::from_millis(cfg.connect_timeout_ms))
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                // SET does not take bind parameters.
                for stmt in [
                    format!("SET statement_timeout = '{statement_timeout}'"),
                    format!("SET lock_timeout = '{lock_timeout}'"),
                    format!("SET idle_in_transaction_session_timeout = '{idle_in_tx_timeout}'"),
                    "SET application_name = 'aircheck_orchestrator'".to_string(),
                ] {
                    sqlx::query(&stmt).execute(&mut *conn).await?;
                }
                sqlx::query("SELECT 1").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}

fn completion_status(err: &DbError) -> TransactionStatus {
    if retry::is_deadlock(err) {
        TransactionStatus::Deadlock
    } else {
        TransactionStatus::RolledBack
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("PostgreSQL connection error: {0}")]
    Connection(String),

    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("PostgreSQL query error: {0}")]
    Query(String),

    #[error("PostgreSQL migration error: {0}")]
    Migration(String),

    #[error("transaction aborted: {0}")]
    TxAborted(String),

    #[error("row conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl DbError {
    pub fn from_sqlx(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted(e.to_string()),
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Protocol(_) => {
                Self::Connection(e.to_string())
            }
            sqlx::Error::RowNotFound => Self::NotFound(e.to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                Self::Conflict(e.to_string())
            }
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23503") => {
                Self::NotFound(e.to_string())
            }
            _ => Self::Query(e.to_string()),
        }
    }
}

impl From<DbError> for aircheck_common::OrchestratorError {
    fn from(e: DbError) -> Self {
        use aircheck_common::OrchestratorError;

        match &e {
            DbError::NotFound(msg) => OrchestratorError::NotFound(msg.clone()),
            DbError::Conflict(msg) => OrchestratorError::AlreadyAssigned(msg.clone()),
            DbError::Connection(_) | DbError::PoolExhausted(_) | DbError::TxAborted(_) => {
                OrchestratorError::Unavailable(e.to_string())
            }
            DbError::Query(msg) if retry::is_retryable_message(msg) => {
                OrchestratorError::Unavailable(e.to_string())
            }
            DbError::Query(_) | DbError::Migration(_) => {
                OrchestratorError::Internal(e.to_string())
            }
        }
    }
}
