//! Authoritative lifecycle of worker instances.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;

use aircheck_common::api::control::{InstanceTotals, RegisterRequest};
use aircheck_common::error::{OrchestratorError, Result};
use aircheck_common::ids::{StreamId, WorkerId};
use aircheck_common::types::{parse_worker_status, ResourceMetrics, WorkerInstance, WorkerStatus};

use crate::assignments;
use crate::db::{Db, DbError};

/// How many available streams a re-registered worker is refilled with in the
/// registration transaction itself. Anything beyond this arrives through the
/// worker's normal assignment requests.
const REFILL_BATCH_LIMIT: i64 = 50;

/// Outcome of a registration.
#[derive(Debug)]
pub struct RegisterOutcome {
    pub reregistration: bool,
    /// Streams handed back immediately on the re-registration path.
    pub refilled: Vec<StreamId>,
}

pub struct WorkerRegistry {
    db: Arc<Db>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(db: Arc<Db>, heartbeat_timeout_seconds: u64) -> Self {
        Self {
            db,
            heartbeat_timeout: Duration::seconds(heartbeat_timeout_seconds as i64),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// The cutoff instant separating fresh heartbeats from stale ones.
    pub fn staleness_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.heartbeat_timeout
    }

    /// Upsert a worker as active with zero load. When the id already existed
    /// this is a re-registration: the worker's prior active assignments are
    /// released in the same transaction and up to a batch of available
    /// streams is handed straight back.
    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterOutcome> {
        if req.worker_id.as_str().is_empty() {
            return Err(OrchestratorError::Invalid("worker_id must not be empty".into()));
        }
        if req.capacity < 0 {
            return Err(OrchestratorError::Invalid(format!(
                "capacity must be >= 0, got {}",
                req.capacity
            )));
        }
        if !(0..=65535).contains(&req.port) {
            return Err(OrchestratorError::Invalid(format!(
                "port out of range: {}",
                req.port
            )));
        }

        let attempts = self.db.retry_config().max_attempts;
        let outcome = self
            .db
            .execute_with_retry("registry.register", attempts, || async move {
                let mut tx = self.db.begin("registry.register").await?;

                let existing: Option<(String,)> = sqlx::query_as(
                    "SELECT id FROM orchestrator_instances WHERE id = $1 FOR UPDATE",
                )
                .bind(req.worker_id.as_str())
                .fetch_optional(tx.conn())
                .await
                .map_err(DbError::from_sqlx)?;
                tx.note_query();

                let reregistration = existing.is_some();

                sqlx::query(
                    r#"
                    INSERT INTO orchestrator_instances
                        (id, address_host, address_port, capacity, load, status, registered_at, last_heartbeat)
                    VALUES ($1, $2, $3, $4, 0, 'active', now(), now())
                    ON CONFLICT (id) DO UPDATE SET
                        address_host = EXCLUDED.address_host,
                        address_port = EXCLUDED.address_port,
                        capacity = EXCLUDED.capacity,
                        load = 0,
                        status = 'active',
                        last_heartbeat = now()
                    "#,
                )
                .bind(req.worker_id.as_str())
                .bind(&req.host)
                .bind(req.port)
                .bind(req.capacity)
                .execute(tx.conn())
                .await
                .map_err(DbError::from_sqlx)?;
                tx.note_query();

                let mut refilled = Vec::new();
                if reregistration {
                    let released = assignments::release_all(tx.conn(), &req.worker_id).await?;
                    tx.note_query();
                    if released > 0 {
                        tracing::info!(
                            worker_id = %req.worker_id,
                            released,
                            "Re-registration released prior assignments"
                        );
                    }
                    refilled =
                        refill_reregistered(tx.conn(), &req.worker_id, req.capacity).await?;
                }

                tx.commit().await?;
                Ok(RegisterOutcome {
                    reregistration,
                    refilled,
                })
            })
            .await?;

        metrics::counter!("orchestrator.registry.registrations").increment(1);
        tracing::info!(
            worker_id = %req.worker_id,
            capacity = req.capacity,
            reregistration = outcome.reregistration,
            "Worker registered"
        );

        Ok(outcome)
    }

    /// Record a heartbeat: bump the timestamp, adopt the worker's
    /// self-reported load and status, and append a metrics sample when one
    /// was attached. Fails with `NotFound` for unregistered ids.
    pub async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
        load: i32,
        sample: Option<&ResourceMetrics>,
    ) -> Result<()> {
        let attempts = self.db.retry_config().max_attempts;
        let updated = self
            .db
            .execute_with_retry("registry.heartbeat", attempts, || async move {
                let mut conn = self.db.acquire("registry.heartbeat").await?;

                // GREATEST keeps last_heartbeat monotonic even if a delayed
                // retry lands after a newer heartbeat.
                let row: Option<(String,)> = sqlx::query_as(
                    r#"
                    UPDATE orchestrator_instances
                    SET last_heartbeat = GREATEST(last_heartbeat, now()),
                        load = $2,
                        status = $3
                    WHERE id = $1
                    RETURNING id
                    "#,
                )
                .bind(worker_id.as_str())
                .bind(load)
                .bind(status.as_db_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(DbError::from_sqlx)?;
                Ok(row.is_some())
            })
            .await?;

        if !updated {
            return Err(OrchestratorError::NotFound(format!(
                "worker {worker_id} was never registered"
            )));
        }

        // Metrics samples are display-only; a failed insert never fails the
        // heartbeat.
        if let Some(sample) = sample {
            if let Err(e) = self.insert_metrics(worker_id, sample).await {
                tracing::warn!(worker_id = %worker_id, error = %e, "Metrics sample insert failed");
            }
        }

        metrics::counter!("orchestrator.registry.heartbeats").increment(1);
        Ok(())
    }

    /// Flip active workers whose heartbeat predates `cutoff` to inactive.
    /// Returns the affected ids.
    pub async fn mark_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerId>> {
        let attempts = self.db.retry_config().max_attempts;
        let stale = self
            .db
            .execute_with_retry("registry.mark_stale", attempts, || async move {
                let mut conn = self.db.acquire("registry.mark_stale").await?;

                let rows: Vec<(String,)> = sqlx::query_as(
                    r#"
                    UPDATE orchestrator_instances
                    SET status = 'inactive'
                    WHERE status = 'active' AND last_heartbeat < $1
                    RETURNING id
                    "#,
                )
                .bind(cutoff)
                .fetch_all(&mut *conn)
                .await
                .map_err(DbError::from_sqlx)?;
                Ok(rows.into_iter().map(|(id,)| WorkerId(id)).collect::<Vec<_>>())
            })
            .await?;

        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), workers = ?stale, "Stale workers marked inactive");
            metrics::counter!("orchestrator.registry.stale_evictions")
                .increment(stale.len() as u64);
        }

        Ok(stale)
    }

    pub async fn get(&self, worker_id: &WorkerId) -> Result<WorkerInstance> {
        let mut conn = self.db.acquire("registry.get").await.map_err(db_err)?;

        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT id, address_host, address_port, capacity, load, status,
                   registered_at, last_heartbeat
            FROM orchestrator_instances
            WHERE id = $1
            "#,
        )
        .bind(worker_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| db_err(DbError::from_sqlx(e)))?;

        row.map(Into::into).ok_or_else(|| {
            OrchestratorError::NotFound(format!("worker {worker_id} was never registered"))
        })
    }

    pub async fn list(&self) -> Result<Vec<WorkerInstance>> {
        self.fetch_workers("registry.list", false).await
    }

    pub async fn list_active(&self) -> Result<Vec<WorkerInstance>> {
        self.fetch_workers("registry.list_active", true).await
    }

    async fn fetch_workers(&self, label: &str, active_only: bool) -> Result<Vec<WorkerInstance>> {
        let mut conn = self.db.acquire(label).await.map_err(db_err)?;

        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT id, address_host, address_port, capacity, load, status,
                   registered_at, last_heartbeat
            FROM orchestrator_instances
            WHERE $1 = false OR status = 'active'
            ORDER BY id
            "#,
        )
        .bind(active_only)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| db_err(DbError::from_sqlx(e)))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Fleet totals for the status endpoint.
    pub async fn totals(&self) -> Result<InstanceTotals> {
        let mut conn = self.db.acquire("registry.totals").await.map_err(db_err)?;

        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status = 'active'),
                   COALESCE(SUM(capacity) FILTER (WHERE status = 'active'), 0),
                   COALESCE(SUM(load) FILTER (WHERE status = 'active'), 0)
            FROM orchestrator_instances
            "#,
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| db_err(DbError::from_sqlx(e)))?;

        Ok(InstanceTotals {
            total: row.0,
            active: row.1,
            total_capacity: row.2,
            current_load: row.3,
        })
    }

    async fn insert_metrics(&self, worker_id: &WorkerId, sample: &ResourceMetrics) -> Result<()> {
        let mut conn = self.db.acquire("registry.insert_metrics").await.map_err(db_err)?;
        let load_avg = |i: usize| sample.load_average.get(i).copied();

        sqlx::query(
            r#"
            INSERT INTO orchestrator_instance_metrics
                (worker_id, cpu_percent, memory_percent, disk_percent,
                 load_avg_1m, load_avg_5m, load_avg_15m, uptime_seconds, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            "#,
        )
        .bind(worker_id.as_str())
        .bind(sample.cpu_percent)
        .bind(sample.memory_percent)
        .bind(sample.disk_percent)
        .bind(load_avg(0))
        .bind(load_avg(1))
        .bind(load_avg(2))
        .bind(sample.uptime_seconds)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_err(DbError::from_sqlx(e)))?;

        Ok(())
    }

    /// Reclaim worker rows kept only for audit: inactive, silent for ten
    /// heartbeat timeouts, and with no assignment rows of any status left.
    pub async fn remove_retired(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.heartbeat_timeout * 10;
        let mut conn = self.db.acquire("registry.remove_retired").await.map_err(db_err)?;

        let result = sqlx::query(
            r#"
            DELETE FROM orchestrator_instances i
            WHERE i.status = 'inactive'
              AND i.last_heartbeat < $1
              AND NOT EXISTS (
                  SELECT 1
                  FROM orchestrator_stream_assignments a
                  WHERE a.worker_id = i.id
              )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_err(DbError::from_sqlx(e)))?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(removed, "Retired worker rows reclaimed");
        }
        Ok(removed)
    }
}

fn db_err(e: DbError) -> OrchestratorError {
    e.into()
}

/// Refill a re-registered worker from the available pool, bounded by its
/// capacity and the refill batch limit.
async fn refill_reregistered(
    conn: &mut PgConnection,
    worker_id: &WorkerId,
    capacity: i32,
) -> std::result::Result<Vec<StreamId>, DbError> {
    if capacity <= 0 {
        return Ok(Vec::new());
    }

    let available = assignments::available_streams(conn, Some(REFILL_BATCH_LIMIT)).await?;
    let take = available.len().min(capacity as usize);
    let chosen = &available[..take];

    for stream_id in chosen {
        assignments::insert_active(conn, *stream_id, worker_id).await?;
    }
    if !chosen.is_empty() {
        assignments::increment_load(conn, worker_id, chosen.len() as i32).await?;
        tracing::info!(
            worker_id = %worker_id,
            count = chosen.len(),
            "Re-registered worker refilled immediately"
        );
    }

    Ok(chosen.to_vec())
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    address_host: String,
    address_port: i32,
    capacity: i32,
    load: i32,
    status: String,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl From<WorkerRow> for WorkerInstance {
    fn from(row: WorkerRow) -> Self {
        Self {
            id: WorkerId(row.id),
            host: row.address_host,
            port: row.address_port,
            capacity: row.capacity,
            load: row.load,
            status: parse_worker_status(&row.status),
            registered_at: row.registered_at,
            last_heartbeat: row.last_heartbeat,
        }
    }
}
