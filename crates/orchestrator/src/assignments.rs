//! Connection-level operations on the stream-assignment table.
//!
//! Every function takes `&mut PgConnection` so callers can compose several
//! of them inside one scoped transaction. Load counters on the worker rows
//! are adjusted here alongside the row changes that cause them.

use chrono::Utc;
use sqlx::PgConnection;

use aircheck_common::ids::{StreamId, WorkerId};
use aircheck_common::types::{parse_assignment_status, StreamAssignment};

use crate::db::DbError;

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct AssignmentRow {
    stream_id: i32,
    worker_id: String,
    assigned_at: chrono::DateTime<Utc>,
    status: String,
}

impl From<AssignmentRow> for StreamAssignment {
    fn from(row: AssignmentRow) -> Self {
        Self {
            stream_id: StreamId(row.stream_id),
            worker_id: WorkerId(row.worker_id),
            assigned_at: row.assigned_at,
            status: parse_assignment_status(&row.status),
        }
    }
}

/// All active assignments, ordered by stream id.
pub async fn list_active(
    conn: &mut PgConnection,
) -> Result<Vec<(StreamId, WorkerId)>, DbError> {
    let rows: Vec<(i32, String)> = sqlx::query_as(
        r#"
        SELECT stream_id, worker_id
        FROM orchestrator_stream_assignments
        WHERE status = 'active'
        ORDER BY stream_id
        "#,
    )
    .fetch_all(conn)
    .await
    .map_err(DbError::from_sqlx)?;

    Ok(rows
        .into_iter()
        .map(|(s, w)| (StreamId(s), WorkerId(w)))
        .collect())
}

/// Every assignment row regardless of status, ordered by stream id.
pub async fn list_all(conn: &mut PgConnection) -> Result<Vec<StreamAssignment>, DbError> {
    let rows = sqlx::query_as::<_, AssignmentRow>(
        r#"
        SELECT stream_id, worker_id, assigned_at, status
        FROM orchestrator_stream_assignments
        ORDER BY stream_id, assigned_at
        "#,
    )
    .fetch_all(conn)
    .await
    .map_err(DbError::from_sqlx)?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Active stream ids held by one worker, ordered ascending.
pub async fn list_active_by_worker(
    conn: &mut PgConnection,
    worker_id: &WorkerId,
) -> Result<Vec<StreamId>, DbError> {
    let rows: Vec<(i32,)> = sqlx::query_as(
        r#"
        SELECT stream_id
        FROM orchestrator_stream_assignments
        WHERE worker_id = $1 AND status = 'active'
        ORDER BY stream_id
        "#,
    )
    .bind(worker_id.as_str())
    .fetch_all(conn)
    .await
    .map_err(DbError::from_sqlx)?;

    Ok(rows.into_iter().map(|(s,)| StreamId(s)).collect())
}

/// Catalog streams with no active assignment, ascending id order.
/// The `streams` catalog is owned by an external system; only ids are read.
pub async fn available_streams(
    conn: &mut PgConnection,
    limit: Option<i64>,
) -> Result<Vec<StreamId>, DbError> {
    let rows: Vec<(i32,)> = sqlx::query_as(
        r#"
        SELECT s.id
        FROM streams s
        WHERE NOT EXISTS (
            SELECT 1
            FROM orchestrator_stream_assignments a
            WHERE a.stream_id = s.id AND a.status = 'active'
        )
        ORDER BY s.id
        LIMIT $1
        "#,
    )
    .bind(limit.unwrap_or(i64::MAX))
    .fetch_all(conn)
    .await
    .map_err(DbError::from_sqlx)?;

    Ok(rows.into_iter().map(|(s,)| StreamId(s)).collect())
}

/// Insert a fresh active row for `stream_id` pointing at `worker_id`.
///
/// Any stale non-active row for the stream is deleted first; the partial
/// unique index turns a concurrent placement race into a `Conflict`.
pub async fn insert_active(
    conn: &mut PgConnection,
    stream_id: StreamId,
    worker_id: &WorkerId,
) -> Result<(), DbError> {
    sqlx::query(
        "DELETE FROM orchestrator_stream_assignments WHERE stream_id = $1 AND status <> 'active'",
    )
    .bind(stream_id.0)
    .execute(&mut *conn)
    .await
    .map_err(DbError::from_sqlx)?;

    sqlx::query(
        r#"
        INSERT INTO orchestrator_stream_assignments (stream_id, worker_id, assigned_at, status)
        VALUES ($1, $2, now(), 'active')
        "#,
    )
    .bind(stream_id.0)
    .bind(worker_id.as_str())
    .execute(conn)
    .await
    .map_err(DbError::from_sqlx)?;

    Ok(())
}

/// Insert an `unassigned` audit row for a stream that lost its worker and
/// could not be re-homed this cycle.
pub async fn insert_unassigned(
    conn: &mut PgConnection,
    stream_id: StreamId,
    evicted_worker: &WorkerId,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO orchestrator_stream_assignments (stream_id, worker_id, assigned_at, status)
        VALUES ($1, $2, now(), 'unassigned')
        "#,
    )
    .bind(stream_id.0)
    .bind(evicted_worker.as_str())
    .execute(conn)
    .await
    .map_err(DbError::from_sqlx)?;

    Ok(())
}

/// Delete the given active rows of one worker and decrement its load by the
/// number actually deleted (floored at zero). Missing rows are skipped.
/// Returns the stream ids released.
pub async fn release_many(
    conn: &mut PgConnection,
    worker_id: &WorkerId,
    stream_ids: &[StreamId],
) -> Result<Vec<StreamId>, DbError> {
    if stream_ids.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i32> = stream_ids.iter().map(|s| s.0).collect();
    let released: Vec<(i32,)> = sqlx::query_as(
        r#"
        DELETE FROM orchestrator_stream_assignments
        WHERE worker_id = $1 AND stream_id = ANY($2) AND status = 'active'
        RETURNING stream_id
        "#,
    )
    .bind(worker_id.as_str())
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::from_sqlx)?;

    if !released.is_empty() {
        decrement_load(conn, worker_id, released.len() as i32).await?;
    }

    Ok(released.into_iter().map(|(s,)| StreamId(s)).collect())
}

/// Delete every active row of one worker and zero its load.
/// Returns the number of rows released.
pub async fn release_all(conn: &mut PgConnection, worker_id: &WorkerId) -> Result<u64, DbError> {
    let result = sqlx::query(
        "DELETE FROM orchestrator_stream_assignments WHERE worker_id = $1 AND status = 'active'",
    )
    .bind(worker_id.as_str())
    .execute(&mut *conn)
    .await
    .map_err(DbError::from_sqlx)?;

    sqlx::query("UPDATE orchestrator_instances SET load = 0 WHERE id = $1")
        .bind(worker_id.as_str())
        .execute(conn)
        .await
        .map_err(DbError::from_sqlx)?;

    Ok(result.rows_affected())
}

/// Flip every active row of one worker to `unassigned`, keeping the rows for
/// re-homing. Load repair is the caller's responsibility.
pub async fn mark_unassigned_by_worker(
    conn: &mut PgConnection,
    worker_id: &WorkerId,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE orchestrator_stream_assignments
        SET status = 'unassigned'
        WHERE worker_id = $1 AND status = 'active'
        "#,
    )
    .bind(worker_id.as_str())
    .execute(conn)
    .await
    .map_err(DbError::from_sqlx)?;

    Ok(result.rows_affected())
}

/// Flip one active row to `released` (duplicate resolution).
pub async fn mark_released(
    conn: &mut PgConnection,
    stream_id: StreamId,
    worker_id: &WorkerId,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE orchestrator_stream_assignments
        SET status = 'released'
        WHERE stream_id = $1 AND worker_id = $2 AND status = 'active'
        "#,
    )
    .bind(stream_id.0)
    .bind(worker_id.as_str())
    .execute(conn)
    .await
    .map_err(DbError::from_sqlx)?;

    Ok(result.rows_affected())
}

pub async fn increment_load(
    conn: &mut PgConnection,
    worker_id: &WorkerId,
    by: i32,
) -> Result<(), DbError> {
    sqlx::query("UPDATE orchestrator_instances SET load = load + $2 WHERE id = $1")
        .bind(worker_id.as_str())
        .bind(by)
        .execute(conn)
        .await
        .map_err(DbError::from_sqlx)?;
    Ok(())
}

pub async fn decrement_load(
    conn: &mut PgConnection,
    worker_id: &WorkerId,
    by: i32,
) -> Result<(), DbError> {
    sqlx::query("UPDATE orchestrator_instances SET load = GREATEST(0, load - $2) WHERE id = $1")
        .bind(worker_id.as_str())
        .bind(by)
        .execute(conn)
        .await
        .map_err(DbError::from_sqlx)?;
    Ok(())
}

/// Recompute one worker's load from its active rows (ground truth).
pub async fn recount_worker_load(
    conn: &mut PgConnection,
    worker_id: &WorkerId,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        UPDATE orchestrator_instances
        SET load = (
            SELECT COUNT(*)
            FROM orchestrator_stream_assignments
            WHERE worker_id = orchestrator_instances.id AND status = 'active'
        )
        WHERE id = $1
        "#,
    )
    .bind(worker_id.as_str())
    .execute(conn)
    .await
    .map_err(DbError::from_sqlx)?;
    Ok(())
}

/// Recompute every worker's load from the assignment table.
pub async fn recount_all_loads(conn: &mut PgConnection) -> Result<(), DbError> {
    sqlx::query(
        r#"
        UPDATE orchestrator_instances
        SET load = (
            SELECT COUNT(*)
            FROM orchestrator_stream_assignments
            WHERE worker_id = orchestrator_instances.id AND status = 'active'
        )
        "#,
    )
    .execute(conn)
    .await
    .map_err(DbError::from_sqlx)?;
    Ok(())
}

/// Catalog streams with no active assignment, counted without materialising
/// the id list.
pub async fn count_available(conn: &mut PgConnection) -> Result<i64, DbError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM streams s
        WHERE NOT EXISTS (
            SELECT 1
            FROM orchestrator_stream_assignments a
            WHERE a.stream_id = s.id AND a.status = 'active'
        )
        "#,
    )
    .fetch_one(conn)
    .await
    .map_err(DbError::from_sqlx)?;
    Ok(row.0)
}

pub async fn count_active(conn: &mut PgConnection) -> Result<i64, DbError> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM orchestrator_stream_assignments WHERE status = 'active'",
    )
    .fetch_one(conn)
    .await
    .map_err(DbError::from_sqlx)?;
    Ok(row.0)
}

/// Append one rebalance-history row.
pub async fn record_rebalance(
    conn: &mut PgConnection,
    kind: aircheck_common::types::RebalanceKind,
    reason: &str,
    streams_moved: i32,
    instances_affected: i32,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO orchestrator_rebalance_history (kind, reason, streams_moved, instances_affected, executed_at)
        VALUES ($1, $2, $3, $4, now())
        "#,
    )
    .bind(kind.as_db_str())
    .bind(reason)
    .bind(streams_moved)
    .bind(instances_affected)
    .execute(conn)
    .await
    .map_err(DbError::from_sqlx)?;
    Ok(())
}
