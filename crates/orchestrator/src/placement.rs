//! Stream placement and load rebalancing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use aircheck_common::error::{OrchestratorError, Result};
use aircheck_common::ids::{StreamId, WorkerId};
use aircheck_common::types::RebalanceKind;

use crate::assignments;
use crate::db::{Db, DbError};

pub struct Placement {
    db: Arc<Db>,
    heartbeat_timeout: chrono::Duration,
    imbalance_threshold: f64,
}

/// What a full rebalance changed.
#[derive(Debug, Default)]
pub struct RebalanceSummary {
    pub streams_moved: usize,
    pub instances_affected: usize,
}

enum AssignOutcome {
    Assigned(Vec<StreamId>),
    NotFound,
    Inactive,
    NoCapacity,
}

impl Placement {
    pub fn new(db: Arc<Db>, heartbeat_timeout_seconds: u64, imbalance_threshold: f64) -> Self {
        Self {
            db,
            heartbeat_timeout: chrono::Duration::seconds(heartbeat_timeout_seconds as i64),
            imbalance_threshold,
        }
    }

    fn freshness_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.heartbeat_timeout
    }

    /// Hand out up to `requested` available streams to an active worker.
    ///
    /// The worker row is locked first, so concurrent requests for the same
    /// worker serialise; concurrent requests for the same stream are decided
    /// by the unique active-assignment index.
    pub async fn assign_to(&self, worker_id: &WorkerId, requested: u32) -> Result<Vec<StreamId>> {
        if requested == 0 {
            return Ok(Vec::new());
        }

        let attempts = self.db.retry_config().max_attempts;
        let outcome = self
            .db
            .execute_with_retry("placement.assign_to", attempts, || async move {
                let mut tx = self.db.begin("placement.assign_to").await?;

                let row: Option<(i32, i32, String)> = sqlx::query_as(
                    r#"
                    SELECT capacity, load, status
                    FROM orchestrator_instances
                    WHERE id = $1
                    FOR UPDATE
                    "#,
                )
                .bind(worker_id.as_str())
                .fetch_optional(tx.conn())
                .await
                .map_err(DbError::from_sqlx)?;
                tx.note_query();

                let (capacity, load, status) = match row {
                    Some(row) => row,
                    None => return Ok(AssignOutcome::NotFound),
                };
                if status != "active" {
                    return Ok(AssignOutcome::Inactive);
                }

                let slots = capacity - load;
                if slots <= 0 {
                    return Ok(AssignOutcome::NoCapacity);
                }

                let want = (slots as u32).min(requested) as i64;
                let chosen = assignments::available_streams(tx.conn(), Some(want)).await?;
                tx.note_query();

                for stream_id in &chosen {
                    assignments::insert_active(tx.conn(), *stream_id, worker_id).await?;
                    tx.note_query();
                }
                if !chosen.is_empty() {
                    assignments::increment_load(tx.conn(), worker_id, chosen.len() as i32).await?;
                    tx.note_query();
                }

                tx.commit().await?;
                Ok(AssignOutcome::Assigned(chosen))
            })
            .await?;

        match outcome {
            AssignOutcome::Assigned(streams) => {
                tracing::info!(
                    worker_id = %worker_id,
                    count = streams.len(),
                    "Streams assigned"
                );
                metrics::counter!("orchestrator.placement.assigned")
                    .increment(streams.len() as u64);
                Ok(streams)
            }
            AssignOutcome::NotFound => Err(OrchestratorError::NotFound(format!(
                "worker {worker_id} was never registered"
            ))),
            AssignOutcome::Inactive => Err(OrchestratorError::Inactive(format!(
                "worker {worker_id} is not active"
            ))),
            AssignOutcome::NoCapacity => Err(OrchestratorError::NoCapacity(format!(
                "worker {worker_id} is at capacity"
            ))),
        }
    }

    /// Release the given streams from a worker. Streams it does not hold are
    /// silently skipped, so releases are idempotent.
    pub async fn release(
        &self,
        worker_id: &WorkerId,
        stream_ids: &[StreamId],
    ) -> Result<Vec<StreamId>> {
        if stream_ids.is_empty() {
            return Ok(Vec::new());
        }

        let attempts = self.db.retry_config().max_attempts;
        let released = self
            .db
            .execute_with_retry("placement.release", attempts, || async move {
                let mut tx = self.db.begin("placement.release").await?;
                let released = assignments::release_many(tx.conn(), worker_id, stream_ids).await?;
                tx.note_query();
                tx.commit().await?;
                Ok(released)
            })
            .await?;

        tracing::info!(
            worker_id = %worker_id,
            count = released.len(),
            "Streams released"
        );
        metrics::counter!("orchestrator.placement.released").increment(released.len() as u64);
        Ok(released)
    }

    /// After a successful first-time registration, run a full rebalance when
    /// the most loaded worker sits more than the threshold above the mean.
    /// Returns whether a rebalance ran.
    pub async fn maybe_rebalance_after_register(&self, new_worker: &WorkerId) -> Result<bool> {
        let cutoff = self.freshness_cutoff();
        let loads = self.active_loads(cutoff).await?;

        let others: Vec<i32> = loads
            .iter()
            .filter(|(id, _)| id != new_worker)
            .map(|(_, load)| *load)
            .collect();
        let total: i64 = loads.iter().map(|(_, load)| *load as i64).sum();

        if loads.len() <= 1 || total == 0 {
            return Ok(false);
        }

        let mean = total as f64 / loads.len() as f64;
        let max_other = others.iter().copied().max().unwrap_or(0);

        if (max_other as f64) > mean * (1.0 + self.imbalance_threshold) {
            tracing::info!(
                new_worker = %new_worker,
                max_load = max_other,
                mean_load = mean,
                "Registration triggered automatic rebalance"
            );
            self.rebalance_all(&format!("worker registered: {new_worker}"))
                .await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Periodic imbalance evaluation, same criterion as the registration
    /// trigger but over the whole active fleet.
    pub async fn evaluate_imbalance(&self) -> Result<bool> {
        let loads = self.active_loads(self.freshness_cutoff()).await?;
        let plain: Vec<i32> = loads.iter().map(|(_, load)| *load).collect();

        if !is_imbalanced(&plain, self.imbalance_threshold) {
            return Ok(false);
        }

        tracing::info!("Periodic evaluation found load imbalance");
        self.rebalance_all("periodic imbalance evaluation").await?;
        Ok(true)
    }

    /// Redistribute every active assignment across the active fleet in
    /// capacity-weighted proportion. Loads are recomputed from the table
    /// afterwards, so the totals are preserved.
    pub async fn rebalance_all(&self, reason: &str) -> Result<RebalanceSummary> {
        let cutoff = self.freshness_cutoff();

        let attempts = self.db.retry_config().max_attempts;
        let summary = self
            .db
            .execute_with_retry("placement.rebalance_all", attempts, || async move {
                let mut tx = self.db.begin("placement.rebalance_all").await?;

                // Lock worker rows in id order before touching assignment
                // rows.
                let workers: Vec<(String, i32)> = sqlx::query_as(
                    r#"
                    SELECT id, capacity
                    FROM orchestrator_instances
                    WHERE status = 'active' AND last_heartbeat > $1
                    ORDER BY id
                    FOR UPDATE
                    "#,
                )
                .bind(cutoff)
                .fetch_all(tx.conn())
                .await
                .map_err(DbError::from_sqlx)?;
                tx.note_query();

                if workers.is_empty() {
                    tracing::warn!("No active workers to rebalance onto");
                    tx.rollback().await;
                    return Ok(RebalanceSummary::default());
                }

                let current = assignments::list_active(tx.conn()).await?;
                tx.note_query();
                if current.is_empty() {
                    tx.rollback().await;
                    return Ok(RebalanceSummary::default());
                }

                let total_capacity: i64 = workers.iter().map(|(_, c)| *c as i64).sum();
                if current.len() as i64 > total_capacity {
                    tracing::error!(
                        streams = current.len(),
                        total_capacity,
                        "Active streams exceed fleet capacity, refusing to rebalance"
                    );
                    tx.rollback().await;
                    return Ok(RebalanceSummary::default());
                }

                let capacities: Vec<(WorkerId, i32)> = workers
                    .iter()
                    .map(|(id, cap)| (WorkerId(id.clone()), *cap))
                    .collect();
                let targets = compute_targets(&capacities, current.len());

                sqlx::query("DELETE FROM orchestrator_stream_assignments WHERE status = 'active'")
                    .execute(tx.conn())
                    .await
                    .map_err(DbError::from_sqlx)?;
                tx.note_query();

                // Walk the streams in stable order, filling each worker up
                // to its target.
                let old: HashMap<StreamId, WorkerId> = current.iter().cloned().collect();
                let mut stream_iter = current.iter().map(|(s, _)| *s);
                let mut moved = 0usize;
                let mut affected = 0usize;

                for (worker_id, target) in &targets {
                    let mut changed = false;
                    for _ in 0..*target {
                        let Some(stream_id) = stream_iter.next() else {
                            break;
                        };
                        assignments::insert_active(tx.conn(), stream_id, worker_id).await?;
                        tx.note_query();
                        if old.get(&stream_id) != Some(worker_id) {
                            moved += 1;
                            changed = true;
                        }
                    }
                    if changed {
                        affected += 1;
                    }
                }

                assignments::recount_all_loads(tx.conn()).await?;
                tx.note_query();

                tx.commit().await?;
                Ok(RebalanceSummary {
                    streams_moved: moved,
                    instances_affected: affected,
                })
            })
            .await?;

        if summary.streams_moved > 0 || summary.instances_affected > 0 {
            self.record_history(RebalanceKind::Full, reason, &summary).await;
        }

        tracing::info!(
            streams_moved = summary.streams_moved,
            instances_affected = summary.instances_affected,
            reason,
            "Full rebalance complete"
        );
        metrics::counter!("orchestrator.placement.rebalances").increment(1);

        Ok(summary)
    }

    /// Append a rebalance-history row. History is informational; a write
    /// failure is logged and swallowed.
    pub async fn record_history(
        &self,
        kind: RebalanceKind,
        reason: &str,
        summary: &RebalanceSummary,
    ) {
        let result = async {
            let mut conn = self.db.acquire("placement.record_history").await?;
            assignments::record_rebalance(
                &mut conn,
                kind,
                reason,
                summary.streams_moved as i32,
                summary.instances_affected as i32,
            )
            .await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to record rebalance history");
        }
    }

    async fn active_loads(&self, cutoff: DateTime<Utc>) -> Result<Vec<(WorkerId, i32)>> {
        let mut conn = self
            .db
            .acquire("placement.active_loads")
            .await
            .map_err(OrchestratorError::from)?;

        let rows: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT id, load
            FROM orchestrator_instances
            WHERE status = 'active' AND last_heartbeat > $1
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| OrchestratorError::from(DbError::from_sqlx(e)))?;

        Ok(rows.into_iter().map(|(id, load)| (WorkerId(id), load)).collect())
    }
}

/// True when the most loaded worker sits more than `threshold` above the
/// fleet mean. A single worker or an idle fleet is never imbalanced.
pub fn is_imbalanced(loads: &[i32], threshold: f64) -> bool {
    if loads.len() <= 1 {
        return false;
    }
    let total: i64 = loads.iter().map(|&l| l as i64).sum();
    if total == 0 {
        return false;
    }
    let mean = total as f64 / loads.len() as f64;
    let max = loads.iter().copied().max().unwrap_or(0);
    (max as f64) > mean * (1.0 + threshold)
}

/// Capacity-proportional targets for `total_streams` across `workers`.
///
/// Each worker gets the floor of its proportional share, capped at its
/// capacity; the remainder goes to the workers with the largest fractional
/// share (ties broken by position) that still have room. The result sums to
/// `total_streams` whenever the fleet has the capacity for it, and never
/// exceeds any worker's capacity.
pub fn compute_targets(workers: &[(WorkerId, i32)], total_streams: usize) -> Vec<(WorkerId, usize)> {
    let total_capacity: i64 = workers.iter().map(|(_, c)| *c as i64).sum();
    if total_capacity == 0 || total_streams == 0 {
        return workers.iter().map(|(id, _)| (id.clone(), 0)).collect();
    }

    let mut targets: Vec<usize> = Vec::with_capacity(workers.len());
    let mut fractions: Vec<(usize, f64)> = Vec::with_capacity(workers.len());

    for (index, (_, capacity)) in workers.iter().enumerate() {
        let share = total_streams as f64 * (*capacity as f64) / total_capacity as f64;
        let floor = (share.floor() as usize).min(*capacity as usize);
        targets.push(floor);
        fractions.push((index, share - share.floor()));
    }

    let assigned: usize = targets.iter().sum();
    let mut remainder = total_streams.saturating_sub(assigned);

    // Largest fractional shares first, then round-robin over anyone with room.
    fractions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    while remainder > 0 {
        let mut placed = false;
        for &(index, _) in &fractions {
            if remainder == 0 {
                break;
            }
            if targets[index] < workers[index].1 as usize {
                targets[index] += 1;
                remainder -= 1;
                placed = true;
            }
        }
        if !placed {
            break;
        }
    }

    workers
        .iter()
        .zip(targets)
        .map(|((id, _), target)| (id.clone(), target))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, capacity: i32) -> (WorkerId, i32) {
        (WorkerId::new(id), capacity)
    }

    #[test]
    fn test_targets_preserve_total() {
        let workers = vec![worker("w1", 20), worker("w2", 20), worker("w3", 20)];

        for total in [0, 1, 7, 22, 59, 60] {
            let targets = compute_targets(&workers, total);
            let sum: usize = targets.iter().map(|(_, t)| t).sum();
            assert_eq!(sum, total, "total {total} not preserved");
        }
    }

    #[test]
    fn test_targets_respect_capacity() {
        let workers = vec![worker("w1", 4), worker("w2", 4), worker("w3", 4)];
        let targets = compute_targets(&workers, 11);

        for (id, target) in &targets {
            assert!(*target <= 4, "{id} over capacity with {target}");
        }
        let sum: usize = targets.iter().map(|(_, t)| t).sum();
        assert_eq!(sum, 11);
    }

    #[test]
    fn test_targets_are_proportional() {
        let workers = vec![worker("big", 30), worker("small", 10)];
        let targets = compute_targets(&workers, 20);

        assert_eq!(targets[0].1, 15);
        assert_eq!(targets[1].1, 5);
    }

    #[test]
    fn test_equal_fleet_deviates_by_at_most_one() {
        // 22 streams over four equal workers must land as 6/6/5/5.
        let workers = vec![
            worker("w1", 20),
            worker("w2", 20),
            worker("w3", 20),
            worker("w4", 20),
        ];
        let targets = compute_targets(&workers, 22);

        let mut counts: Vec<usize> = targets.iter().map(|(_, t)| *t).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![5, 5, 6, 6]);
    }

    #[test]
    fn test_zero_capacity_worker_gets_nothing() {
        let workers = vec![worker("w1", 0), worker("w2", 10)];
        let targets = compute_targets(&workers, 8);

        assert_eq!(targets[0].1, 0);
        assert_eq!(targets[1].1, 8);
    }

    #[test]
    fn test_overfull_fleet_caps_at_capacity() {
        let workers = vec![worker("w1", 3), worker("w2", 3)];
        let targets = compute_targets(&workers, 10);

        let sum: usize = targets.iter().map(|(_, t)| t).sum();
        assert_eq!(sum, 6);
    }

    #[test]
    fn test_imbalance_detection() {
        assert!(is_imbalanced(&[18, 2, 2], 0.20));
        assert!(!is_imbalanced(&[8, 7, 7], 0.20));
        assert!(!is_imbalanced(&[5], 0.20));
        assert!(!is_imbalanced(&[0, 0, 0], 0.20));
        // Exactly at the threshold does not trigger.
        assert!(!is_imbalanced(&[6, 4], 0.20));
    }
}
