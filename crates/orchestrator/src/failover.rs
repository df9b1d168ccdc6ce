//! Orphaned-assignment detection and re-homing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use aircheck_common::error::Result;
use aircheck_common::ids::{StreamId, WorkerId};
use aircheck_common::types::RebalanceKind;

use crate::assignments;
use crate::db::{Db, DbError};

pub struct FailoverController {
    db: Arc<Db>,
    heartbeat_timeout: chrono::Duration,
}

/// What one failover cycle did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FailoverSummary {
    pub orphaned: usize,
    pub reassigned: usize,
    pub left_unassigned: usize,
}

/// A worker able to take re-homed streams, with its projected free slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub worker_id: WorkerId,
    pub remaining: i32,
}

impl FailoverController {
    pub fn new(db: Arc<Db>, heartbeat_timeout_seconds: u64) -> Self {
        Self {
            db,
            heartbeat_timeout: chrono::Duration::seconds(heartbeat_timeout_seconds as i64),
        }
    }

    fn freshness_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.heartbeat_timeout
    }

    /// One sweep: delete every active assignment whose worker is gone,
    /// inactive, or stale; repair the evicted workers' loads; spread the
    /// orphaned streams round-robin over the active fleet. Streams that fit
    /// nowhere keep an `unassigned` audit row until capacity appears.
    pub async fn run_cycle(&self) -> Result<FailoverSummary> {
        let cutoff = self.freshness_cutoff();
        let attempts = self.db.retry_config().max_attempts;

        let summary = self
            .db
            .execute_with_retry("failover.cycle", attempts, || async move {
                let mut tx = self.db.begin("failover.cycle").await?;

                // Lock every worker row first (stable id order), then touch
                // assignment rows.
                let workers: Vec<(String, i32, i32, String, DateTime<Utc>)> = sqlx::query_as(
                    r#"
                    SELECT id, capacity, load, status, last_heartbeat
                    FROM orchestrator_instances
                    ORDER BY id
                    FOR UPDATE
                    "#,
                )
                .fetch_all(tx.conn())
                .await
                .map_err(DbError::from_sqlx)?;
                tx.note_query();

                let orphans: Vec<(i32, String)> = sqlx::query_as(
                    r#"
                    SELECT a.stream_id, a.worker_id
                    FROM orchestrator_stream_assignments a
                    LEFT JOIN orchestrator_instances i ON a.worker_id = i.id
                    WHERE a.status = 'active'
                      AND (i.id IS NULL OR i.status <> 'active' OR i.last_heartbeat < $1)
                    ORDER BY a.stream_id
                    "#,
                )
                .bind(cutoff)
                .fetch_all(tx.conn())
                .await
                .map_err(DbError::from_sqlx)?;
                tx.note_query();

                if orphans.is_empty() {
                    tx.rollback().await;
                    return Ok(FailoverSummary::default());
                }

                let orphan_streams: Vec<StreamId> =
                    orphans.iter().map(|(s, _)| StreamId(*s)).collect();
                let evicted: Vec<WorkerId> = {
                    let mut ids: Vec<WorkerId> =
                        orphans.iter().map(|(_, w)| WorkerId(w.clone())).collect();
                    ids.sort();
                    ids.dedup();
                    ids
                };
                tracing::warn!(
                    count = orphan_streams.len(),
                    workers = ?evicted,
                    "Orphaned assignments detected"
                );

                let ids: Vec<i32> = orphan_streams.iter().map(|s| s.0).collect();
                sqlx::query(
                    r#"
                    DELETE FROM orchestrator_stream_assignments
                    WHERE stream_id = ANY($1) AND status = 'active'
                    "#,
                )
                .bind(&ids)
                .execute(tx.conn())
                .await
                .map_err(DbError::from_sqlx)?;
                tx.note_query();

                for worker_id in &evicted {
                    assignments::recount_worker_load(tx.conn(), worker_id).await?;
                    tx.note_query();
                }

                // Candidates ranked ascending by current load, then
                // descending by remaining capacity, so re-homing spreads
                // instead of piling onto one worker.
                let mut candidates: Vec<(Candidate, i32)> = workers
                    .iter()
                    .filter(|(_, _, _, status, heartbeat)| {
                        status == "active" && *heartbeat >= cutoff
                    })
                    .map(|(id, capacity, load, _, _)| {
                        (
                            Candidate {
                                worker_id: WorkerId(id.clone()),
                                remaining: capacity - load,
                            },
                            *load,
                        )
                    })
                    .filter(|(c, _)| c.remaining > 0)
                    .collect();
                candidates.sort_by(|(a, load_a), (b, load_b)| {
                    load_a.cmp(load_b).then(b.remaining.cmp(&a.remaining))
                });
                let candidates: Vec<Candidate> =
                    candidates.into_iter().map(|(c, _)| c).collect();

                let orphan_sources: HashMap<StreamId, WorkerId> = orphans
                    .iter()
                    .map(|(s, w)| (StreamId(*s), WorkerId(w.clone())))
                    .collect();
                let (placements, leftovers) = plan_redistribution(&orphan_streams, candidates);

                let mut per_worker: HashMap<&WorkerId, i32> = HashMap::new();
                for (stream_id, worker_id) in &placements {
                    assignments::insert_active(tx.conn(), *stream_id, worker_id).await?;
                    tx.note_query();
                    *per_worker.entry(worker_id).or_insert(0) += 1;
                }
                for (worker_id, count) in &per_worker {
                    assignments::increment_load(tx.conn(), worker_id, *count).await?;
                    tx.note_query();
                }

                for stream_id in &leftovers {
                    let evicted_from = orphan_sources
                        .get(stream_id)
                        .expect("leftover came from the orphan set");
                    assignments::insert_unassigned(tx.conn(), *stream_id, evicted_from).await?;
                    tx.note_query();
                }
                if !leftovers.is_empty() {
                    tracing::warn!(
                        count = leftovers.len(),
                        "No capacity for orphaned streams, left unassigned"
                    );
                }

                let summary = FailoverSummary {
                    orphaned: orphan_streams.len(),
                    reassigned: placements.len(),
                    left_unassigned: leftovers.len(),
                };

                if summary.reassigned > 0 {
                    assignments::record_rebalance(
                        tx.conn(),
                        RebalanceKind::Failover,
                        &format!("orphaned streams from {} workers", evicted.len()),
                        summary.reassigned as i32,
                        per_worker.len() as i32,
                    )
                    .await?;
                    tx.note_query();
                }

                tx.commit().await?;
                Ok(summary)
            })
            .await?;

        if summary.orphaned > 0 {
            tracing::info!(
                orphaned = summary.orphaned,
                reassigned = summary.reassigned,
                left_unassigned = summary.left_unassigned,
                "Failover cycle complete"
            );
            metrics::counter!("orchestrator.failover.orphans").increment(summary.orphaned as u64);
            metrics::counter!("orchestrator.failover.reassigned")
                .increment(summary.reassigned as u64);
        }
        metrics::gauge!("orchestrator.failover.unassigned").set(summary.left_unassigned as f64);

        Ok(summary)
    }
}

/// Spread `orphans` round-robin over `candidates`, consuming one projected
/// slot per placement. Saturated candidates are skipped; once every candidate
/// is saturated the rest of the orphans are returned as leftovers.
pub fn plan_redistribution(
    orphans: &[StreamId],
    mut candidates: Vec<Candidate>,
) -> (Vec<(StreamId, WorkerId)>, Vec<StreamId>) {
    let mut placements = Vec::new();
    let mut leftovers = Vec::new();

    if candidates.is_empty() {
        return (placements, orphans.to_vec());
    }

    let mut cursor = 0usize;
    'streams: for stream_id in orphans {
        let mut attempts = 0;
        while attempts < candidates.len() {
            let len = candidates.len();
            let candidate = &mut candidates[cursor];
            if candidate.remaining > 0 {
                candidate.remaining -= 1;
                placements.push((*stream_id, candidate.worker_id.clone()));
                cursor = (cursor + 1) % len;
                continue 'streams;
            }
            cursor = (cursor + 1) % len;
            attempts += 1;
        }
        leftovers.push(*stream_id);
    }

    (placements, leftovers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, remaining: i32) -> Candidate {
        Candidate {
            worker_id: WorkerId::new(id),
            remaining,
        }
    }

    fn streams(ids: &[i32]) -> Vec<StreamId> {
        ids.iter().map(|&i| StreamId(i)).collect()
    }

    #[test]
    fn test_round_robin_balances_placements() {
        let (placements, leftovers) = plan_redistribution(
            &streams(&[1, 2, 3, 4]),
            vec![candidate("w1", 5), candidate("w2", 5)],
        );

        assert!(leftovers.is_empty());
        let w1_count = placements.iter().filter(|(_, w)| w.as_str() == "w1").count();
        let w2_count = placements.iter().filter(|(_, w)| w.as_str() == "w2").count();
        assert_eq!(w1_count, 2);
        assert_eq!(w2_count, 2);
    }

    #[test]
    fn test_saturated_candidates_are_skipped() {
        let (placements, leftovers) = plan_redistribution(
            &streams(&[1, 2, 3]),
            vec![candidate("w1", 1), candidate("w2", 2)],
        );

        assert!(leftovers.is_empty());
        assert_eq!(placements.iter().filter(|(_, w)| w.as_str() == "w1").count(), 1);
        assert_eq!(placements.iter().filter(|(_, w)| w.as_str() == "w2").count(), 2);
    }

    #[test]
    fn test_overflow_is_left_unassigned() {
        let (placements, leftovers) = plan_redistribution(
            &streams(&[1, 2, 3, 4, 5]),
            vec![candidate("w1", 1), candidate("w2", 1)],
        );

        assert_eq!(placements.len(), 2);
        assert_eq!(leftovers, streams(&[3, 4, 5]));
    }

    #[test]
    fn test_no_candidates_leaves_everything() {
        let (placements, leftovers) = plan_redistribution(&streams(&[7, 8]), Vec::new());

        assert!(placements.is_empty());
        assert_eq!(leftovers, streams(&[7, 8]));
    }

    #[test]
    fn test_empty_orphans_is_a_no_op() {
        let (placements, leftovers) = plan_redistribution(&[], vec![candidate("w1", 3)]);

        assert!(placements.is_empty());
        assert!(leftovers.is_empty());
    }
}
