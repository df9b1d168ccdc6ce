//! Periodic verification that the assignment table matches reality, with
//! auto-repair of the drift it finds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use aircheck_common::error::Result;
use aircheck_common::ids::{StreamId, WorkerId};
use aircheck_common::types::{
    Anomaly, AnomalyKind, ConsistencyReport, Severity, WorkerInstance,
};

use crate::assignments;
use crate::db::{Db, DbError};
use crate::failover::FailoverController;
use crate::placement::Placement;
use crate::registry::WorkerRegistry;

/// Authoritative state read at the start of a cycle.
#[derive(Clone, Debug)]
pub struct FleetSnapshot {
    pub workers: Vec<WorkerInstance>,
    /// Active assignment rows only.
    pub assignments: Vec<(StreamId, WorkerId)>,
    pub taken_at: DateTime<Utc>,
}

struct WorkerReport {
    streams: Vec<StreamId>,
    reported_at: DateTime<Utc>,
}

struct ReconcilerState {
    history: VecDeque<ConsistencyReport>,
    /// Auto-repair attempts per issue key, pruned when the issue clears.
    attempts: HashMap<String, u32>,
    /// Self-reported stream sets from the diagnostic endpoint.
    worker_reports: HashMap<WorkerId, WorkerReport>,
}

pub struct Reconciler {
    db: Arc<Db>,
    registry: Arc<WorkerRegistry>,
    placement: Arc<Placement>,
    failover: Arc<FailoverController>,
    heartbeat_timeout: chrono::Duration,
    imbalance_threshold: f64,
    max_attempts_per_issue: u32,
    history_size: usize,
    // Never held across await points.
    state: Mutex<ReconcilerState>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Db>,
        registry: Arc<WorkerRegistry>,
        placement: Arc<Placement>,
        failover: Arc<FailoverController>,
        heartbeat_timeout_seconds: u64,
        imbalance_threshold: f64,
        max_attempts_per_issue: u32,
        history_size: usize,
    ) -> Self {
        Self {
            db,
            registry,
            placement,
            failover,
            heartbeat_timeout: chrono::Duration::seconds(heartbeat_timeout_seconds as i64),
            imbalance_threshold,
            max_attempts_per_issue,
            history_size,
            state: Mutex::new(ReconcilerState {
                history: VecDeque::new(),
                attempts: HashMap::new(),
                worker_reports: HashMap::new(),
            }),
        }
    }

    /// Record a worker's self-reported stream set from the diagnostic
    /// endpoint. Feeds `Unauthorized` detection on the next cycle.
    pub fn note_worker_report(&self, worker_id: &WorkerId, streams: Vec<StreamId>) {
        let mut state = self.state.lock().expect("reconciler lock poisoned");
        state.worker_reports.insert(
            worker_id.clone(),
            WorkerReport {
                streams,
                reported_at: Utc::now(),
            },
        );
    }

    pub fn last_report(&self) -> Option<ConsistencyReport> {
        let state = self.state.lock().expect("reconciler lock poisoned");
        state.history.back().cloned()
    }

    /// One full verify-and-repair cycle.
    pub async fn run_cycle(&self) -> Result<ConsistencyReport> {
        let snapshot = self.take_snapshot().await?;
        let cutoff = snapshot.taken_at - self.heartbeat_timeout;
        let reported = self.fresh_worker_reports(snapshot.taken_at);

        let anomalies = detect_all(&snapshot, cutoff, &reported, self.imbalance_threshold);
        let score = consistency_score(snapshot.assignments.len(), &anomalies);
        let recommendations = recommendations_for(&anomalies);

        let repaired = self.auto_repair(&snapshot, &anomalies).await;

        let report = ConsistencyReport {
            checked_at: snapshot.taken_at,
            total_streams_checked: snapshot.assignments.len(),
            total_workers_checked: snapshot.workers.len(),
            anomalies,
            consistency_score: score,
            recommendations,
            repaired,
        };

        tracing::info!(
            score = report.consistency_score,
            issues = report.anomalies.len(),
            repaired = report.repaired,
            "Consistency check complete"
        );
        metrics::gauge!("orchestrator.reconciler.score").set(report.consistency_score);
        metrics::gauge!("orchestrator.reconciler.issues").set(report.anomalies.len() as f64);

        // Worker rows kept only for audit are reclaimed here, not in the
        // hot paths.
        if let Err(e) = self.registry.remove_retired().await {
            tracing::warn!(error = %e, "Retired-worker reclaim failed");
        }

        self.store_report(report.clone());
        Ok(report)
    }

    async fn take_snapshot(&self) -> Result<FleetSnapshot> {
        // One transaction so workers and assignments are read at the same
        // point in time.
        let mut tx = self.db.begin("reconciler.snapshot").await.map_err(db_err)?;

        let workers: Vec<(String, String, i32, i32, i32, String, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT id, address_host, address_port, capacity, load, status,
                       registered_at, last_heartbeat
                FROM orchestrator_instances
                ORDER BY id
                "#,
            )
            .fetch_all(tx.conn())
            .await
            .map_err(|e| db_err(DbError::from_sqlx(e)))?;
        tx.note_query();

        let assignments = assignments::list_active(tx.conn()).await.map_err(db_err)?;
        tx.note_query();
        tx.rollback().await;

        let workers = workers
            .into_iter()
            .map(
                |(id, host, port, capacity, load, status, registered_at, last_heartbeat)| {
                    WorkerInstance {
                        id: WorkerId(id),
                        host,
                        port,
                        capacity,
                        load,
                        status: aircheck_common::types::parse_worker_status(&status),
                        registered_at,
                        last_heartbeat,
                    }
                },
            )
            .collect();

        Ok(FleetSnapshot {
            workers,
            assignments,
            taken_at: Utc::now(),
        })
    }

    /// Self-reports younger than the heartbeat timeout; stale ones are
    /// dropped so a dead worker's last report cannot poison detection.
    fn fresh_worker_reports(&self, now: DateTime<Utc>) -> HashMap<WorkerId, Vec<StreamId>> {
        let mut state = self.state.lock().expect("reconciler lock poisoned");
        let cutoff = now - self.heartbeat_timeout;
        state.worker_reports.retain(|_, r| r.reported_at >= cutoff);
        state
            .worker_reports
            .iter()
            .map(|(id, r)| (id.clone(), r.streams.clone()))
            .collect()
    }

    async fn auto_repair(&self, snapshot: &FleetSnapshot, anomalies: &[Anomaly]) -> usize {
        let mut repaired = 0usize;
        let mut rebalance_requested = false;
        let mut failover_requested = false;

        for anomaly in anomalies {
            let key = issue_key(anomaly);
            if !self.take_attempt(&key) {
                tracing::warn!(
                    issue = %key,
                    max_attempts = self.max_attempts_per_issue,
                    "Auto-repair attempts exhausted, leaving issue for the operator"
                );
                continue;
            }

            let result = match anomaly.kind {
                AnomalyKind::Orphaned => self.repair_orphaned(anomaly).await,
                AnomalyKind::Duplicate => self.repair_duplicate(snapshot, anomaly).await,
                AnomalyKind::Unauthorized => self.repair_unauthorized(anomaly).await,
                AnomalyKind::StateMismatch => self.repair_state_mismatch(anomaly).await,
                AnomalyKind::HeartbeatTimeout => {
                    failover_requested = true;
                    self.mark_worker_inactive(anomaly).await
                }
                AnomalyKind::LoadImbalance => {
                    rebalance_requested = true;
                    Ok(true)
                }
            };

            match result {
                Ok(true) => {
                    repaired += 1;
                    self.clear_attempts(&key);
                    metrics::counter!(
                        "orchestrator.reconciler.repairs",
                        "kind" => anomaly.kind.as_str()
                    )
                    .increment(1);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(issue = %key, error = %e, "Auto-repair failed");
                }
            }
        }

        // Collapsed repairs run once regardless of how many anomalies asked.
        if failover_requested {
            if let Err(e) = self.failover.run_cycle().await {
                tracing::warn!(error = %e, "Failover handoff from reconciler failed");
            }
        }
        if rebalance_requested {
            match self.placement.rebalance_all("reconciler detected load imbalance").await {
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Rebalance requested by reconciler failed"),
            }
        }

        self.prune_attempts(anomalies);
        repaired
    }

    /// Move an orphaned stream to the least-loaded active worker with spare
    /// capacity; with no candidate the row becomes `unassigned`.
    async fn repair_orphaned(&self, anomaly: &Anomaly) -> Result<bool> {
        let Some(stream_id) = anomaly.stream_id else {
            return Ok(false);
        };
        let evicted = anomaly.worker_ids.first().cloned();
        let cutoff = Utc::now() - self.heartbeat_timeout;

        let mut tx = self.db.begin("reconciler.repair_orphaned").await.map_err(db_err)?;

        let target: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM orchestrator_instances
            WHERE status = 'active' AND last_heartbeat > $1 AND load < capacity
            ORDER BY load ASC, capacity - load DESC, id
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(cutoff)
        .fetch_optional(tx.conn())
        .await
        .map_err(|e| db_err(DbError::from_sqlx(e)))?;
        tx.note_query();

        sqlx::query(
            "DELETE FROM orchestrator_stream_assignments WHERE stream_id = $1 AND status = 'active'",
        )
        .bind(stream_id.0)
        .execute(tx.conn())
        .await
        .map_err(|e| db_err(DbError::from_sqlx(e)))?;
        tx.note_query();

        match target {
            Some((target_id,)) => {
                let target = WorkerId(target_id);
                assignments::insert_active(tx.conn(), stream_id, &target)
                    .await
                    .map_err(db_err)?;
                assignments::increment_load(tx.conn(), &target, 1)
                    .await
                    .map_err(db_err)?;
                tracing::info!(
                    stream_id = %stream_id,
                    worker_id = %target,
                    "Orphaned stream re-homed"
                );
            }
            None => {
                if let Some(evicted) = &evicted {
                    assignments::insert_unassigned(tx.conn(), stream_id, evicted)
                        .await
                        .map_err(db_err)?;
                }
                tracing::warn!(
                    stream_id = %stream_id,
                    "No capacity for orphaned stream, marked unassigned"
                );
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    /// Keep exactly one active row for a duplicated stream: the earliest
    /// assignment wins, ties broken by worker id. Losing rows are released
    /// and both workers' loads recomputed.
    async fn repair_duplicate(&self, snapshot: &FleetSnapshot, anomaly: &Anomaly) -> Result<bool> {
        let Some(stream_id) = anomaly.stream_id else {
            return Ok(false);
        };
        // Prefer a worker that is still active when choosing the survivor.
        let active_ids: HashSet<&WorkerId> = snapshot
            .workers
            .iter()
            .filter(|w| w.status.is_active())
            .map(|w| &w.id)
            .collect();
        let keep = anomaly
            .worker_ids
            .iter()
            .filter(|w| active_ids.contains(w))
            .min()
            .or_else(|| anomaly.worker_ids.iter().min())
            .cloned();
        let Some(keep) = keep else {
            return Ok(false);
        };
        let losers: Vec<WorkerId> = anomaly
            .worker_ids
            .iter()
            .filter(|w| **w != keep)
            .cloned()
            .collect();

        let mut tx = self.db.begin("reconciler.repair_duplicate").await.map_err(db_err)?;

        for loser in &losers {
            let released = assignments::mark_released(tx.conn(), stream_id, loser)
                .await
                .map_err(db_err)?;
            tx.note_query();
            if released > 0 {
                assignments::recount_worker_load(tx.conn(), loser)
                    .await
                    .map_err(db_err)?;
                tx.note_query();
            }
        }
        assignments::recount_worker_load(tx.conn(), &keep)
            .await
            .map_err(db_err)?;
        tx.note_query();

        tx.commit().await.map_err(db_err)?;
        tracing::info!(
            stream_id = %stream_id,
            kept = %keep,
            released = losers.len(),
            "Duplicate assignment resolved"
        );
        Ok(true)
    }

    /// Legitimise a worker-reported stream when the worker has spare
    /// capacity and the stream is not actively assigned elsewhere. Otherwise
    /// the missing row stays authoritative and the worker drops the stream
    /// on its next diagnostic.
    async fn repair_unauthorized(&self, anomaly: &Anomaly) -> Result<bool> {
        let Some(stream_id) = anomaly.stream_id else {
            return Ok(false);
        };
        let Some(worker_id) = anomaly.worker_ids.first().cloned() else {
            return Ok(false);
        };

        let mut tx = self.db.begin("reconciler.repair_unauthorized").await.map_err(db_err)?;

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
        .map_err(|e| db_err(DbError::from_sqlx(e)))?;
        tx.note_query();

        let Some((capacity, load, status)) = row else {
            tx.rollback().await;
            return Ok(false);
        };
        if status != "active" || load >= capacity {
            tx.rollback().await;
            tracing::info!(
                stream_id = %stream_id,
                worker_id = %worker_id,
                "Unauthorized stream not legitimised, worker must drop it"
            );
            return Ok(false);
        }

        let taken: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT stream_id
            FROM orchestrator_stream_assignments
            WHERE stream_id = $1 AND status = 'active'
            "#,
        )
        .bind(stream_id.0)
        .fetch_optional(tx.conn())
        .await
        .map_err(|e| db_err(DbError::from_sqlx(e)))?;
        tx.note_query();
        if taken.is_some() {
            tx.rollback().await;
            return Ok(false);
        }

        assignments::insert_active(tx.conn(), stream_id, &worker_id)
            .await
            .map_err(db_err)?;
        assignments::increment_load(tx.conn(), &worker_id, 1)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(
            stream_id = %stream_id,
            worker_id = %worker_id,
            "Unauthorized stream legitimised"
        );
        Ok(true)
    }

    async fn repair_state_mismatch(&self, anomaly: &Anomaly) -> Result<bool> {
        let Some(worker_id) = anomaly.worker_ids.first().cloned() else {
            return Ok(false);
        };

        let mut tx = self.db.begin("reconciler.repair_state_mismatch").await.map_err(db_err)?;
        assignments::recount_worker_load(tx.conn(), &worker_id)
            .await
            .map_err(db_err)?;
        tx.note_query();
        tx.commit().await.map_err(db_err)?;

        tracing::info!(worker_id = %worker_id, "Load counter recomputed");
        Ok(true)
    }

    /// Heartbeat-timeout handoff: flip the worker inactive so the failover
    /// sweep re-homes its streams.
    async fn mark_worker_inactive(&self, anomaly: &Anomaly) -> Result<bool> {
        let Some(worker_id) = anomaly.worker_ids.first().cloned() else {
            return Ok(false);
        };

        let mut conn = self.db.acquire("reconciler.mark_inactive").await.map_err(db_err)?;
        sqlx::query("UPDATE orchestrator_instances SET status = 'inactive' WHERE id = $1")
            .bind(worker_id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| db_err(DbError::from_sqlx(e)))?;
        Ok(true)
    }

    /// Reserve one attempt for the issue. False when the budget is spent.
    fn take_attempt(&self, key: &str) -> bool {
        let mut state = self.state.lock().expect("reconciler lock poisoned");
        let attempts = state.attempts.entry(key.to_string()).or_insert(0);
        if *attempts >= self.max_attempts_per_issue {
            return false;
        }
        *attempts += 1;
        true
    }

    fn clear_attempts(&self, key: &str) {
        let mut state = self.state.lock().expect("reconciler lock poisoned");
        state.attempts.remove(key);
    }

    /// Forget attempt counters for issues that no longer exist, so a
    /// recurrence later starts with a fresh budget.
    fn prune_attempts(&self, current: &[Anomaly]) {
        let live: HashSet<String> = current.iter().map(issue_key).collect();
        let mut state = self.state.lock().expect("reconciler lock poisoned");
        state.attempts.retain(|key, _| live.contains(key));
    }

    fn store_report(&self, report: ConsistencyReport) {
        let mut state = self.state.lock().expect("reconciler lock poisoned");
        state.history.push_back(report);
        while state.history.len() > self.history_size {
            state.history.pop_front();
        }
    }
}

fn db_err(e: DbError) -> aircheck_common::OrchestratorError {
    e.into()
}

fn issue_key(anomaly: &Anomaly) -> String {
    match anomaly.stream_id {
        Some(stream_id) => format!("{}:{stream_id}", anomaly.kind.as_str()),
        None => format!(
            "{}:{}",
            anomaly.kind.as_str(),
            anomaly
                .worker_ids
                .first()
                .map(|w| w.as_str())
                .unwrap_or("fleet")
        ),
    }
}

/// Run every detector over one snapshot.
pub fn detect_all(
    snapshot: &FleetSnapshot,
    cutoff: DateTime<Utc>,
    reported: &HashMap<WorkerId, Vec<StreamId>>,
    imbalance_threshold: f64,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    anomalies.extend(detect_orphaned(snapshot, cutoff));
    anomalies.extend(detect_duplicates(snapshot));
    anomalies.extend(detect_unauthorized(snapshot, reported));
    anomalies.extend(detect_state_mismatch(snapshot));
    anomalies.extend(detect_heartbeat_timeout(snapshot, cutoff));
    anomalies.extend(detect_load_imbalance(snapshot, imbalance_threshold));
    anomalies
}

/// Active assignments whose worker is missing, inactive, or stale.
pub fn detect_orphaned(snapshot: &FleetSnapshot, cutoff: DateTime<Utc>) -> Vec<Anomaly> {
    let workers: HashMap<&WorkerId, &WorkerInstance> =
        snapshot.workers.iter().map(|w| (&w.id, w)).collect();

    snapshot
        .assignments
        .iter()
        .filter_map(|(stream_id, worker_id)| match workers.get(worker_id) {
            None => Some(Anomaly {
                kind: AnomalyKind::Orphaned,
                stream_id: Some(*stream_id),
                worker_ids: vec![worker_id.clone()],
                severity: Severity::Critical,
                description: format!(
                    "stream {stream_id} is assigned to {worker_id}, which does not exist"
                ),
            }),
            Some(w) if !w.status.is_active() || w.last_heartbeat < cutoff => Some(Anomaly {
                kind: AnomalyKind::Orphaned,
                stream_id: Some(*stream_id),
                worker_ids: vec![worker_id.clone()],
                severity: Severity::High,
                description: format!(
                    "stream {stream_id} is assigned to {worker_id}, which is not serving"
                ),
            }),
            Some(_) => None,
        })
        .collect()
}

/// Streams with more than one active row.
pub fn detect_duplicates(snapshot: &FleetSnapshot) -> Vec<Anomaly> {
    let mut by_stream: HashMap<StreamId, Vec<WorkerId>> = HashMap::new();
    for (stream_id, worker_id) in &snapshot.assignments {
        by_stream.entry(*stream_id).or_default().push(worker_id.clone());
    }

    let mut anomalies: Vec<Anomaly> = by_stream
        .into_iter()
        .filter(|(_, workers)| workers.len() > 1)
        .map(|(stream_id, mut workers)| {
            workers.sort();
            Anomaly {
                kind: AnomalyKind::Duplicate,
                stream_id: Some(stream_id),
                severity: Severity::Critical,
                description: format!(
                    "stream {stream_id} has {} active assignments",
                    workers.len()
                ),
                worker_ids: workers,
            }
        })
        .collect();
    anomalies.sort_by_key(|a| a.stream_id);
    anomalies
}

/// Worker-reported streams with no active row for that worker.
pub fn detect_unauthorized(
    snapshot: &FleetSnapshot,
    reported: &HashMap<WorkerId, Vec<StreamId>>,
) -> Vec<Anomaly> {
    let authoritative: HashSet<(&WorkerId, &StreamId)> = snapshot
        .assignments
        .iter()
        .map(|(stream_id, worker_id)| (worker_id, stream_id))
        .collect();

    let mut anomalies = Vec::new();
    let mut workers: Vec<&WorkerId> = reported.keys().collect();
    workers.sort();
    for worker_id in workers {
        for stream_id in &reported[worker_id] {
            if !authoritative.contains(&(worker_id, stream_id)) {
                anomalies.push(Anomaly {
                    kind: AnomalyKind::Unauthorized,
                    stream_id: Some(*stream_id),
                    worker_ids: vec![worker_id.clone()],
                    severity: Severity::Medium,
                    description: format!(
                        "worker {worker_id} reports stream {stream_id} without an active assignment"
                    ),
                });
            }
        }
    }
    anomalies
}

/// Worker load counters that disagree with the assignment table.
pub fn detect_state_mismatch(snapshot: &FleetSnapshot) -> Vec<Anomaly> {
    let mut counts: HashMap<&WorkerId, i32> = HashMap::new();
    for (_, worker_id) in &snapshot.assignments {
        *counts.entry(worker_id).or_insert(0) += 1;
    }

    snapshot
        .workers
        .iter()
        .filter_map(|w| {
            let actual = counts.get(&w.id).copied().unwrap_or(0);
            (w.load != actual).then(|| Anomaly {
                kind: AnomalyKind::StateMismatch,
                stream_id: None,
                worker_ids: vec![w.id.clone()],
                severity: Severity::Warning,
                description: format!(
                    "worker {} records load {} but holds {} active assignments",
                    w.id, w.load, actual
                ),
            })
        })
        .collect()
}

/// Active workers whose heartbeat is past the timeout.
pub fn detect_heartbeat_timeout(snapshot: &FleetSnapshot, cutoff: DateTime<Utc>) -> Vec<Anomaly> {
    snapshot
        .workers
        .iter()
        .filter(|w| w.status.is_active() && w.last_heartbeat < cutoff)
        .map(|w| Anomaly {
            kind: AnomalyKind::HeartbeatTimeout,
            stream_id: None,
            worker_ids: vec![w.id.clone()],
            severity: Severity::Critical,
            description: format!(
                "worker {} is marked active but last heartbeat was {}",
                w.id, w.last_heartbeat
            ),
        })
        .collect()
}

/// Active workers whose load deviates from the mean by more than the
/// threshold fraction.
pub fn detect_load_imbalance(snapshot: &FleetSnapshot, threshold: f64) -> Vec<Anomaly> {
    let active: Vec<&WorkerInstance> = snapshot
        .workers
        .iter()
        .filter(|w| w.status.is_active())
        .collect();
    if active.len() <= 1 {
        return Vec::new();
    }

    let total: i64 = active.iter().map(|w| w.load as i64).sum();
    if total == 0 {
        return Vec::new();
    }
    let mean = total as f64 / active.len() as f64;

    active
        .iter()
        .filter(|w| (w.load as f64 - mean).abs() > mean * threshold)
        .map(|w| Anomaly {
            kind: AnomalyKind::LoadImbalance,
            stream_id: None,
            worker_ids: vec![w.id.clone()],
            severity: Severity::Warning,
            description: format!(
                "worker {} load {} deviates from fleet mean {:.1}",
                w.id, w.load, mean
            ),
        })
        .collect()
}

/// `max(0, 1 − issues/total) − 0.1·critical`, clamped to [0, 1].
pub fn consistency_score(total_streams: usize, anomalies: &[Anomaly]) -> f64 {
    let base = if total_streams == 0 {
        1.0
    } else {
        (1.0 - anomalies.len() as f64 / total_streams as f64).max(0.0)
    };
    let critical = anomalies.iter().filter(|a| a.is_critical()).count();
    (base - 0.1 * critical as f64).clamp(0.0, 1.0)
}

/// Human-readable repair guidance for the report.
pub fn recommendations_for(anomalies: &[Anomaly]) -> Vec<String> {
    let count_of = |kind: AnomalyKind| anomalies.iter().filter(|a| a.kind == kind).count();

    let mut recommendations = Vec::new();
    let orphaned = count_of(AnomalyKind::Orphaned);
    if orphaned > 0 {
        recommendations.push(format!("Reassign {orphaned} orphaned streams to active workers"));
    }
    let duplicates = count_of(AnomalyKind::Duplicate);
    if duplicates > 0 {
        recommendations.push(format!(
            "Resolve {duplicates} duplicate stream assignments immediately"
        ));
    }
    let unauthorized = count_of(AnomalyKind::Unauthorized);
    if unauthorized > 0 {
        recommendations.push(format!(
            "Synchronize {unauthorized} unauthorized streams with the assignment table"
        ));
    }
    let mismatched = count_of(AnomalyKind::StateMismatch);
    if mismatched > 0 {
        recommendations.push(format!("Recompute load counters for {mismatched} workers"));
    }
    let stale = count_of(AnomalyKind::HeartbeatTimeout);
    if stale > 0 {
        recommendations.push(format!(
            "Check connectivity for {stale} workers with stale heartbeats"
        ));
    }
    if count_of(AnomalyKind::LoadImbalance) > 0 {
        recommendations.push("Run a full rebalance to even out worker load".to_string());
    }
    if anomalies.len() > 10 {
        recommendations
            .push("Consider a full rebalance due to the high inconsistency count".to_string());
    }
    if recommendations.is_empty() {
        recommendations.push("System consistency is good, continue monitoring".to_string());
    }
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircheck_common::types::WorkerStatus;

    fn worker(id: &str, capacity: i32, load: i32, status: WorkerStatus, heartbeat_age_secs: i64) -> WorkerInstance {
        let now = Utc::now();
        WorkerInstance {
            id: WorkerId::new(id),
            host: "10.0.0.1".into(),
            port: 8000,
            capacity,
            load,
            status,
            registered_at: now - chrono::Duration::hours(1),
            last_heartbeat: now - chrono::Duration::seconds(heartbeat_age_secs),
        }
    }

    fn snapshot(workers: Vec<WorkerInstance>, assignments: &[(i32, &str)]) -> FleetSnapshot {
        FleetSnapshot {
            workers,
            assignments: assignments
                .iter()
                .map(|(s, w)| (StreamId(*s), WorkerId::new(*w)))
                .collect(),
            taken_at: Utc::now(),
        }
    }

    fn cutoff() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::seconds(300)
    }

    #[test]
    fn test_detect_orphaned_missing_and_stale_workers() {
        let snap = snapshot(
            vec![
                worker("alive", 20, 1, WorkerStatus::Active, 10),
                worker("stale", 20, 1, WorkerStatus::Active, 900),
                worker("retired", 20, 1, WorkerStatus::Inactive, 10),
            ],
            &[(1, "alive"), (2, "stale"), (3, "retired"), (4, "ghost")],
        );

        let anomalies = detect_orphaned(&snap, cutoff());
        assert_eq!(anomalies.len(), 3);

        let ghost = anomalies.iter().find(|a| a.stream_id == Some(StreamId(4))).unwrap();
        assert_eq!(ghost.severity, Severity::Critical);
        let stale = anomalies.iter().find(|a| a.stream_id == Some(StreamId(2))).unwrap();
        assert_eq!(stale.severity, Severity::High);
    }

    #[test]
    fn test_detect_duplicates() {
        let snap = snapshot(
            vec![
                worker("w1", 20, 2, WorkerStatus::Active, 10),
                worker("w2", 20, 1, WorkerStatus::Active, 10),
            ],
            &[(42, "w1"), (42, "w2"), (7, "w1")],
        );

        let anomalies = detect_duplicates(&snap);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].stream_id, Some(StreamId(42)));
        assert_eq!(anomalies[0].severity, Severity::Critical);
        assert_eq!(anomalies[0].worker_ids.len(), 2);
    }

    #[test]
    fn test_detect_unauthorized_requires_a_report() {
        let snap = snapshot(
            vec![worker("w1", 20, 1, WorkerStatus::Active, 10)],
            &[(1, "w1")],
        );

        // Without self-reports nothing is detected.
        assert!(detect_unauthorized(&snap, &HashMap::new()).is_empty());

        let mut reported = HashMap::new();
        reported.insert(WorkerId::new("w1"), vec![StreamId(1), StreamId(9)]);
        let anomalies = detect_unauthorized(&snap, &reported);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].stream_id, Some(StreamId(9)));
        assert_eq!(anomalies[0].severity, Severity::Medium);
    }

    #[test]
    fn test_detect_state_mismatch() {
        let snap = snapshot(
            vec![
                worker("honest", 20, 2, WorkerStatus::Active, 10),
                worker("drifted", 20, 5, WorkerStatus::Active, 10),
            ],
            &[(1, "honest"), (2, "honest"), (3, "drifted")],
        );

        let anomalies = detect_state_mismatch(&snap);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].worker_ids[0].as_str(), "drifted");
        assert_eq!(anomalies[0].severity, Severity::Warning);
    }

    #[test]
    fn test_detect_heartbeat_timeout_boundary() {
        let snap = snapshot(
            vec![
                worker("fresh", 20, 0, WorkerStatus::Active, 299),
                worker("expired", 20, 0, WorkerStatus::Active, 301),
                worker("already_inactive", 20, 0, WorkerStatus::Inactive, 900),
            ],
            &[],
        );

        let anomalies = detect_heartbeat_timeout(&snap, cutoff());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].worker_ids[0].as_str(), "expired");
    }

    #[test]
    fn test_detect_load_imbalance() {
        let snap = snapshot(
            vec![
                worker("hot", 20, 18, WorkerStatus::Active, 10),
                worker("cold1", 20, 2, WorkerStatus::Active, 10),
                worker("cold2", 20, 2, WorkerStatus::Active, 10),
            ],
            &[],
        );

        let anomalies = detect_load_imbalance(&snap, 0.20);
        // 18 deviates upward, both 2s deviate downward from mean 7.33.
        assert_eq!(anomalies.len(), 3);
        assert!(anomalies.iter().all(|a| a.severity == Severity::Warning));
    }

    #[test]
    fn test_balanced_fleet_has_no_imbalance() {
        let snap = snapshot(
            vec![
                worker("w1", 20, 7, WorkerStatus::Active, 10),
                worker("w2", 20, 8, WorkerStatus::Active, 10),
            ],
            &[],
        );

        assert!(detect_load_imbalance(&snap, 0.20).is_empty());
    }

    #[test]
    fn test_consistency_score() {
        let clean: Vec<Anomaly> = Vec::new();
        assert_eq!(consistency_score(10, &clean), 1.0);
        assert_eq!(consistency_score(0, &clean), 1.0);

        let warning = Anomaly {
            kind: AnomalyKind::StateMismatch,
            stream_id: None,
            worker_ids: vec![WorkerId::new("w1")],
            severity: Severity::Warning,
            description: String::new(),
        };
        let critical = Anomaly {
            kind: AnomalyKind::Duplicate,
            stream_id: Some(StreamId(1)),
            worker_ids: vec![WorkerId::new("w1"), WorkerId::new("w2")],
            severity: Severity::Critical,
            description: String::new(),
        };

        // One warning out of ten streams: 0.9.
        assert!((consistency_score(10, std::slice::from_ref(&warning)) - 0.9).abs() < 1e-9);
        // A critical costs its share plus the 0.1 penalty.
        assert!((consistency_score(10, std::slice::from_ref(&critical)) - 0.8).abs() < 1e-9);
        // Score never leaves [0, 1].
        let many: Vec<Anomaly> = (0..50).map(|_| critical.clone()).collect();
        assert_eq!(consistency_score(10, &many), 0.0);
    }

    #[test]
    fn test_recommendations_cover_detected_kinds() {
        let anomalies = vec![Anomaly {
            kind: AnomalyKind::Duplicate,
            stream_id: Some(StreamId(42)),
            worker_ids: vec![WorkerId::new("w1"), WorkerId::new("w2")],
            severity: Severity::Critical,
            description: String::new(),
        }];

        let recommendations = recommendations_for(&anomalies);
        assert!(recommendations[0].contains("duplicate"));

        let clean = recommendations_for(&[]);
        assert_eq!(clean.len(), 1);
        assert!(clean[0].contains("consistency is good"));
    }
}
