use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use aircheck_common::api::control::ActiveTransaction;

/// Terminal and in-flight states of a monitored transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    Deadlock,
    Timeout,
}

struct ActiveTx {
    label: String,
    started: Instant,
    queries: Arc<AtomicU32>,
    abort: Arc<AtomicBool>,
    warned: bool,
}

#[allow(dead_code)]
struct CompletedTx {
    id: Uuid,
    label: String,
    duration: Duration,
    queries: u32,
    status: TransactionStatus,
}

struct MonitorInner {
    active: HashMap<Uuid, ActiveTx>,
    history: VecDeque<CompletedTx>,
}

/// In-memory ledger of in-flight transactions.
///
/// Every `Db::begin` call registers here. A periodic watchdog scan
/// warns about transactions open past the threshold and marks those past
/// twice the threshold for forced rollback at their next commit attempt.
pub struct TransactionMonitor {
    threshold: Duration,
    // Guards ledger state; never held across await points.
    inner: Mutex<MonitorInner>,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    deadlocks: AtomicU64,
    timeouts: AtomicU64,
}

const HISTORY_CAP: usize = 1000;

impl TransactionMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            inner: Mutex::new(MonitorInner {
                active: HashMap::new(),
                history: VecDeque::new(),
            }),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            deadlocks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Register a new transaction and return its guard.
    pub fn begin(self: &Arc<Self>, label: &str) -> TxGuard {
        let id = Uuid::new_v4();
        let queries = Arc::new(AtomicU32::new(0));
        let abort = Arc::new(AtomicBool::new(false));

        {
            let mut inner = self.inner.lock().expect("monitor lock poisoned");
            inner.active.insert(
                id,
                ActiveTx {
                    label: label.to_string(),
                    started: Instant::now(),
                    queries: Arc::clone(&queries),
                    abort: Arc::clone(&abort),
                    warned: false,
                },
            );
        }

        metrics::gauge!("orchestrator.db.active_transactions").increment(1.0);

        TxGuard {
            id,
            label: label.to_string(),
            queries,
            abort,
            monitor: Arc::clone(self),
            completed: false,
        }
    }

    fn finish(&self, id: Uuid, status: TransactionStatus) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        let Some(tx) = inner.active.remove(&id) else {
            return;
        };

        inner.history.push_back(CompletedTx {
            id,
            label: tx.label,
            duration: tx.started.elapsed(),
            queries: tx.queries.load(Ordering::Relaxed),
            status,
        });
        if inner.history.len() > HISTORY_CAP {
            inner.history.pop_front();
        }
        drop(inner);

        match status {
            TransactionStatus::Committed => {
                self.committed.fetch_add(1, Ordering::Relaxed);
            }
            TransactionStatus::RolledBack => {
                self.rolled_back.fetch_add(1, Ordering::Relaxed);
            }
            TransactionStatus::Deadlock => {
                self.deadlocks.fetch_add(1, Ordering::Relaxed);
            }
            TransactionStatus::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            TransactionStatus::Active => {}
        }

        metrics::gauge!("orchestrator.db.active_transactions").decrement(1.0);
    }

    /// One watchdog pass: warn on long transactions, mark very long ones for
    /// forced rollback.
    pub fn scan(&self) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");

        for (id, tx) in inner.active.iter_mut() {
            let elapsed = tx.started.elapsed();

            if elapsed > self.threshold * 2 && !tx.abort.load(Ordering::Relaxed) {
                tracing::error!(
                    transaction_id = %id,
                    context = %tx.label,
                    elapsed_secs = elapsed.as_secs(),
                    "Transaction exceeded twice the threshold, marking for rollback"
                );
                tx.abort.store(true, Ordering::Relaxed);
                metrics::counter!("orchestrator.db.forced_aborts").increment(1);
            } else if elapsed > self.threshold && !tx.warned {
                tracing::warn!(
                    transaction_id = %id,
                    context = %tx.label,
                    elapsed_secs = elapsed.as_secs(),
                    queries = tx.queries.load(Ordering::Relaxed),
                    "Long-running transaction detected"
                );
                tx.warned = true;
                metrics::counter!("orchestrator.db.long_transactions").increment(1);
            }
        }
    }

    /// Currently active transactions, for the health snapshot.
    pub fn active_snapshot(&self) -> Vec<ActiveTransaction> {
        let inner = self.inner.lock().expect("monitor lock poisoned");
        inner
            .active
            .iter()
            .map(|(id, tx)| ActiveTransaction {
                id: id.to_string(),
                context: tx.label.clone(),
                elapsed_ms: tx.started.elapsed().as_millis() as u64,
                query_count: tx.queries.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Completion counters (committed, rolled back, deadlocks, timeouts).
    pub fn counts(&self) -> (u64, u64, u64, u64) {
        (
            self.committed.load(Ordering::Relaxed),
            self.rolled_back.load(Ordering::Relaxed),
            self.deadlocks.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
        )
    }
}

/// Handle to one registered transaction. `ScopedTx` completes it
/// on every exit path; a guard dropped without completion counts as a
/// rollback so the ledger never leaks an active entry.
pub struct TxGuard {
    id: Uuid,
    label: String,
    queries: Arc<AtomicU32>,
    abort: Arc<AtomicBool>,
    monitor: Arc<TransactionMonitor>,
    completed: bool,
}

impl TxGuard {
    /// Record one executed statement against this transaction.
    pub fn note_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the watchdog marked this transaction for forced rollback.
    pub fn is_marked_for_abort(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn complete(mut self, status: TransactionStatus) {
        self.completed = true;
        self.monitor.finish(self.id, status);
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.monitor.finish(self.id, TransactionStatus::RolledBack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_rollback_are_ledgered() {
        let monitor = Arc::new(TransactionMonitor::new(Duration::from_secs(30)));

        let guard = monitor.begin("test.commit");
        guard.note_query();
        guard.complete(TransactionStatus::Committed);

        let guard = monitor.begin("test.rollback");
        guard.complete(TransactionStatus::RolledBack);

        let (committed, rolled_back, _, _) = monitor.counts();
        assert_eq!(committed, 1);
        assert_eq!(rolled_back, 1);
        assert!(monitor.active_snapshot().is_empty());
    }

    #[test]
    fn test_dropped_guard_counts_as_rollback() {
        let monitor = Arc::new(TransactionMonitor::new(Duration::from_secs(30)));

        drop(monitor.begin("test.dropped"));

        let (_, rolled_back, _, _) = monitor.counts();
        assert_eq!(rolled_back, 1);
        assert!(monitor.active_snapshot().is_empty());
    }

    #[test]
    fn test_scan_marks_very_long_transactions() {
        let monitor = Arc::new(TransactionMonitor::new(Duration::from_millis(5)));

        let guard = monitor.begin("test.slow");
        assert!(!guard.is_marked_for_abort());

        std::thread::sleep(Duration::from_millis(20));
        monitor.scan();

        assert!(guard.is_marked_for_abort());
        guard.complete(TransactionStatus::Timeout);

        let (_, _, _, timeouts) = monitor.counts();
        assert_eq!(timeouts, 1);
    }

    #[test]
    fn test_active_snapshot_reports_context() {
        let monitor = Arc::new(TransactionMonitor::new(Duration::from_secs(30)));

        let guard = monitor.begin("placement.assign_to");
        guard.note_query();
        guard.note_query();

        let snapshot = monitor.active_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].context, "placement.assign_to");
        assert_eq!(snapshot[0].query_count, 2);

        guard.complete(TransactionStatus::Committed);
    }
}
