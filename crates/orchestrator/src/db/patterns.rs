use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use aircheck_common::api::control::ErrorPatternSummary;

use super::{retry, DbError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ErrorSeverity {
    Low,
    High,
    Critical,
}

impl ErrorSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

struct PatternEntry {
    count: u64,
    severity: ErrorSeverity,
    last_seen: DateTime<Utc>,
    contexts: Vec<String>,
}

const PATTERN_CAP: usize = 100;
const CONTEXTS_PER_PATTERN: usize = 5;
const PATTERN_KEY_LEN: usize = 100;

/// Capped table of recurring error signatures, keyed by error kind plus a
/// message prefix. Feeds the ranked pattern list in the health snapshot.
pub struct ErrorPatternTable {
    // Never held across await points.
    inner: Mutex<HashMap<String, PatternEntry>>,
}

impl ErrorPatternTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record one error occurrence under its pattern key.
    pub fn record(&self, context: &str, err: &DbError) {
        let message = err.to_string();
        let severity = classify_severity(err, &message);
        let key = pattern_key(err, &message);

        let mut inner = self.inner.lock().expect("pattern lock poisoned");

        let entry = inner.entry(key.clone()).or_insert_with(|| PatternEntry {
            count: 0,
            severity,
            last_seen: Utc::now(),
            contexts: Vec::new(),
        });
        entry.count += 1;
        entry.last_seen = Utc::now();
        if !entry.contexts.iter().any(|c| c == context) && entry.contexts.len() < CONTEXTS_PER_PATTERN
        {
            entry.contexts.push(context.to_string());
        }

        // Evict the stalest pattern once the table is full.
        if inner.len() > PATTERN_CAP {
            if let Some(stalest) = inner
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(k, _)| k.clone())
            {
                inner.remove(&stalest);
            }
        }
        drop(inner);

        match severity {
            ErrorSeverity::Critical => {
                tracing::error!(context, error = %message, "Critical database error")
            }
            ErrorSeverity::High => {
                tracing::warn!(context, error = %message, "Database error")
            }
            ErrorSeverity::Low => {
                tracing::debug!(context, error = %message, "Database error")
            }
        }
        metrics::counter!("orchestrator.db.errors", "severity" => severity.as_str()).increment(1);
    }

    /// The `limit` most frequent patterns, most frequent first.
    pub fn top(&self, limit: usize) -> Vec<ErrorPatternSummary> {
        let inner = self.inner.lock().expect("pattern lock poisoned");

        let mut patterns: Vec<ErrorPatternSummary> = inner
            .iter()
            .map(|(key, entry)| ErrorPatternSummary {
                pattern: key.clone(),
                count: entry.count,
                severity: entry.severity.as_str().to_string(),
                last_seen: entry.last_seen,
            })
            .collect();

        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        patterns.truncate(limit);
        patterns
    }
}

impl Default for ErrorPatternTable {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_severity(err: &DbError, message: &str) -> ErrorSeverity {
    let lower = message.to_lowercase();
    if retry::is_deadlock_message(&lower) || lower.contains("timeout") {
        ErrorSeverity::Critical
    } else if matches!(err, DbError::Connection(_) | DbError::PoolExhausted(_)) {
        ErrorSeverity::High
    } else {
        ErrorSeverity::Low
    }
}

fn pattern_key(err: &DbError, message: &str) -> String {
    let variant = match err {
        DbError::Connection(_) => "connection",
        DbError::PoolExhausted(_) => "pool_exhausted",
        DbError::Query(_) => "query",
        DbError::Migration(_) => "migration",
        DbError::TxAborted(_) => "tx_aborted",
        DbError::Conflict(_) => "conflict",
        DbError::NotFound(_) => "not_found",
    };
    let prefix: String = message.chars().take(PATTERN_KEY_LEN).collect();
    format!("{variant}:{prefix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_errors_aggregate() {
        let table = ErrorPatternTable::new();

        for _ in 0..3 {
            table.record("registry.register", &DbError::Query("deadlock detected".into()));
        }
        table.record("placement.assign_to", &DbError::Query("deadlock detected".into()));

        let top = table.top(10);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].count, 4);
        assert_eq!(top[0].severity, "critical");
    }

    #[test]
    fn test_ranking_by_count() {
        let table = ErrorPatternTable::new();

        table.record("a", &DbError::Connection("connection reset".into()));
        for _ in 0..5 {
            table.record("b", &DbError::Query("lock timeout".into()));
        }

        let top = table.top(10);
        assert_eq!(top.len(), 2);
        assert!(top[0].pattern.starts_with("query:"));
        assert_eq!(top[0].count, 5);
    }

    #[test]
    fn test_table_is_capped() {
        let table = ErrorPatternTable::new();

        for i in 0..(PATTERN_CAP + 20) {
            table.record("ctx", &DbError::Query(format!("error number {i}")));
        }

        assert!(table.top(usize::MAX).len() <= PATTERN_CAP);
    }
}
