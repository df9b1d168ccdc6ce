use aircheck_common::config::OrchestratorConfig;

use super::loader::ConfigError;

/// Validate the complete configuration, accumulating every problem before
/// refusing to start.
pub fn validate(config: &OrchestratorConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_pool(config, &mut errors);
    validate_retry(config, &mut errors);
    validate_periods(config, &mut errors);
    validate_thresholds(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors.join("; ")))
    }
}

fn validate_pool(config: &OrchestratorConfig, errors: &mut Vec<String>) {
    let p = &config.pool;

    if p.max == 0 {
        errors.push("pool.max must be > 0".into());
    }
    if p.min > p.max {
        errors.push("pool.min must be <= pool.max".into());
    }
    if p.connect_timeout_ms == 0 {
        errors.push("pool.connect_timeout_ms must be > 0".into());
    }
    if p.lock_timeout_ms == 0 || p.lock_timeout_ms > 10_000 {
        errors.push("pool.lock_timeout_ms must be in (0, 10000]".into());
    }
    if p.statement_timeout_ms == 0 {
        errors.push("pool.statement_timeout_ms must be > 0".into());
    }
}

fn validate_retry(config: &OrchestratorConfig, errors: &mut Vec<String>) {
    let r = &config.retry;

    if r.max_attempts == 0 {
        errors.push("retry.max_attempts must be > 0".into());
    }
    if r.initial_backoff_ms == 0 {
        errors.push("retry.initial_backoff_ms must be > 0".into());
    }
    if r.max_backoff_ms < r.initial_backoff_ms {
        errors.push("retry.max_backoff_ms must be >= initial_backoff_ms".into());
    }
    if r.backoff_multiplier < 1.0 {
        errors.push("retry.backoff_multiplier must be >= 1.0".into());
    }
}

fn validate_periods(config: &OrchestratorConfig, errors: &mut Vec<String>) {
    if config.heartbeat.timeout_seconds < 5 {
        errors.push("heartbeat.timeout_seconds must be >= 5".into());
    }
    if config.heartbeat.sweep_period_seconds == 0 {
        errors.push("heartbeat.sweep_period_seconds must be > 0".into());
    }
    if config.failover.period_seconds == 0 {
        errors.push("failover.period_seconds must be > 0".into());
    }
    if config.reconciler.period_seconds == 0 {
        errors.push("reconciler.period_seconds must be > 0".into());
    }
    if config.rebalance.period_seconds == 0 {
        errors.push("rebalance.period_seconds must be > 0".into());
    }
    if config.tx.monitor_period_seconds == 0 {
        errors.push("tx.monitor_period_seconds must be > 0".into());
    }
    if config.tx.timeout_threshold_seconds == 0 {
        errors.push("tx.timeout_threshold_seconds must be > 0".into());
    }
}

fn validate_thresholds(config: &OrchestratorConfig, errors: &mut Vec<String>) {
    if !(0.0..=1.0).contains(&config.rebalance.imbalance_threshold) {
        errors.push("rebalance.imbalance_threshold must be between 0.0 and 1.0".into());
    }
    if config.reconciler.max_attempts_per_issue == 0 {
        errors.push("reconciler.max_attempts_per_issue must be > 0".into());
    }
    if config.reconciler.history_size == 0 {
        errors.push("reconciler.history_size must be > 0".into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(validate(&OrchestratorConfig::default()).is_ok());
    }

    #[test]
    fn test_bad_pool_sizing_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.pool.min = 20;
        config.pool.max = 5;

        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("pool.min"));
    }

    #[test]
    fn test_errors_accumulate() {
        let mut config = OrchestratorConfig::default();
        config.pool.max = 0;
        config.retry.max_attempts = 0;
        config.heartbeat.timeout_seconds = 1;

        let err = validate(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("pool.max"));
        assert!(message.contains("retry.max_attempts"));
        assert!(message.contains("heartbeat.timeout_seconds"));
    }

    #[test]
    fn test_lock_timeout_upper_bound() {
        let mut config = OrchestratorConfig::default();
        config.pool.lock_timeout_ms = 60_000;

        assert!(validate(&config).is_err());
    }
}
