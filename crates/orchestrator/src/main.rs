use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;

use aircheck_orchestrator::api::{self, AppState};
use aircheck_orchestrator::config;
use aircheck_orchestrator::db::Db;
use aircheck_orchestrator::failover::FailoverController;
use aircheck_orchestrator::placement::Placement;
use aircheck_orchestrator::reconciler::Reconciler;
use aircheck_orchestrator::registry::WorkerRegistry;
use aircheck_orchestrator::tasks;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Aircheck orchestrator starting");

    // Load configuration — fail loudly on misconfiguration.
    let config_dir = std::env::var("ORCHESTRATOR_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let config = match config::load_config(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration — refusing to start");
            std::process::exit(1);
        }
    };

    // Install Prometheus metrics recorder.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    // PostgreSQL
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        tracing::error!("DATABASE_URL is not set — refusing to start");
        std::process::exit(1);
    };

    let db = match Db::connect(
        &database_url,
        config.pool.clone(),
        config.retry.clone(),
        &config.tx,
    )
    .await
    {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            std::process::exit(1);
        }
    };

    if let Err(e) = db.migrate().await {
        tracing::error!(error = %e, "Failed to run PostgreSQL migrations");
        std::process::exit(1);
    }

    tracing::info!("Database connected and migrated");

    // Components are passed explicitly; no process-wide singletons.
    let registry = Arc::new(WorkerRegistry::new(
        Arc::clone(&db),
        config.heartbeat.timeout_seconds,
    ));
    let placement = Arc::new(Placement::new(
        Arc::clone(&db),
        config.heartbeat.timeout_seconds,
        config.rebalance.imbalance_threshold,
    ));
    let failover = Arc::new(FailoverController::new(
        Arc::clone(&db),
        config.heartbeat.timeout_seconds,
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        Arc::clone(&placement),
        Arc::clone(&failover),
        config.heartbeat.timeout_seconds,
        config.rebalance.imbalance_threshold,
        config.reconciler.max_attempts_per_issue,
        config.reconciler.history_size,
    ));

    // Background loops share one shutdown signal and exit between ticks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut task_handles = Vec::new();

    {
        let monitor = Arc::clone(db.monitor());
        task_handles.push(tasks::spawn_periodic(
            "tx_monitor",
            Duration::from_secs(config.tx.monitor_period_seconds),
            shutdown_rx.clone(),
            move || {
                let monitor = Arc::clone(&monitor);
                async move { monitor.scan() }
            },
        ));
    }

    {
        let registry = Arc::clone(&registry);
        task_handles.push(tasks::spawn_periodic(
            "stale_sweep",
            Duration::from_secs(config.heartbeat.sweep_period_seconds),
            shutdown_rx.clone(),
            move || {
                let registry = Arc::clone(&registry);
                async move {
                    if let Err(e) = registry.mark_stale(registry.staleness_cutoff()).await {
                        tracing::warn!(error = %e, "Stale-worker sweep failed");
                    }
                }
            },
        ));
    }

    {
        let failover = Arc::clone(&failover);
        task_handles.push(tasks::spawn_periodic(
            "failover",
            Duration::from_secs(config.failover.period_seconds),
            shutdown_rx.clone(),
            move || {
                let failover = Arc::clone(&failover);
                async move {
                    if let Err(e) = failover.run_cycle().await {
                        tracing::warn!(error = %e, "Failover cycle failed");
                    }
                }
            },
        ));
    }

    {
        let reconciler = Arc::clone(&reconciler);
        task_handles.push(tasks::spawn_periodic(
            "reconciler",
            Duration::from_secs(config.reconciler.period_seconds),
            shutdown_rx.clone(),
            move || {
                let reconciler = Arc::clone(&reconciler);
                async move {
                    if let Err(e) = reconciler.run_cycle().await {
                        tracing::warn!(error = %e, "Reconciliation cycle failed");
                    }
                }
            },
        ));
    }

    {
        let placement = Arc::clone(&placement);
        task_handles.push(tasks::spawn_periodic(
            "rebalance_eval",
            Duration::from_secs(config.rebalance.period_seconds),
            shutdown_rx.clone(),
            move || {
                let placement = Arc::clone(&placement);
                async move {
                    if let Err(e) = placement.evaluate_imbalance().await {
                        tracing::warn!(error = %e, "Imbalance evaluation failed");
                    }
                }
            },
        ));
    }

    let state = Arc::new(AppState {
        db,
        registry,
        placement,
        reconciler,
        metrics_handle,
    });

    let app = api::router(state);

    let port: u16 = std::env::var("ORCHESTRATOR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8090);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(port, error = %e, "Failed to bind TCP listener");
            std::process::exit(1);
        }
    };

    tracing::info!(port, "Aircheck orchestrator listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "HTTP server error");
        std::process::exit(1);
    }

    // Stop background loops and wait for them to reach a safe point.
    let _ = shutdown_tx.send(true);
    for handle in task_handles {
        let _ = handle.await;
    }

    tracing::info!("Aircheck orchestrator stopped");
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
