mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::db::Db;
use crate::placement::Placement;
use crate::reconciler::Reconciler;
use crate::registry::WorkerRegistry;

/// Shared application state accessible from axum handlers.
pub struct AppState {
    pub db: Arc<Db>,
    pub registry: Arc<WorkerRegistry>,
    pub placement: Arc<Placement>,
    pub reconciler: Arc<Reconciler>,
    pub metrics_handle: PrometheusHandle,
}

/// Build the control-plane router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/register", post(handlers::register))
        .route("/heartbeat", post(handlers::heartbeat))
        .route("/assign_streams", post(handlers::assign_streams))
        .route("/release_streams", post(handlers::release_streams))
        .route("/diagnostic", post(handlers::diagnostic))
        .route("/status", get(handlers::status))
        .route("/instances", get(handlers::instances))
        .route("/instances/{worker_id}", get(handlers::instance))
        .route("/stream_assignments", get(handlers::stream_assignments))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_export))
        .with_state(state)
}
