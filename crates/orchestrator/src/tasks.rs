//! Periodic background task harness.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawn a named periodic task. The first tick fires shortly after startup
/// so recovery work does not wait a full period; later ticks follow
/// `period`. The task exits at the next safe point after the shutdown
/// signal flips to true.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        tracing::info!(task = name, period_secs = period.as_secs(), "Background task started");

        let mut delay = Duration::from_secs(1).min(period);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let started = std::time::Instant::now();
                    tick().await;
                    metrics::histogram!("orchestrator.task.duration_seconds", "task" => name)
                        .record(started.elapsed().as_secs_f64());
                    delay = period;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(task = name, "Background task shutting down");
                        break;
                    }
                }
            }
        }
    })
}
