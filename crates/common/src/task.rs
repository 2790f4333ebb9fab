use std::future::Future;

use tokio::task::JoinHandle;

/// Spawns a long-lived pipeline task under its component name (stage,
/// subscriber, paginator) and keeps the live-task gauge for that name
/// current, so `task_count` reads like the process topology.
pub fn spawn_named<F>(name: &'static str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(async move {
        let metric = crate::metrics::TASK_COUNT.with_label_values(&[name]);
        metric.inc();
        let result = future.await;
        metric.dec();
        result
    })
}
