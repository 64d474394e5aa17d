//! Spawn helpers for the gateway's background tasks.
//!
//! Every long-running service (queue worker, polling cycle, watchdog timer)
//! goes through these so task start, end and abnormal termination show up in
//! the log under one name.
use tokio::task::JoinHandle;

/// Spawn a named background task on the current runtime.
pub fn spawn_task<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    log::debug!("Spawning {name} task");
    tokio::task::spawn(async move {
        future.await;
        log::debug!("{name} task finished");
    })
}

/// Run blocking I/O off the async workers.
pub fn spawn_blocking_task<F, R>(func: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(func)
}

/// Wait for a task spawned with [`spawn_task`], logging a panic or abort.
pub async fn join_task(name: &str, handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        if err.is_panic() {
            log::error!("{name} task panicked");
        } else {
            log::warn!("{name} task was aborted: {err}");
        }
    }
}
