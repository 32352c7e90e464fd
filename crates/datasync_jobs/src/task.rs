//! Background loops with cooperative shutdown.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiving side of a loop's shutdown signal.
pub type Shutdown = watch::Receiver<bool>;

/// A spawned loop that can be stopped and joined.
///
/// Loops observe their [`Shutdown`] only between iterations, so once
/// [`BackgroundTask::stop`] returns no iteration is running.
#[derive(Debug)]
pub struct BackgroundTask {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawns `body` on the current Tokio runtime.
    ///
    /// Must be called from within a runtime context.
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let name = name.into();
        debug!(task = %name, "starting background task");
        Self {
            handle: tokio::spawn(body(rx)),
            name,
            shutdown,
        }
    }

    /// Name of the task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the loop already exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the loop to stop and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = %self.name, error = %e, "background task ended abnormally");
        }
        debug!(task = %self.name, "background task stopped");
    }
}

/// Returns true if shutdown was requested.
pub fn shutdown_requested(shutdown: &Shutdown) -> bool {
    *shutdown.borrow()
}

/// Sleeps for `wait` unless shutdown is requested first.
///
/// Returns true if the loop should exit.
pub async fn sleep_or_shutdown(shutdown: &mut Shutdown, wait: Duration) -> bool {
    if shutdown_requested(shutdown) {
        return true;
    }
    tokio::select! {
        biased;
        changed = shutdown.changed() => changed.is_err() || shutdown_requested(shutdown),
        _ = tokio::time::sleep(wait) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stop_joins_the_loop() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&iterations);
        let task = BackgroundTask::spawn("counter", move |mut shutdown| async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                if sleep_or_shutdown(&mut shutdown, Duration::from_millis(5)).await {
                    break;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        task.stop().await;
        let seen = iterations.load(Ordering::SeqCst);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(iterations.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn long_sleep_is_cut_short() {
        let task = BackgroundTask::spawn("sleeper", |mut shutdown| async move {
            while !sleep_or_shutdown(&mut shutdown, Duration::from_secs(3600)).await {}
        });
        tokio::time::timeout(Duration::from_secs(5), task.stop())
            .await
            .unwrap();
    }
}
