//! Timing collaborator.

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};

/// Records how long named operations take and whether they succeeded.
pub trait Metrics: Send + Sync {
    /// Records one finished operation.
    fn record(&self, operation: &str, elapsed: Duration, success: bool);
}

/// Discards every sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record(&self, _operation: &str, _elapsed: Duration, _success: bool) {}
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Operation name.
    pub operation: String,
    /// Wall time spent.
    pub elapsed: Duration,
    /// Whether the operation returned `Ok`.
    pub success: bool,
}

/// Keeps every sample in memory.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    samples: Mutex<Vec<Sample>>,
}

impl MemoryMetrics {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded samples.
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    /// Number of samples recorded for `operation`.
    pub fn count(&self, operation: &str) -> usize {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.operation == operation)
            .count()
    }
}

impl Metrics for MemoryMetrics {
    fn record(&self, operation: &str, elapsed: Duration, success: bool) {
        self.samples.lock().push(Sample {
            operation: operation.to_string(),
            elapsed,
            success,
        });
    }
}

/// Runs `f` and records it under `operation`.
pub fn timed<T, E>(
    metrics: &dyn Metrics,
    operation: &str,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    let start = Instant::now();
    let result = f();
    metrics.record(operation, start.elapsed(), result.is_ok());
    result
}

/// Awaits `fut` and records it under `operation`.
pub async fn timed_async<T, E>(
    metrics: &dyn Metrics,
    operation: &str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, E> {
    let start = Instant::now();
    let result = fut.await;
    metrics.record(operation, start.elapsed(), result.is_ok());
    result
}
