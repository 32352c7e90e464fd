//! Configuration for queues and workers.

use std::time::Duration;

/// Configuration for a durable queue's prune job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Time between two prune passes.
    pub prune_interval: Duration,
    /// Terminal items older than this are deleted.
    pub retention: Duration,
}

impl QueueConfig {
    /// Creates a configuration with the default prune interval and retention.
    pub fn new() -> Self {
        Self {
            prune_interval: Duration::from_secs(60),
            retention: Duration::from_secs(60 * 60),
        }
    }

    /// Sets the prune interval.
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Sets the retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a polling worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Wait between polls that found nothing to do.
    pub interval: Duration,
    /// How long a leased item stays invisible to other workers.
    pub visibility_timeout: Duration,
    /// Attempts after which a failing item is marked `failed`.
    pub max_attempts: u32,
}

impl WorkerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 5,
        }
    }

    /// Sets the idle poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the lease length.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the attempts threshold. Values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_builder() {
        let config = WorkerConfig::new()
            .with_interval(Duration::from_millis(50))
            .with_visibility_timeout(Duration::from_secs(5))
            .with_max_attempts(3);

        assert_eq!(config.interval, Duration::from_millis(50));
        assert_eq!(config.visibility_timeout, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        assert_eq!(WorkerConfig::new().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.prune_interval, Duration::from_secs(60));
        assert_eq!(config.retention, Duration::from_secs(3600));
    }
}
