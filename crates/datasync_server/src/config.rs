//! Server configuration.

use crate::error::{ServerError, ServerResult};
use crate::scheduler::{DuePolicy, SchedulerConfig};
use datasync_jobs::{QueueConfig, WorkerConfig};
use datasync_protocol::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default scheduler lock name.
pub const DEFAULT_LOCK_NAME: &str = "locks:sync:SyncScheduler";

/// Configuration for the sync server.
///
/// Durations are read and written as milliseconds, with the option names
/// used in JSON configuration files:
///
/// ```rust
/// use datasync_server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::from_json(r#"{"workerInterval": 250}"#).unwrap();
/// assert_eq!(config.worker_interval, Duration::from_millis(250));
/// assert_eq!(config.scheduler_interval, Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Wait between idle polls of each worker.
    #[serde(with = "duration_ms")]
    pub worker_interval: Duration,
    /// Time between two scheduler ticks.
    #[serde(with = "duration_ms")]
    pub scheduler_interval: Duration,
    /// Maximum hold time of the scheduler lock.
    #[serde(with = "duration_ms")]
    pub scheduler_lock_max_time: Duration,
    /// Name of the scheduler lock.
    pub scheduler_lock_name: String,
    /// Lease length used by workers.
    #[serde(with = "duration_ms")]
    pub visibility_timeout: Duration,
    /// Attempts after which a failing item is marked `failed`.
    pub max_attempts: u32,
    /// Time between two prune passes of each queue.
    #[serde(with = "duration_ms")]
    pub prune_interval: Duration,
    /// Age after which finished queue items are pruned.
    #[serde(with = "duration_ms")]
    pub prune_retention: Duration,
    /// When a registration is due for a sync job.
    pub due_policy: DuePolicy,
    /// Sync frequency of registrations whose dataset sets none.
    #[serde(with = "duration_ms")]
    pub default_sync_frequency: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            worker_interval: Duration::from_millis(1000),
            scheduler_interval: Duration::from_millis(500),
            scheduler_lock_max_time: Duration::from_millis(20_000),
            scheduler_lock_name: DEFAULT_LOCK_NAME.to_string(),
            visibility_timeout: Duration::from_millis(30_000),
            max_attempts: 5,
            prune_interval: Duration::from_millis(60_000),
            prune_retention: Duration::from_millis(3_600_000),
            due_policy: DuePolicy::Frequency,
            default_sync_frequency: Duration::from_millis(10_000),
        }
    }

    /// Parses a JSON configuration. Missing options keep their defaults.
    pub fn from_json(json: &str) -> ServerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the worker poll interval.
    pub fn with_worker_interval(mut self, interval: Duration) -> Self {
        self.worker_interval = interval;
        self
    }

    /// Sets the scheduler tick interval.
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    /// Sets the scheduler lock hold time.
    pub fn with_scheduler_lock_max_time(mut self, max_time: Duration) -> Self {
        self.scheduler_lock_max_time = max_time;
        self
    }

    /// Sets the scheduler lock name.
    pub fn with_scheduler_lock_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_lock_name = name.into();
        self
    }

    /// Sets the worker lease length.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the attempts threshold.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the prune interval.
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Sets the prune retention window.
    pub fn with_prune_retention(mut self, retention: Duration) -> Self {
        self.prune_retention = retention;
        self
    }

    /// Sets the due policy.
    pub fn with_due_policy(mut self, policy: DuePolicy) -> Self {
        self.due_policy = policy;
        self
    }

    /// Sets the default sync frequency.
    pub fn with_default_sync_frequency(mut self, frequency: Duration) -> Self {
        self.default_sync_frequency = frequency;
        self
    }

    /// Rejects settings no loop can run with.
    pub fn validate(&self) -> ServerResult<()> {
        let periods = [
            ("workerInterval", self.worker_interval),
            ("schedulerInterval", self.scheduler_interval),
            ("schedulerLockMaxTime", self.scheduler_lock_max_time),
            ("visibilityTimeout", self.visibility_timeout),
            ("pruneInterval", self.prune_interval),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(ServerError::Configuration(format!("{name} must be non-zero")));
            }
        }
        if self.scheduler_lock_name.is_empty() {
            return Err(ServerError::Configuration(
                "schedulerLockName must not be empty".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ServerError::Configuration(
                "maxAttempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Worker settings derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new()
            .with_interval(self.worker_interval)
            .with_visibility_timeout(self.visibility_timeout)
            .with_max_attempts(self.max_attempts)
    }

    /// Queue settings derived from this configuration.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new()
            .with_prune_interval(self.prune_interval)
            .with_retention(self.prune_retention)
    }

    /// Scheduler settings derived from this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            lock_name: self.scheduler_lock_name.clone(),
            interval: self.scheduler_interval,
            lock_max_time: self.scheduler_lock_max_time,
            due_policy: self.due_policy,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.worker_interval, Duration::from_secs(1));
        assert_eq!(config.scheduler_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler_lock_max_time, Duration::from_secs(20));
        assert_eq!(config.scheduler_lock_name, "locks:sync:SyncScheduler");
        assert_eq!(config.due_policy, DuePolicy::Frequency);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_worker_interval(Duration::from_millis(100))
            .with_max_attempts(2)
            .with_due_policy(DuePolicy::EveryTick)
            .with_scheduler_lock_name("locks:test");

        assert_eq!(config.worker_config().interval, Duration::from_millis(100));
        assert_eq!(config.worker_config().max_attempts, 2);
        assert_eq!(config.scheduler_config().due_policy, DuePolicy::EveryTick);
        assert_eq!(config.scheduler_config().lock_name, "locks:test");
    }

    #[test]
    fn json_uses_option_names() {
        let config = ServerConfig::from_json(
            r#"{
                "schedulerInterval": 100,
                "schedulerLockMaxTime": 5000,
                "schedulerLockName": "locks:custom",
                "duePolicy": "everyTick"
            }"#,
        )
        .unwrap();
        assert_eq!(config.scheduler_interval, Duration::from_millis(100));
        assert_eq!(config.scheduler_lock_max_time, Duration::from_secs(5));
        assert_eq!(config.scheduler_lock_name, "locks:custom");
        assert_eq!(config.due_policy, DuePolicy::EveryTick);
        assert_eq!(config.worker_interval, Duration::from_secs(1));

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["workerInterval"], 1000);
        assert_eq!(value["pruneRetention"], 3_600_000);
    }

    #[test]
    fn defaults_are_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_periods_are_rejected() {
        let configs = [
            ServerConfig::new().with_scheduler_interval(Duration::ZERO),
            ServerConfig::new().with_prune_interval(Duration::ZERO),
            ServerConfig::new().with_scheduler_lock_max_time(Duration::ZERO),
            ServerConfig::new().with_worker_interval(Duration::ZERO),
        ];
        for config in configs {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, ServerError::Configuration(_)));
        }

        let config = ServerConfig::from_json(r#"{"schedulerInterval": 0}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("schedulerInterval"));
    }

    #[test]
    fn empty_lock_name_and_zero_attempts_are_rejected() {
        assert!(ServerConfig::new()
            .with_scheduler_lock_name("")
            .validate()
            .is_err());
        assert!(ServerConfig::new().with_max_attempts(0).validate().is_err());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(ServerConfig::from_json(r#"{"workerInterval": "fast"}"#).is_err());
    }
}
