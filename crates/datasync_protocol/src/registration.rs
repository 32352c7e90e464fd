//! Managed dataset-client sync subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One managed sync subscription of a client to a dataset.
///
/// Created on the first sync request of a dataset/client pair, disabled
/// (never deleted) when the dataset is stopped, and re-activated when the
/// dataset is initialised again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetClientRegistration {
    /// Stable key, see [`DatasetClientRegistration::key`].
    pub id: String,
    /// Dataset the client syncs.
    pub dataset_id: String,
    /// Client identifier.
    pub client_id: String,
    /// Query parameters the client lists the dataset with.
    pub query_params: serde_json::Value,
    /// Opaque metadata forwarded to dataset handlers.
    pub meta_data: serde_json::Value,
    /// Whether scheduled syncing is disabled.
    pub stopped: bool,
    /// When the scheduler last enqueued a sync job.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Minimum time between two scheduled sync jobs.
    #[serde(with = "crate::duration_ms")]
    pub sync_frequency: Duration,
    /// When a sync job last completed for this registration.
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Dataset hash written by the last completed sync job.
    pub global_hash: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl DatasetClientRegistration {
    /// Creates an active registration that is due immediately.
    pub fn new(
        dataset_id: impl Into<String>,
        client_id: impl Into<String>,
        sync_frequency: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let dataset_id = dataset_id.into();
        let client_id = client_id.into();
        Self {
            id: Self::key(&dataset_id, &client_id),
            dataset_id,
            client_id,
            query_params: serde_json::Value::Null,
            meta_data: serde_json::Value::Null,
            stopped: false,
            last_sync_at: None,
            sync_frequency,
            last_processed_at: None,
            global_hash: None,
            created_at: now,
        }
    }

    /// Sets the query parameters.
    pub fn with_query_params(mut self, query_params: serde_json::Value) -> Self {
        self.query_params = query_params;
        self
    }

    /// Sets the metadata.
    pub fn with_meta_data(mut self, meta_data: serde_json::Value) -> Self {
        self.meta_data = meta_data;
        self
    }

    /// Registration key of a dataset/client pair.
    pub fn key(dataset_id: &str, client_id: &str) -> String {
        format!("{}:{}", dataset_id, client_id)
    }

    /// Returns true if `sync_frequency` has elapsed since `last_sync_at`.
    ///
    /// Stopped registrations are never due; registrations that were never
    /// scheduled are always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.stopped {
            return false;
        }
        match self.last_sync_at {
            None => true,
            Some(last) => (now - last).to_std().unwrap_or_default() >= self.sync_frequency,
        }
    }
}

/// Selects registrations. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationFilter {
    /// Only this dataset.
    pub dataset_id: Option<String>,
    /// Only this client.
    pub client_id: Option<String>,
    /// Only registrations with this `stopped` flag.
    pub stopped: Option<bool>,
}

impl RegistrationFilter {
    /// Matches every registration.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches every registration of a dataset.
    pub fn dataset(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: Some(dataset_id.into()),
            ..Self::default()
        }
    }

    /// Matches exactly one dataset/client pair.
    pub fn pair(dataset_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            dataset_id: Some(dataset_id.into()),
            client_id: Some(client_id.into()),
            stopped: None,
        }
    }

    /// Matches registrations that are not stopped.
    pub fn active() -> Self {
        Self {
            stopped: Some(false),
            ..Self::default()
        }
    }

    /// Returns true if `registration` is selected.
    pub fn matches(&self, registration: &DatasetClientRegistration) -> bool {
        self.dataset_id
            .as_ref()
            .map_or(true, |id| *id == registration.dataset_id)
            && self
                .client_id
                .as_ref()
                .map_or(true, |id| *id == registration.client_id)
            && self.stopped.map_or(true, |s| s == registration.stopped)
    }
}

/// Partial update applied to selected registrations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationPatch {
    /// New `stopped` flag.
    pub stopped: Option<bool>,
    /// New `last_sync_at`.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// New `last_processed_at`.
    pub last_processed_at: Option<DateTime<Utc>>,
    /// New `global_hash`.
    pub global_hash: Option<String>,
    /// New `sync_frequency`.
    pub sync_frequency: Option<Duration>,
}

impl RegistrationPatch {
    /// Patch toggling the `stopped` flag.
    pub fn stopped(stopped: bool) -> Self {
        Self {
            stopped: Some(stopped),
            ..Self::default()
        }
    }

    /// Patch recording that a sync job was scheduled at `at`.
    pub fn scheduled(at: DateTime<Utc>) -> Self {
        Self {
            last_sync_at: Some(at),
            ..Self::default()
        }
    }

    /// Patch recording a completed sync job.
    pub fn processed(at: DateTime<Utc>, global_hash: impl Into<String>) -> Self {
        Self {
            last_processed_at: Some(at),
            global_hash: Some(global_hash.into()),
            ..Self::default()
        }
    }

    /// Sets the new sync frequency.
    pub fn with_sync_frequency(mut self, frequency: Duration) -> Self {
        self.sync_frequency = Some(frequency);
        self
    }

    /// Applies the patch in place.
    pub fn apply(&self, registration: &mut DatasetClientRegistration) {
        if let Some(stopped) = self.stopped {
            registration.stopped = stopped;
        }
        if let Some(at) = self.last_sync_at {
            registration.last_sync_at = Some(at);
        }
        if let Some(at) = self.last_processed_at {
            registration.last_processed_at = Some(at);
        }
        if let Some(hash) = &self.global_hash {
            registration.global_hash = Some(hash.clone());
        }
        if let Some(frequency) = self.sync_frequency {
            registration.sync_frequency = frequency;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn registration(now: DateTime<Utc>) -> DatasetClientRegistration {
        DatasetClientRegistration::new("todos", "device-1", Duration::from_secs(10), now)
    }

    #[test]
    fn key_combines_dataset_and_client() {
        let reg = registration(Utc::now());
        assert_eq!(reg.id, "todos:device-1");
    }

    #[test]
    fn due_check_follows_frequency() {
        let now = Utc::now();
        let mut reg = registration(now);
        assert!(reg.is_due(now));

        reg.last_sync_at = Some(now);
        assert!(!reg.is_due(now + ChronoDuration::seconds(9)));
        assert!(reg.is_due(now + ChronoDuration::seconds(10)));

        reg.stopped = true;
        assert!(!reg.is_due(now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn clock_skew_does_not_make_registration_due() {
        let now = Utc::now();
        let mut reg = registration(now);
        reg.last_sync_at = Some(now + ChronoDuration::seconds(30));
        assert!(!reg.is_due(now));
    }

    #[test]
    fn filter_matching() {
        let reg = registration(Utc::now());
        assert!(RegistrationFilter::all().matches(&reg));
        assert!(RegistrationFilter::dataset("todos").matches(&reg));
        assert!(!RegistrationFilter::dataset("notes").matches(&reg));
        assert!(RegistrationFilter::pair("todos", "device-1").matches(&reg));
        assert!(!RegistrationFilter::pair("todos", "device-2").matches(&reg));
        assert!(RegistrationFilter::active().matches(&reg));
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let now = Utc::now();
        let mut reg = registration(now);
        RegistrationPatch::processed(now, "abc").apply(&mut reg);
        assert_eq!(reg.global_hash.as_deref(), Some("abc"));
        assert_eq!(reg.last_processed_at, Some(now));
        assert!(reg.last_sync_at.is_none());
        assert!(!reg.stopped);

        RegistrationPatch::stopped(true)
            .with_sync_frequency(Duration::from_secs(1))
            .apply(&mut reg);
        assert!(reg.stopped);
        assert_eq!(reg.sync_frequency, Duration::from_secs(1));
        assert_eq!(reg.global_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn serializes_frequency_as_millis() {
        let reg = registration(Utc::now());
        let value = serde_json::to_value(&reg).unwrap();
        assert_eq!(value["syncFrequency"], 10_000);
        assert_eq!(value["datasetId"], "todos");
    }
}
