//! Millisecond encoding for `std::time::Duration` fields.

/// Serde adapter storing a `Duration` as whole milliseconds.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize, Deserialize)]
/// struct Timer {
///     #[serde(with = "datasync_protocol::duration_ms")]
///     every: Duration,
/// }
///
/// let timer: Timer = serde_json::from_str(r#"{"every": 1500}"#).unwrap();
/// assert_eq!(timer.every, Duration::from_millis(1500));
/// ```
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserializes milliseconds into a duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
