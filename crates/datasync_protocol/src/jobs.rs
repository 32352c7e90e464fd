//! Payloads carried by the sync, pending and ack queues.

use crate::error::ProtocolResult;
use crate::pending::{PendingChange, PendingOutcome};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A value that travels through a queue as a JSON payload.
pub trait JobPayload: Serialize + DeserializeOwned {
    /// Structural checks run after decoding.
    fn validate(&self) -> ProtocolResult<()> {
        Ok(())
    }

    /// Encodes the job for a queue item.
    fn to_payload(&self) -> ProtocolResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes and validates a queue item payload.
    fn from_payload(payload: &serde_json::Value) -> ProtocolResult<Self> {
        let job = Self::deserialize(payload)?;
        job.validate()?;
        Ok(job)
    }
}

/// Recompute the diff for one dataset/client registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    /// Dataset to diff.
    pub dataset_id: String,
    /// Client the diff is for.
    pub client_id: String,
    /// Query parameters of the registration.
    #[serde(default)]
    pub query_params: serde_json::Value,
    /// Metadata of the registration.
    #[serde(default)]
    pub meta_data: serde_json::Value,
}

impl JobPayload for SyncJob {
    fn validate(&self) -> ProtocolResult<()> {
        require("datasetId", &self.dataset_id)?;
        require("clientId", &self.client_id)
    }
}

/// Apply one client-submitted change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJob {
    /// Dataset the change targets.
    pub dataset_id: String,
    /// Submitting client.
    pub client_id: String,
    /// Metadata forwarded to the dataset handlers.
    #[serde(default)]
    pub meta_data: serde_json::Value,
    /// The change itself.
    pub change: PendingChange,
}

impl JobPayload for PendingJob {
    fn validate(&self) -> ProtocolResult<()> {
        require("datasetId", &self.dataset_id)?;
        require("clientId", &self.client_id)?;
        self.change.validate()
    }
}

/// Work for the ack processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AckJob {
    /// Make a processed change's outcome deliverable to its client.
    Publish(PendingOutcome),
    /// The client confirmed receipt of these outcomes.
    #[serde(rename_all = "camelCase")]
    Acknowledge {
        /// Dataset of the outcomes.
        dataset_id: String,
        /// Acknowledging client.
        client_id: String,
        /// Change identifiers being acknowledged.
        hashes: Vec<String>,
    },
}

impl JobPayload for AckJob {
    fn validate(&self) -> ProtocolResult<()> {
        match self {
            Self::Publish(outcome) => {
                require("datasetId", &outcome.dataset_id)?;
                require("clientId", &outcome.client_id)
            }
            Self::Acknowledge {
                dataset_id,
                client_id,
                ..
            } => {
                require("datasetId", dataset_id)?;
                require("clientId", client_id)
            }
        }
    }
}

fn require(field: &'static str, value: &str) -> ProtocolResult<()> {
    if value.is_empty() {
        return Err(crate::ProtocolError::invalid(field, "must not be empty"));
    }
    Ok(())
}
