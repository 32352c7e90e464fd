//! Dataset handlers and the dataset registry.
//!
//! Each dataset resolves its [`DatasetHandlers`] once, when it is
//! initialised. Datasets that were never initialised use the global default.

use crate::error::{ServerError, ServerResult};
use datasync_protocol::{Collision, DatasetRecord};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Authoritative record storage for datasets.
///
/// `meta` is the opaque metadata the client sent with its request.
pub trait DatasetHandlers: Send + Sync {
    /// Creates a record. An existing record with the same uid is replaced.
    fn create(
        &self,
        dataset_id: &str,
        uid: &str,
        data: Value,
        meta: &Value,
    ) -> ServerResult<DatasetRecord>;

    /// Reads a record.
    fn read(&self, dataset_id: &str, uid: &str, meta: &Value)
        -> ServerResult<Option<DatasetRecord>>;

    /// Replaces the value of an existing record.
    fn update(
        &self,
        dataset_id: &str,
        uid: &str,
        data: Value,
        meta: &Value,
    ) -> ServerResult<DatasetRecord>;

    /// Deletes a record and returns its last value.
    fn delete(&self, dataset_id: &str, uid: &str, meta: &Value)
        -> ServerResult<Option<DatasetRecord>>;

    /// Records matching `query_params`.
    fn list(
        &self,
        dataset_id: &str,
        query_params: &Value,
        meta: &Value,
    ) -> ServerResult<Vec<DatasetRecord>>;

    /// Stores a detected collision.
    fn handle_collision(&self, collision: Collision, meta: &Value) -> ServerResult<()>;

    /// Stored collisions of a dataset.
    fn list_collisions(&self, dataset_id: &str, meta: &Value) -> ServerResult<Vec<Collision>>;

    /// Removes the collisions recorded under `hash`. Returns false if there
    /// were none.
    fn remove_collision(&self, dataset_id: &str, hash: &str, meta: &Value) -> ServerResult<bool>;
}

/// In-memory [`DatasetHandlers`], the global default.
#[derive(Debug, Default)]
pub struct MemoryDatasetHandlers {
    records: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    collisions: RwLock<HashMap<String, Vec<Collision>>>,
}

impl MemoryDatasetHandlers {
    /// Creates empty handlers.
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_query(data: &Value, query_params: &Value) -> bool {
    match query_params.as_object() {
        Some(query) => query.iter().all(|(key, expected)| data.get(key) == Some(expected)),
        None => true,
    }
}

impl DatasetHandlers for MemoryDatasetHandlers {
    fn create(
        &self,
        dataset_id: &str,
        uid: &str,
        data: Value,
        _meta: &Value,
    ) -> ServerResult<DatasetRecord> {
        self.records
            .write()
            .entry(dataset_id.to_string())
            .or_default()
            .insert(uid.to_string(), data.clone());
        Ok(DatasetRecord::new(uid, data))
    }

    fn read(
        &self,
        dataset_id: &str,
        uid: &str,
        _meta: &Value,
    ) -> ServerResult<Option<DatasetRecord>> {
        Ok(self
            .records
            .read()
            .get(dataset_id)
            .and_then(|records| records.get(uid))
            .map(|data| DatasetRecord::new(uid, data.clone())))
    }

    fn update(
        &self,
        dataset_id: &str,
        uid: &str,
        data: Value,
        _meta: &Value,
    ) -> ServerResult<DatasetRecord> {
        let mut records = self.records.write();
        let slot = records
            .get_mut(dataset_id)
            .and_then(|records| records.get_mut(uid))
            .ok_or_else(|| {
                ServerError::Handler(format!("record {uid} not found in {dataset_id}"))
            })?;
        *slot = data.clone();
        Ok(DatasetRecord::new(uid, data))
    }

    fn delete(
        &self,
        dataset_id: &str,
        uid: &str,
        _meta: &Value,
    ) -> ServerResult<Option<DatasetRecord>> {
        Ok(self
            .records
            .write()
            .get_mut(dataset_id)
            .and_then(|records| records.remove(uid))
            .map(|data| DatasetRecord::new(uid, data)))
    }

    fn list(
        &self,
        dataset_id: &str,
        query_params: &Value,
        _meta: &Value,
    ) -> ServerResult<Vec<DatasetRecord>> {
        let records = self.records.read();
        let Some(records) = records.get(dataset_id) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .filter(|(_, data)| matches_query(data, query_params))
            .map(|(uid, data)| DatasetRecord::new(uid.clone(), data.clone()))
            .collect())
    }

    fn handle_collision(&self, collision: Collision, _meta: &Value) -> ServerResult<()> {
        self.collisions
            .write()
            .entry(collision.dataset_id.clone())
            .or_default()
            .push(collision);
        Ok(())
    }

    fn list_collisions(&self, dataset_id: &str, _meta: &Value) -> ServerResult<Vec<Collision>> {
        Ok(self
            .collisions
            .read()
            .get(dataset_id)
            .cloned()
            .unwrap_or_default())
    }

    fn remove_collision(&self, dataset_id: &str, hash: &str, _meta: &Value) -> ServerResult<bool> {
        let mut collisions = self.collisions.write();
        let Some(list) = collisions.get_mut(dataset_id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|c| c.hash != hash);
        Ok(list.len() != before)
    }
}

/// Options for [`crate::SyncServer::init_dataset`].
#[derive(Clone, Default)]
pub struct DatasetOptions {
    handlers: Option<Arc<dyn DatasetHandlers>>,
    sync_frequency: Option<Duration>,
}

impl DatasetOptions {
    /// Options that use the global defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the handlers for this dataset.
    pub fn with_handlers(mut self, handlers: Arc<dyn DatasetHandlers>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Sets how often each client registration is re-diffed.
    pub fn with_sync_frequency(mut self, frequency: Duration) -> Self {
        self.sync_frequency = Some(frequency);
        self
    }
}

impl std::fmt::Debug for DatasetOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetOptions")
            .field("custom_handlers", &self.handlers.is_some())
            .field("sync_frequency", &self.sync_frequency)
            .finish()
    }
}

/// A dataset with its resolved handlers.
#[derive(Clone)]
pub struct Dataset {
    /// Dataset identifier.
    pub id: String,
    /// Handlers used for every record operation on this dataset.
    pub handlers: Arc<dyn DatasetHandlers>,
    /// Sync frequency of new registrations.
    pub sync_frequency: Duration,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("sync_frequency", &self.sync_frequency)
            .finish()
    }
}

/// Registry of initialised datasets.
pub struct Datasets {
    default_handlers: Arc<dyn DatasetHandlers>,
    default_frequency: Duration,
    datasets: RwLock<HashMap<String, Dataset>>,
}

impl Datasets {
    /// Creates a registry with the global defaults.
    pub fn new(default_handlers: Arc<dyn DatasetHandlers>, default_frequency: Duration) -> Self {
        Self {
            default_handlers,
            default_frequency,
            datasets: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or re-registers) a dataset, resolving its handlers now.
    pub fn init(&self, dataset_id: &str, options: DatasetOptions) -> Dataset {
        let dataset = Dataset {
            id: dataset_id.to_string(),
            handlers: options
                .handlers
                .unwrap_or_else(|| Arc::clone(&self.default_handlers)),
            sync_frequency: options.sync_frequency.unwrap_or(self.default_frequency),
        };
        self.datasets
            .write()
            .insert(dataset_id.to_string(), dataset.clone());
        dataset
    }

    /// An initialised dataset.
    pub fn get(&self, dataset_id: &str) -> Option<Dataset> {
        self.datasets.read().get(dataset_id).cloned()
    }

    /// The dataset if initialised, otherwise one using the global defaults.
    pub fn resolve(&self, dataset_id: &str) -> Dataset {
        self.get(dataset_id).unwrap_or_else(|| Dataset {
            id: dataset_id.to_string(),
            handlers: Arc::clone(&self.default_handlers),
            sync_frequency: self.default_frequency,
        })
    }

    /// Identifiers of initialised datasets, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.datasets.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for Datasets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datasets")
            .field("datasets", &self.ids())
            .field("default_frequency", &self.default_frequency)
            .finish()
    }
}
