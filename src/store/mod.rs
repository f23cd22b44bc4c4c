pub mod redis;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

/// Document field carrying the store-assigned id.
pub const PERSISTENCE_ID: &str = "persistenceId";

/// Document collection contract consumed by the engine. Filters are flat
/// maps matched by field equality; writes to one persistence id are
/// last-writer-wins.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Stores a new document, assigns it a persistence id, and returns the
    /// stored form.
    async fn insert(&self, doc: Value) -> Result<Value>;

    /// Replaces the first document matching the filter.
    async fn update(&self, filter: Value, doc: Value) -> Result<()>;

    async fn find_one(&self, filter: Value) -> Result<Option<Value>>;

    async fn find(&self, filter: Value) -> Result<Vec<Value>>;
}

pub(crate) fn matches_filter(doc: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(key, expected)| doc.get(key) == Some(expected)),
        None => true,
    }
}

pub(crate) fn assign_persistence_id(doc: &mut Value) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| anyhow!("only object documents can be stored"))?;
    obj.insert(PERSISTENCE_ID.to_string(), Value::String(id.clone()));
    Ok(id)
}

/// In-memory collection keyed by persistence id.
#[derive(Default)]
pub struct MemoryCollection {
    docs: DashMap<String, Value>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    async fn insert(&self, mut doc: Value) -> Result<Value> {
        let id = assign_persistence_id(&mut doc)?;
        self.docs.insert(id, doc.clone());
        Ok(doc)
    }

    async fn update(&self, filter: Value, doc: Value) -> Result<()> {
        let key = self
            .docs
            .iter()
            .find(|entry| matches_filter(entry.value(), &filter))
            .map(|entry| entry.key().clone());
        match key {
            Some(key) => {
                self.docs.insert(key, doc);
                Ok(())
            }
            None => Err(anyhow!("no document matches update filter {}", filter)),
        }
    }

    async fn find_one(&self, filter: Value) -> Result<Option<Value>> {
        Ok(self
            .docs
            .iter()
            .find(|entry| matches_filter(entry.value(), &filter))
            .map(|entry| entry.value().clone()))
    }

    async fn find(&self, filter: Value) -> Result<Vec<Value>> {
        Ok(self
            .docs
            .iter()
            .filter(|entry| matches_filter(entry.value(), &filter))
            .map(|entry| entry.value().clone())
            .collect())
    }
}

/// The two collections the engine persists into.
#[derive(Clone)]
pub struct ProcessStore {
    pub definitions: Arc<dyn Collection>,
    pub instances: Arc<dyn Collection>,
}

impl ProcessStore {
    pub fn new(definitions: Arc<dyn Collection>, instances: Arc<dyn Collection>) -> Self {
        Self {
            definitions,
            instances,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryCollection::new()),
            Arc::new(MemoryCollection::new()),
        )
    }
}
