use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::definition::ProcessDefinition;
use crate::runtime::instance::{InstanceDocument, InstanceStatus, ProcessInstance};
use crate::runtime::node::{TaskRegistry, TaskTypeDefinition};
use crate::store::{ProcessStore, PERSISTENCE_ID};
use crate::tasks::common::{EndTaskDefinition, StartTaskDefinition};
use crate::tasks::decision::DecisionTaskDefinition;
use crate::tasks::service::ServiceTaskDefinition;

/// Process-wide entry point: owns the task-type registry, the store handles,
/// and the pool of live instances.
pub struct Engine {
    registry: Arc<TaskRegistry>,
    instances: DashMap<u64, Arc<Mutex<ProcessInstance>>>,
    definition_refs: Arc<DashMap<String, String>>,
    store: ProcessStore,
    next_id: AtomicU64,
}

impl Engine {
    pub fn new() -> Self {
        Self::new_with_store(ProcessStore::in_memory())
    }

    pub fn new_with_store(store: ProcessStore) -> Self {
        let mut registry = TaskRegistry::new();
        registry.register(Box::new(StartTaskDefinition));
        registry.register(Box::new(EndTaskDefinition));
        registry.register(Box::new(ServiceTaskDefinition));
        registry.register(Box::new(DecisionTaskDefinition));
        Self {
            registry: Arc::new(registry),
            instances: DashMap::new(),
            definition_refs: Arc::new(DashMap::new()),
            store,
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a task-type plugin. The registry is shared with every
    /// instance, so registration is only possible before the first instance
    /// is created.
    pub fn register_task_type(&mut self, definition: Box<dyn TaskTypeDefinition>) -> Result<()> {
        match Arc::get_mut(&mut self.registry) {
            Some(registry) => {
                registry.register(definition);
                Ok(())
            }
            None => bail!("task types must be registered before instances are created"),
        }
    }

    /// Creates a new instance in the NEW state and adds it to the live pool.
    pub fn create_process_instance(
        &self,
        definition: ProcessDefinition,
    ) -> Arc<Mutex<ProcessInstance>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let definition_ref = self
            .definition_refs
            .get(&definition.id)
            .map(|r| r.value().clone());
        let instance = ProcessInstance::new(
            id,
            Arc::new(definition),
            definition_ref,
            self.registry.clone(),
            self.store.clone(),
            self.definition_refs.clone(),
        );
        let handle = Arc::new(Mutex::new(instance));
        self.instances.insert(id, handle.clone());
        debug!(instance_id = id, "process instance created");
        handle
    }

    /// Delivers an external completion to a waiting task, loading the
    /// instance from the store if it is not live.
    pub async fn complete_task(
        &self,
        process_id: u64,
        task_id: usize,
        variables: Option<HashMap<String, Value>>,
    ) -> Result<()> {
        let handle = self
            .load_process_instance(process_id)
            .await?
            .ok_or_else(|| anyhow!("process instance {} not found", process_id))?;
        let mut instance = handle.lock().await;
        instance.resume_task(task_id, variables).await
    }

    /// Delivers an external failure to a waiting task; the instance fails.
    pub async fn fail_task(&self, process_id: u64, task_id: usize, error: String) -> Result<()> {
        let handle = self
            .load_process_instance(process_id)
            .await?
            .ok_or_else(|| anyhow!("process instance {} not found", process_id))?;
        let mut instance = handle.lock().await;
        instance.fail_task(task_id, error).await
    }

    /// Returns the live instance, or rehydrates it from the store.
    pub async fn load_process_instance(
        &self,
        id: u64,
    ) -> Result<Option<Arc<Mutex<ProcessInstance>>>> {
        if let Some(handle) = self.instances.get(&id) {
            return Ok(Some(handle.clone()));
        }
        let Some(doc) = self.store.instances.find_one(json!({ "id": id })).await? else {
            return Ok(None);
        };
        let entity: InstanceDocument = serde_json::from_value(doc)?;
        let definition_ref = entity
            .definition_ref
            .clone()
            .ok_or_else(|| anyhow!("persisted instance {} has no definition reference", id))?;
        let definition_doc = self
            .store
            .definitions
            .find_one(json!({ PERSISTENCE_ID: &definition_ref }))
            .await?
            .ok_or_else(|| {
                anyhow!("definition {} referenced by instance {} not found", definition_ref, id)
            })?;
        let definition: ProcessDefinition = serde_json::from_value(definition_doc)?;
        self.definition_refs
            .insert(definition.id.clone(), definition_ref);

        let instance = ProcessInstance::deserialize(
            entity,
            Arc::new(definition),
            self.registry.clone(),
            self.store.clone(),
            self.definition_refs.clone(),
        )?;
        // keep allocated ids ahead of everything ever persisted
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
        info!(instance_id = id, "process instance rehydrated from store");

        let handle = Arc::new(Mutex::new(instance));
        let handle = self
            .instances
            .entry(id)
            .or_insert_with(|| handle)
            .clone();
        Ok(Some(handle))
    }

    /// Pass-through to the instance collection's find.
    pub async fn query_process_instances(&self, filter: Value) -> Result<Vec<Value>> {
        self.store.instances.find(filter).await
    }

    /// Evicts waiting and completed instances from the live pool; running
    /// and failed instances are retained.
    pub async fn clear_pool(&self) {
        let handles: Vec<(u64, Arc<Mutex<ProcessInstance>>)> = self
            .instances
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (id, handle) in handles {
            let status = handle.lock().await.status();
            if matches!(status, InstanceStatus::Waiting | InstanceStatus::Completed) {
                self.instances.remove(&id);
                debug!(instance_id = id, ?status, "instance evicted from live pool");
            }
        }
    }

    pub fn is_pooled(&self, id: u64) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn pool_len(&self) -> usize {
        self.instances.len()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
