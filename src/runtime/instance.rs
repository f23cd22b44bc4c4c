use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::definition::{FlowDef, ProcessDefinition, TaskDef, END_TASK};
use crate::runtime::events::{InstanceEvent, Listeners};
use crate::runtime::node::{Node, NodeContext, NodeDocument, Outcome, TaskRegistry};
use crate::store::{ProcessStore, PERSISTENCE_ID};

/// Lifecycle states of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    New,
    Running,
    Waiting,
    Completed,
    Failed,
}

/// Persisted form of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_id: Option<String>,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_ref: Option<String>,
    pub status: InstanceStatus,
    pub variables: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub node_pool: Vec<NodeDocument>,
}

/// One execution of a process definition. Owns the live node pool and the
/// variables map, drives token propagation, and writes itself through the
/// instance collection on every status change.
pub struct ProcessInstance {
    id: u64,
    persistence_id: Option<String>,
    definition: Arc<ProcessDefinition>,
    definition_ref: Option<String>,
    status: InstanceStatus,
    variables: HashMap<String, Value>,
    error: Option<String>,
    node_pool: HashMap<usize, Node>,
    listeners: Listeners,
    registry: Arc<TaskRegistry>,
    store: ProcessStore,
    /// Definition id to persistence ref, shared across the engine so one
    /// definition document serves all its instances.
    definition_refs: Arc<DashMap<String, String>>,
}

impl ProcessInstance {
    pub(crate) fn new(
        id: u64,
        definition: Arc<ProcessDefinition>,
        definition_ref: Option<String>,
        registry: Arc<TaskRegistry>,
        store: ProcessStore,
        definition_refs: Arc<DashMap<String, String>>,
    ) -> Self {
        Self {
            id,
            persistence_id: None,
            definition,
            definition_ref,
            status: InstanceStatus::New,
            variables: HashMap::new(),
            error: None,
            node_pool: HashMap::new(),
            listeners: Listeners::new(),
            registry,
            store,
            definition_refs,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn persistence_id(&self) -> Option<&str> {
        self.persistence_id.as_deref()
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    /// Registers a synchronous observer for `before`/`after`/`end` events.
    pub fn on_event(&mut self, listener: impl Fn(&InstanceEvent) + Send + Sync + 'static) {
        self.listeners.subscribe(Box::new(listener));
    }

    fn emit(&self, event: InstanceEvent) {
        self.listeners.emit(self.id, &event);
    }

    /// Locates a live node by task name, for callers that know the waiting
    /// task by name rather than id.
    pub fn get_node(&self, task_name: &str) -> Option<&Node> {
        self.node_pool.values().find(|node| {
            self.definition
                .task(node.task_id)
                .is_some_and(|task| task.name == task_name)
        })
    }

    /// Starts the instance: persists the definition on first use, seeds the
    /// variables, and runs the entry task.
    pub async fn start(&mut self, variables: Option<HashMap<String, Value>>) -> Result<()> {
        if self.status != InstanceStatus::New {
            bail!(
                "process instance {} was already started (status {:?})",
                self.id,
                self.status
            );
        }
        if self.definition_ref.is_none() {
            self.persist_definition().await?;
        }
        self.variables = variables.unwrap_or_else(|| self.definition.default_variables.clone());
        self.change_status(InstanceStatus::Running, None).await?;
        info!(instance_id = self.id, definition = %self.definition.id, "process instance started");

        let entry = self
            .definition
            .task(0)
            .ok_or_else(|| anyhow!("definition '{}' has no entry task", self.definition.id))?;
        let node = self.create_node(entry)?;
        self.node_pool.insert(0, node);
        self.drive(VecDeque::from([0])).await
    }

    async fn persist_definition(&mut self) -> Result<()> {
        if let Some(existing) = self.definition_refs.get(&self.definition.id) {
            self.definition_ref = Some(existing.value().clone());
            return Ok(());
        }
        let doc = serde_json::to_value(self.definition.as_ref())?;
        let stored = self.store.definitions.insert(doc).await?;
        let reference = stored
            .get(PERSISTENCE_ID)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("definition store returned no persistence id"))?
            .to_string();
        self.definition_refs
            .insert(self.definition.id.clone(), reference.clone());
        self.definition_ref = Some(reference);
        Ok(())
    }

    pub(crate) fn create_node(&self, task: &TaskDef) -> Result<Node> {
        let behavior = self.registry.create(task)?;
        Ok(Node::new(task.id, behavior))
    }

    /// Delivers an external completion to a live node. The first delivery
    /// wins; a duplicate is discarded with a warning.
    pub async fn resume_task(
        &mut self,
        task_id: usize,
        variables: Option<HashMap<String, Value>>,
    ) -> Result<()> {
        if matches!(
            self.status,
            InstanceStatus::Completed | InstanceStatus::Failed
        ) {
            bail!(
                "process instance {} is {:?} and accepts no completions",
                self.id,
                self.status
            );
        }
        let mut node = self.node_pool.remove(&task_id).ok_or_else(|| {
            anyhow!(
                "task {} is not active on instance {} (already completed or never reached)",
                task_id,
                self.id
            )
        })?;
        if !node.behavior.resolve() {
            warn!(
                instance_id = self.id,
                task = task_id,
                "discarding completion for a task that is not awaiting one"
            );
            self.node_pool.insert(task_id, node);
            return Ok(());
        }
        if self.status == InstanceStatus::Waiting {
            self.change_status(InstanceStatus::Running, None).await?;
        }
        let mut queue = VecDeque::new();
        self.complete_node(node, variables, &mut queue).await?;
        self.drive(queue).await
    }

    /// Delivers an external failure to a live node: the instance fails
    /// without the node completing.
    pub async fn fail_task(&mut self, task_id: usize, error: String) -> Result<()> {
        if matches!(
            self.status,
            InstanceStatus::Completed | InstanceStatus::Failed
        ) {
            bail!(
                "process instance {} is {:?} and accepts no completions",
                self.id,
                self.status
            );
        }
        let resolved = match self.node_pool.get_mut(&task_id) {
            Some(node) => node.behavior.resolve(),
            None => bail!("task {} is not active on instance {}", task_id, self.id),
        };
        if !resolved {
            warn!(
                instance_id = self.id,
                task = task_id,
                "discarding failure for a task that is not awaiting completion"
            );
            return Ok(());
        }
        self.fail(anyhow!(error)).await
    }

    /// Pops resolved nodes until the instance quiesces. Successors queue up
    /// behind their predecessors, so propagation never recurses no matter
    /// how deep the graph is.
    async fn drive(&mut self, mut queue: VecDeque<usize>) -> Result<()> {
        while let Some(task_id) = queue.pop_front() {
            if matches!(
                self.status,
                InstanceStatus::Completed | InstanceStatus::Failed
            ) {
                break;
            }
            let node = self.node_pool.remove(&task_id).ok_or_else(|| {
                anyhow!("no live node for task {} on instance {}", task_id, self.id)
            })?;
            if self.node_is_live(&node) {
                self.execute_node(node, &mut queue).await?;
            } else {
                self.skip_node(node, &mut queue).await?;
            }
        }
        // A resumed branch can drain while another suspension is still
        // outstanding; fall back to WAITING so the pool stays durable.
        if self.status == InstanceStatus::Running
            && self.node_pool.values().any(|node| node.behavior.pending())
        {
            self.change_status(InstanceStatus::Waiting, None).await?;
        }
        Ok(())
    }

    fn node_is_live(&self, node: &Node) -> bool {
        node.live_arrival
            || self
                .definition
                .task(node.task_id)
                .is_some_and(|task| task.incoming.is_empty())
    }

    async fn execute_node(&mut self, mut node: Node, queue: &mut VecDeque<usize>) -> Result<()> {
        let definition = self.definition.clone();
        let task = definition.task(node.task_id).ok_or_else(|| {
            anyhow!(
                "task {} not present in definition '{}'",
                node.task_id,
                definition.id
            )
        })?;
        self.emit(InstanceEvent::Before {
            task: task.id,
            name: task.name.clone(),
        });
        let outcome = node
            .behavior
            .run(NodeContext {
                instance_id: self.id,
                task,
                variables: &self.variables,
            })
            .await;
        match outcome {
            Ok(Outcome::Complete(variables)) => self.complete_node(node, variables, queue).await,
            Ok(Outcome::Suspend) => {
                self.node_pool.insert(task.id, node);
                self.change_status(InstanceStatus::Waiting, None).await
            }
            Err(err) => {
                self.node_pool.insert(task.id, node);
                self.fail(err).await
            }
        }
    }

    /// Token propagation: shared by synchronous completions and externally
    /// resolved suspensions. The node has already left the pool.
    async fn complete_node(
        &mut self,
        node: Node,
        variables: Option<HashMap<String, Value>>,
        queue: &mut VecDeque<usize>,
    ) -> Result<()> {
        let definition = self.definition.clone();
        let task = definition.task(node.task_id).ok_or_else(|| {
            anyhow!(
                "task {} not present in definition '{}'",
                node.task_id,
                definition.id
            )
        })?;

        if let Some(variables) = variables {
            // handler output replaces the map wholesale
            self.variables = variables;
        }
        self.emit(InstanceEvent::After {
            task: task.id,
            name: task.name.clone(),
        });

        let mut followed = 0usize;
        for flow in &task.outgoing {
            let live = node.behavior.can_follow(flow, &self.variables);
            if live {
                followed += 1;
            } else {
                debug!(
                    instance_id = self.id,
                    from = flow.from,
                    to = flow.to,
                    "outgoing flow skipped by guard"
                );
            }
            self.deliver_arrival(flow, live, queue).await?;
        }
        if followed == 0 && !task.outgoing.is_empty() {
            warn!(
                instance_id = self.id,
                task = task.id,
                "no outgoing flow was followed, branch halts"
            );
        }

        if task.kind == END_TASK {
            self.change_status(InstanceStatus::Completed, None).await?;
            info!(instance_id = self.id, "process instance completed");
            self.emit(InstanceEvent::End);
        }
        Ok(())
    }

    /// A node whose inbound flows were all skipped resolves without
    /// executing and skips its own outgoing flows in turn, so downstream
    /// joins do not wait for a branch that can never fire.
    async fn skip_node(&mut self, node: Node, queue: &mut VecDeque<usize>) -> Result<()> {
        let definition = self.definition.clone();
        let task = definition.task(node.task_id).ok_or_else(|| {
            anyhow!(
                "task {} not present in definition '{}'",
                node.task_id,
                definition.id
            )
        })?;
        debug!(
            instance_id = self.id,
            task = task.id,
            "task not reached this run, skipping"
        );
        for flow in &task.outgoing {
            self.deliver_arrival(flow, false, queue).await?;
        }
        Ok(())
    }

    /// Records one inbound arrival at the flow's target, creating its node
    /// on first contact, and queues the target once every inbound flow has
    /// reported.
    async fn deliver_arrival(
        &mut self,
        flow: &FlowDef,
        live: bool,
        queue: &mut VecDeque<usize>,
    ) -> Result<()> {
        let definition = self.definition.clone();
        let target = definition.task(flow.to).ok_or_else(|| {
            anyhow!(
                "flow target {} not present in definition '{}'",
                flow.to,
                definition.id
            )
        })?;
        let resolved = match self.node_pool.get_mut(&flow.to) {
            Some(existing) => {
                existing.incoming_flow_completed += 1;
                existing.live_arrival |= live;
                existing.can_execute(target)
            }
            None => {
                let mut fresh = self.create_node(target)?;
                fresh.incoming_flow_completed = 1;
                fresh.live_arrival = live;
                let resolved = fresh.can_execute(target);
                self.node_pool.insert(flow.to, fresh);
                resolved
            }
        };
        if resolved {
            queue.push_back(flow.to);
        } else if self.status == InstanceStatus::Waiting {
            // a partial join arrival while suspended must be durable
            self.save().await?;
        }
        Ok(())
    }

    async fn fail(&mut self, err: anyhow::Error) -> Result<()> {
        error!(instance_id = self.id, error = %err, "process instance failed");
        self.change_status(InstanceStatus::Failed, Some(err.to_string()))
            .await?;
        self.emit(InstanceEvent::End);
        Ok(())
    }

    /// Mutates the status, optionally records an error, and persists.
    pub async fn change_status(
        &mut self,
        status: InstanceStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        self.save().await
    }

    /// Writes through the instance collection: insert on first save, update
    /// by persistence id afterwards.
    pub async fn save(&mut self) -> Result<()> {
        let doc = serde_json::to_value(self.serialize())?;
        match &self.persistence_id {
            Some(persistence_id) => {
                self.store
                    .instances
                    .update(json!({ PERSISTENCE_ID: persistence_id }), doc)
                    .await
            }
            None => {
                let stored = self.store.instances.insert(doc).await?;
                self.persistence_id = stored
                    .get(PERSISTENCE_ID)
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                Ok(())
            }
        }
    }

    pub fn serialize(&self) -> InstanceDocument {
        let mut node_pool: Vec<NodeDocument> = self
            .node_pool
            .values()
            .map(|node| node.serialize(self.id))
            .collect();
        node_pool.sort_by_key(|doc| doc.task);
        InstanceDocument {
            persistence_id: self.persistence_id.clone(),
            id: self.id,
            definition_ref: self.definition_ref.clone(),
            status: self.status,
            variables: self.variables.clone(),
            error: self.error.clone(),
            node_pool,
        }
    }

    /// Rebuilds an instance from its persisted document. Nodes are
    /// reconstructed through the registry with their arrival counters and
    /// type-specific state intact, but are not executed.
    pub(crate) fn deserialize(
        entity: InstanceDocument,
        definition: Arc<ProcessDefinition>,
        registry: Arc<TaskRegistry>,
        store: ProcessStore,
        definition_refs: Arc<DashMap<String, String>>,
    ) -> Result<Self> {
        let mut instance = Self::new(
            entity.id,
            definition,
            entity.definition_ref,
            registry,
            store,
            definition_refs,
        );
        instance.persistence_id = entity.persistence_id;
        instance.status = entity.status;
        instance.variables = entity.variables;
        instance.error = entity.error;
        for doc in entity.node_pool {
            let task = instance.definition.task(doc.task).ok_or_else(|| {
                anyhow!(
                    "persisted node references task {} missing from definition '{}'",
                    doc.task,
                    instance.definition.id
                )
            })?;
            let mut node = instance.create_node(task)?;
            node.incoming_flow_completed = doc.incoming_flow_completed_number;
            node.live_arrival = doc.live;
            if let Some(state) = &doc.state {
                node.behavior.restore(state);
            }
            instance.node_pool.insert(doc.task, node);
        }
        Ok(instance)
    }
}
