use std::collections::HashMap;
use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::definition::{FlowDef, TaskDef};
use crate::tasks::common::PassBehavior;

/// What a behavior's `run` did with its token.
#[derive(Debug)]
pub enum Outcome {
    /// The node finished. A supplied map replaces the instance variables
    /// wholesale.
    Complete(Option<HashMap<String, Value>>),
    /// The node parked awaiting an external completion.
    Suspend,
}

/// Read-only view handed to a behavior while it runs.
pub struct NodeContext<'a> {
    pub instance_id: u64,
    pub task: &'a TaskDef,
    pub variables: &'a HashMap<String, Value>,
}

/// The node-execution protocol. Task types override the hooks they need;
/// the defaults describe a synchronous pass-through.
#[async_trait]
pub trait TaskBehavior: Send + Sync + Debug {
    /// Runs when the node becomes eligible. Completes the token, suspends
    /// it, or fails the instance by returning an error.
    async fn run(&mut self, ctx: NodeContext<'_>) -> Result<Outcome>;

    /// Whether an outgoing flow should be followed after completion.
    fn can_follow(&self, _flow: &FlowDef, _variables: &HashMap<String, Value>) -> bool {
        true
    }

    /// Gate for external completion delivery. Returning false discards the
    /// delivery (e.g. a suspension that was already resolved).
    fn resolve(&mut self) -> bool {
        true
    }

    /// True while the node holds an unresolved suspension.
    fn pending(&self) -> bool {
        false
    }

    /// Type-specific state for the persisted node document.
    fn checkpoint(&self) -> Option<Value> {
        None
    }

    /// Restores type-specific state from a persisted node document.
    fn restore(&mut self, _state: &Value) {}
}

/// Factory for one task type, registered on the engine before it is shared.
pub trait TaskTypeDefinition: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self, task: &TaskDef) -> Result<Box<dyn TaskBehavior>>;
}

/// Process-wide mapping from task-type tag to behavior factory. Populated at
/// engine construction, read-only afterwards.
pub struct TaskRegistry {
    types: HashMap<String, Box<dyn TaskTypeDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    pub fn register(&mut self, definition: Box<dyn TaskTypeDefinition>) {
        self.types.insert(definition.name().to_string(), definition);
    }

    /// Unknown kinds fall back to the pass-through behavior, which keeps old
    /// persisted instances loadable after a plugin is unregistered.
    pub fn create(&self, task: &TaskDef) -> Result<Box<dyn TaskBehavior>> {
        match self.types.get(&task.kind) {
            Some(definition) => definition.create(task),
            None => {
                warn!(
                    kind = %task.kind,
                    task = task.id,
                    "unknown task type, falling back to pass-through"
                );
                Ok(Box::new(PassBehavior))
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime instantiation of one task inside one running instance.
#[derive(Debug)]
pub struct Node {
    pub task_id: usize,
    /// Arrivals seen so far, counting both followed and skipped inbound
    /// flows. The node resolves once every inbound flow has reported.
    pub incoming_flow_completed: usize,
    /// Whether any arrival so far came over a followed flow. A node that
    /// resolves without one never executes; its own outgoing flows are
    /// skipped in turn.
    pub live_arrival: bool,
    pub behavior: Box<dyn TaskBehavior>,
}

impl Node {
    pub fn new(task_id: usize, behavior: Box<dyn TaskBehavior>) -> Self {
        Self {
            task_id,
            incoming_flow_completed: 0,
            live_arrival: false,
            behavior,
        }
    }

    /// AND-join: the node resolves once every inbound flow has arrived.
    pub fn can_execute(&self, task: &TaskDef) -> bool {
        self.incoming_flow_completed >= task.incoming.len()
    }

    pub fn serialize(&self, instance_id: u64) -> NodeDocument {
        NodeDocument {
            process_instance: instance_id,
            task: self.task_id,
            incoming_flow_completed_number: self.incoming_flow_completed,
            live: self.live_arrival,
            state: self.behavior.checkpoint(),
        }
    }
}

/// Persisted form of a live node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDocument {
    pub process_instance: u64,
    pub task: usize,
    pub incoming_flow_completed_number: usize,
    #[serde(default)]
    pub live: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}
