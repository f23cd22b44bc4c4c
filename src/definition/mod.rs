pub mod builder;
pub mod loader;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const START_TASK: &str = "start-task";
pub const END_TASK: &str = "end-task";
pub const SERVICE_TASK: &str = "service-task";
pub const DECISION: &str = "decision";

/// A directed edge between two tasks. `condition` is a guard expression
/// consulted by decision tasks; other task types ignore it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDef {
    pub from: usize,
    pub to: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// One task in a frozen definition graph. `id` is the index into the
/// definition's task list; task 0 is the start task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDef {
    pub id: usize,
    pub name: String,
    pub kind: String,
    /// Type-specific configuration, passed to the behavior factory.
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub incoming: Vec<FlowDef>,
    #[serde(default)]
    pub outgoing: Vec<FlowDef>,
}

/// An immutable process graph. Instances never mutate their definition;
/// the definition outlives every instance executing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub default_variables: HashMap<String, Value>,
    pub tasks: Vec<TaskDef>,
}

impl ProcessDefinition {
    pub fn task(&self, id: usize) -> Option<&TaskDef> {
        self.tasks.get(id)
    }

    pub fn task_by_name(&self, name: &str) -> Option<&TaskDef> {
        self.tasks.iter().find(|t| t.name == name)
    }
}
