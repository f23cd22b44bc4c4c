use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;

use super::{FlowDef, ProcessDefinition, TaskDef, DECISION, END_TASK, SERVICE_TASK, START_TASK};

/// Fluent builder for process definitions. Tasks are identified by name while
/// building; `build` assigns ids by declaration order, wires the flow lists in
/// both directions, and validates the graph.
pub struct DefinitionBuilder {
    id: String,
    name: String,
    default_variables: HashMap<String, Value>,
    tasks: Vec<(String, String, Value)>,
    connections: Vec<(String, String, Option<String>)>,
}

impl DefinitionBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            default_variables: HashMap::new(),
            tasks: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.default_variables.insert(key.to_string(), value.into());
        self
    }

    pub fn task(self, name: &str, kind: &str) -> Self {
        self.task_with_params(name, kind, Value::Null)
    }

    pub fn task_with_params(mut self, name: &str, kind: &str, params: Value) -> Self {
        self.tasks
            .push((name.to_string(), kind.to_string(), params));
        self
    }

    pub fn start(self, name: &str) -> Self {
        self.task(name, START_TASK)
    }

    pub fn end(self, name: &str) -> Self {
        self.task(name, END_TASK)
    }

    pub fn service(self, name: &str) -> Self {
        self.task(name, SERVICE_TASK)
    }

    pub fn decision(self, name: &str) -> Self {
        self.task(name, DECISION)
    }

    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.connections
            .push((source.to_string(), target.to_string(), None));
        self
    }

    pub fn connect_if(mut self, source: &str, target: &str, condition: &str) -> Self {
        self.connections.push((
            source.to_string(),
            target.to_string(),
            Some(condition.to_string()),
        ));
        self
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        if self.tasks.is_empty() {
            bail!("definition '{}' has no tasks", self.id);
        }

        let mut index: HashMap<String, usize> = HashMap::new();
        for (idx, (name, _, _)) in self.tasks.iter().enumerate() {
            if index.insert(name.clone(), idx).is_some() {
                bail!("duplicate task name '{}' in definition '{}'", name, self.id);
            }
        }

        let mut tasks: Vec<TaskDef> = self
            .tasks
            .into_iter()
            .enumerate()
            .map(|(id, (name, kind, params))| TaskDef {
                id,
                name,
                kind,
                params,
                incoming: Vec::new(),
                outgoing: Vec::new(),
            })
            .collect();

        for (source, target, condition) in &self.connections {
            let from = *index
                .get(source)
                .ok_or_else(|| anyhow!("flow source '{}' is not a task", source))?;
            let to = *index
                .get(target)
                .ok_or_else(|| anyhow!("flow target '{}' is not a task", target))?;
            let flow = FlowDef {
                from,
                to,
                condition: condition.clone(),
            };
            tasks[from].outgoing.push(flow.clone());
            tasks[to].incoming.push(flow);
        }

        if !tasks[0].incoming.is_empty() {
            bail!(
                "task '{}' is the entry task but has incoming flows",
                tasks[0].name
            );
        }

        reject_cycles(&tasks)?;
        require_reachable(&tasks)?;

        Ok(ProcessDefinition {
            id: self.id,
            name: self.name,
            default_variables: self.default_variables,
            tasks,
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    White,
    Gray,
    Black,
}

/// Iterative DFS; a gray-to-gray edge is a back edge. The runtime assumes a
/// DAG, so cycles are refused here rather than misbehaving later.
fn reject_cycles(tasks: &[TaskDef]) -> Result<()> {
    let mut state = vec![Visit::White; tasks.len()];
    for root in 0..tasks.len() {
        if state[root] != Visit::White {
            continue;
        }
        // stack of (task, next outgoing index to look at)
        let mut stack = vec![(root, 0usize)];
        state[root] = Visit::Gray;
        while let Some((task, cursor)) = stack.pop() {
            if let Some(flow) = tasks[task].outgoing.get(cursor) {
                stack.push((task, cursor + 1));
                match state[flow.to] {
                    Visit::Gray => bail!(
                        "definition contains a cycle through task '{}'",
                        tasks[flow.to].name
                    ),
                    Visit::White => {
                        state[flow.to] = Visit::Gray;
                        stack.push((flow.to, 0));
                    }
                    Visit::Black => {}
                }
            } else {
                state[task] = Visit::Black;
            }
        }
    }
    Ok(())
}

/// Every task must be reachable from the entry task; a disconnected task
/// would leave permanently partial joins behind.
fn require_reachable(tasks: &[TaskDef]) -> Result<()> {
    let mut seen = vec![false; tasks.len()];
    let mut stack = vec![0usize];
    seen[0] = true;
    while let Some(task) = stack.pop() {
        for flow in &tasks[task].outgoing {
            if !seen[flow.to] {
                seen[flow.to] = true;
                stack.push(flow.to);
            }
        }
    }
    if let Some(orphan) = seen.iter().position(|reached| !reached) {
        bail!(
            "task '{}' is not reachable from the entry task",
            tasks[orphan].name
        );
    }
    Ok(())
}
