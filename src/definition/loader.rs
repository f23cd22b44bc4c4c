use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use serde_json::Value;

use super::builder::DefinitionBuilder;
use super::ProcessDefinition;

/// Authoring shape of a definition file: tasks and flows refer to each other
/// by name; ids and the per-task flow lists are derived by the builder.
#[derive(Debug, Deserialize)]
struct RawDefinition {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    variables: HashMap<String, Value>,
    tasks: Vec<RawTask>,
    #[serde(default)]
    flows: Vec<RawFlow>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: String,
    kind: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RawFlow {
    from: String,
    to: String,
    #[serde(default)]
    condition: Option<String>,
}

pub fn load_definition_from_yaml(path: impl AsRef<Path>) -> Result<ProcessDefinition> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read definition file {}", path.display()))?;
    parse_definition(&text).with_context(|| format!("failed to load definition from {}", path.display()))
}

pub fn parse_definition(yaml: &str) -> Result<ProcessDefinition> {
    let raw: RawDefinition = serde_yaml::from_str(yaml).context("invalid definition document")?;

    let mut builder = DefinitionBuilder::new(&raw.id);
    if let Some(name) = &raw.name {
        builder = builder.name(name);
    }
    for (key, value) in raw.variables {
        builder = builder.var(&key, value);
    }
    for task in raw.tasks {
        builder = builder.task_with_params(&task.name, &task.kind, task.params);
    }
    for flow in raw.flows {
        builder = match flow.condition {
            Some(condition) => builder.connect_if(&flow.from, &flow.to, &condition),
            None => builder.connect(&flow.from, &flow.to),
        };
    }
    builder.build()
}
