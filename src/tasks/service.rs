use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::definition::{TaskDef, SERVICE_TASK};
use crate::runtime::node::{NodeContext, Outcome, TaskBehavior, TaskTypeDefinition};

/// Asynchronous service task: parks the token on entry and waits for an
/// external `Engine::complete_task` to resolve it. Resolution is one-shot,
/// so a double delivery cannot complete the node twice.
#[derive(Debug, Default)]
pub struct ServiceBehavior {
    pending: bool,
}

#[async_trait]
impl TaskBehavior for ServiceBehavior {
    async fn run(&mut self, ctx: NodeContext<'_>) -> Result<Outcome> {
        self.pending = true;
        info!(
            instance_id = ctx.instance_id,
            task = ctx.task.id,
            "service task awaiting external completion"
        );
        Ok(Outcome::Suspend)
    }

    fn resolve(&mut self) -> bool {
        let first = self.pending;
        self.pending = false;
        first
    }

    fn pending(&self) -> bool {
        self.pending
    }

    fn checkpoint(&self) -> Option<Value> {
        Some(json!({ "pending": self.pending }))
    }

    fn restore(&mut self, state: &Value) {
        self.pending = state
            .get("pending")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
    }
}

pub struct ServiceTaskDefinition;

impl TaskTypeDefinition for ServiceTaskDefinition {
    fn name(&self) -> &str {
        SERVICE_TASK
    }

    fn create(&self, _task: &TaskDef) -> Result<Box<dyn TaskBehavior>> {
        Ok(Box::new(ServiceBehavior::default()))
    }
}
