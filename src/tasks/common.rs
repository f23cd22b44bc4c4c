use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::definition::{TaskDef, END_TASK, START_TASK};
use crate::runtime::node::{NodeContext, Outcome, TaskBehavior, TaskTypeDefinition};

/// Pass-through behavior: completes the token immediately without touching
/// the variables. Backs `start-task` and `end-task`, and is the fallback for
/// unregistered task types.
#[derive(Debug, Default)]
pub struct PassBehavior;

#[async_trait]
impl TaskBehavior for PassBehavior {
    async fn run(&mut self, ctx: NodeContext<'_>) -> Result<Outcome> {
        debug!(
            instance_id = ctx.instance_id,
            task = ctx.task.id,
            "pass-through task completed"
        );
        Ok(Outcome::Complete(None))
    }
}

pub struct StartTaskDefinition;

impl TaskTypeDefinition for StartTaskDefinition {
    fn name(&self) -> &str {
        START_TASK
    }

    fn create(&self, _task: &TaskDef) -> Result<Box<dyn TaskBehavior>> {
        Ok(Box::new(PassBehavior))
    }
}

pub struct EndTaskDefinition;

impl TaskTypeDefinition for EndTaskDefinition {
    fn name(&self) -> &str {
        END_TASK
    }

    fn create(&self, _task: &TaskDef) -> Result<Box<dyn TaskBehavior>> {
        Ok(Box::new(PassBehavior))
    }
}
