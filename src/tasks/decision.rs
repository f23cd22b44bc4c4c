use std::collections::HashMap;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext,
    Node as EvalNode,
};
use serde_json::Value;
use tracing::warn;

use crate::definition::{FlowDef, TaskDef, DECISION};
use crate::runtime::node::{NodeContext, Outcome, TaskBehavior, TaskTypeDefinition};

/// Decision gateway: after completion, only outgoing flows whose guard
/// expression evaluates to true against the variables snapshot are followed.
/// Several flows may match (inclusive semantics); an unguarded flow always
/// matches. With `{"strict": true}` in the task params, matching no flow at
/// all fails the instance instead of silently halting the branch.
#[derive(Debug)]
pub struct DecisionBehavior {
    /// Guard expressions precompiled at node construction, keyed by source
    /// text.
    guards: HashMap<String, EvalNode>,
    strict: bool,
}

#[async_trait]
impl TaskBehavior for DecisionBehavior {
    async fn run(&mut self, ctx: NodeContext<'_>) -> Result<Outcome> {
        if self.strict {
            let any = ctx
                .task
                .outgoing
                .iter()
                .any(|flow| self.can_follow(flow, ctx.variables));
            if !any {
                bail!("decision task '{}' matched no outgoing flow", ctx.task.name);
            }
        }
        Ok(Outcome::Complete(None))
    }

    fn can_follow(&self, flow: &FlowDef, variables: &HashMap<String, Value>) -> bool {
        let Some(condition) = &flow.condition else {
            return true;
        };
        let Some(guard) = self.guards.get(condition) else {
            // only reachable if the flow was not part of the task at
            // construction time
            warn!(condition = %condition, "guard was never compiled, not following");
            return false;
        };
        let scope = eval_scope(variables);
        guard
            .eval_boolean_with_context(&scope)
            .unwrap_or_else(|e| {
                warn!(condition = %condition, error = %e, "guard evaluation failed, not following");
                false
            })
    }
}

/// Builds an evalexpr context from the variables snapshot. Strings, numbers
/// and booleans are visible to guards; nested values are not addressable.
fn eval_scope(variables: &HashMap<String, Value>) -> HashMapContext<DefaultNumericTypes> {
    let mut scope = HashMapContext::<DefaultNumericTypes>::new();
    for (key, value) in variables {
        let mapped = match value {
            Value::String(s) => Some(evalexpr::Value::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(evalexpr::Value::Int(i))
                } else {
                    n.as_f64().map(evalexpr::Value::Float)
                }
            }
            Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
            _ => None,
        };
        if let Some(mapped) = mapped {
            let _ = scope.set_value(key.clone(), mapped);
        }
    }
    scope
}

pub struct DecisionTaskDefinition;

impl TaskTypeDefinition for DecisionTaskDefinition {
    fn name(&self) -> &str {
        DECISION
    }

    fn create(&self, task: &TaskDef) -> Result<Box<dyn TaskBehavior>> {
        let mut guards = HashMap::new();
        for flow in &task.outgoing {
            if let Some(condition) = &flow.condition {
                let compiled = build_operator_tree(condition).with_context(|| {
                    format!("invalid guard '{}' on task '{}'", condition, task.name)
                })?;
                guards.insert(condition.clone(), compiled);
            }
        }
        let strict = task
            .params
            .get("strict")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Box::new(DecisionBehavior { guards, strict }))
    }
}
