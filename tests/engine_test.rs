use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use flyt::definition::builder::DefinitionBuilder;
use flyt::definition::TaskDef;
use flyt::runtime::engine::Engine;
use flyt::runtime::events::InstanceEvent;
use flyt::runtime::instance::{InstanceStatus, ProcessInstance};
use flyt::runtime::node::{NodeContext, Outcome, TaskBehavior, TaskTypeDefinition};
use serde_json::{json, Value};

fn record_events(instance: &mut ProcessInstance) -> Arc<Mutex<Vec<InstanceEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    instance.on_event(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

fn before(task: usize, name: &str) -> InstanceEvent {
    InstanceEvent::Before {
        task,
        name: name.to_string(),
    }
}

fn after(task: usize, name: &str) -> InstanceEvent {
    InstanceEvent::After {
        task,
        name: name.to_string(),
    }
}

/// Test plugin: completes immediately after writing one variable.
#[derive(Debug)]
struct SetVarBehavior {
    key: String,
    value: Value,
}

#[async_trait]
impl TaskBehavior for SetVarBehavior {
    async fn run(&mut self, ctx: NodeContext<'_>) -> Result<Outcome> {
        let mut vars = ctx.variables.clone();
        vars.insert(self.key.clone(), self.value.clone());
        Ok(Outcome::Complete(Some(vars)))
    }
}

struct SetVarDefinition;

impl TaskTypeDefinition for SetVarDefinition {
    fn name(&self) -> &str {
        "set-var"
    }

    fn create(&self, task: &TaskDef) -> Result<Box<dyn TaskBehavior>> {
        let key = task
            .params
            .get("key")
            .and_then(|v| v.as_str())
            .unwrap_or("result")
            .to_string();
        let value = task.params.get("value").cloned().unwrap_or(Value::Null);
        Ok(Box::new(SetVarBehavior { key, value }))
    }
}

#[tokio::test]
async fn test_linear_three_tasks() {
    let definition = DefinitionBuilder::new("linear")
        .start("start")
        .task_with_params("step", "set-var", json!({ "key": "result_var", "value": "done" }))
        .end("end")
        .connect("start", "step")
        .connect("step", "end")
        .build()
        .expect("definition should build");

    let mut engine = Engine::new();
    engine
        .register_task_type(Box::new(SetVarDefinition))
        .expect("registration before first instance");

    let handle = engine.create_process_instance(definition);
    let mut instance = handle.lock().await;
    let events = record_events(&mut instance);

    instance.start(None).await.expect("instance should run");

    assert_eq!(instance.status(), InstanceStatus::Completed);
    assert_eq!(instance.variables().get("result_var"), Some(&json!("done")));

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            before(0, "start"),
            after(0, "start"),
            before(1, "step"),
            after(1, "step"),
            before(2, "end"),
            after(2, "end"),
            InstanceEvent::End,
        ]
    );
}

#[tokio::test]
async fn test_and_join_waits_for_all_branches() {
    let definition = DefinitionBuilder::new("and-join")
        .start("start")
        .task_with_params("a", "set-var", json!({ "key": "a", "value": true }))
        .task_with_params("b", "set-var", json!({ "key": "b", "value": true }))
        .task("join", "gateway")
        .end("end")
        .connect("start", "a")
        .connect("start", "b")
        .connect("a", "join")
        .connect("b", "join")
        .connect("join", "end")
        .build()
        .expect("definition should build");

    let mut engine = Engine::new();
    engine.register_task_type(Box::new(SetVarDefinition)).unwrap();

    let handle = engine.create_process_instance(definition);
    let mut instance = handle.lock().await;
    let events = record_events(&mut instance);

    instance.start(None).await.expect("instance should run");

    assert_eq!(instance.status(), InstanceStatus::Completed);
    // each branch cloned the snapshot it saw, so both writes survive
    assert_eq!(instance.variables().get("a"), Some(&json!(true)));
    assert_eq!(instance.variables().get("b"), Some(&json!(true)));

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            before(0, "start"),
            after(0, "start"),
            before(1, "a"),
            after(1, "a"),
            before(2, "b"),
            after(2, "b"),
            before(3, "join"),
            after(3, "join"),
            before(4, "end"),
            after(4, "end"),
            InstanceEvent::End,
        ]
    );
}

#[tokio::test]
async fn test_single_task_is_both_start_and_end() {
    let definition = DefinitionBuilder::new("single")
        .end("finish")
        .build()
        .expect("definition should build");

    let engine = Engine::new();
    let handle = engine.create_process_instance(definition);
    let mut instance = handle.lock().await;
    let events = record_events(&mut instance);

    instance.start(None).await.expect("instance should run");

    assert_eq!(instance.status(), InstanceStatus::Completed);
    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![before(0, "finish"), after(0, "finish"), InstanceEvent::End]
    );
}

#[tokio::test]
async fn test_start_seeds_definition_defaults() {
    let definition = DefinitionBuilder::new("defaults")
        .var("greeting", "hello")
        .start("start")
        .end("end")
        .connect("start", "end")
        .build()
        .unwrap();

    let engine = Engine::new();
    let handle = engine.create_process_instance(definition);
    let mut instance = handle.lock().await;
    instance.start(None).await.unwrap();

    assert_eq!(instance.variables().get("greeting"), Some(&json!("hello")));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let definition = DefinitionBuilder::new("restart")
        .start("start")
        .end("end")
        .connect("start", "end")
        .build()
        .unwrap();

    let engine = Engine::new();
    let handle = engine.create_process_instance(definition);
    let mut instance = handle.lock().await;
    instance.start(None).await.unwrap();

    let again = instance.start(Some(HashMap::new())).await;
    assert!(again.is_err());
}

#[tokio::test]
async fn test_registration_after_first_instance_is_rejected() {
    let definition = DefinitionBuilder::new("late")
        .start("start")
        .end("end")
        .connect("start", "end")
        .build()
        .unwrap();

    let mut engine = Engine::new();
    let _handle = engine.create_process_instance(definition);
    assert!(engine
        .register_task_type(Box::new(SetVarDefinition))
        .is_err());
}
