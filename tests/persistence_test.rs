use std::collections::HashMap;

use flyt::definition::builder::DefinitionBuilder;
use flyt::definition::ProcessDefinition;
use flyt::runtime::engine::Engine;
use flyt::runtime::instance::InstanceStatus;
use flyt::store::ProcessStore;
use serde_json::json;

fn service_definition(id: &str) -> ProcessDefinition {
    DefinitionBuilder::new(id)
        .start("start")
        .service("svc")
        .end("end")
        .connect("start", "svc")
        .connect("svc", "end")
        .build()
        .unwrap()
}

fn linear_definition(id: &str) -> ProcessDefinition {
    DefinitionBuilder::new(id)
        .start("start")
        .end("end")
        .connect("start", "end")
        .build()
        .unwrap()
}

/// Stalls in RUNNING: the decision matches no flow, so the instance never
/// reaches its end task.
fn stalling_definition(id: &str) -> ProcessDefinition {
    DefinitionBuilder::new(id)
        .var("x", 0)
        .start("start")
        .decision("decide")
        .end("end")
        .connect("start", "decide")
        .connect_if("decide", "end", "x > 0")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_serialize_deserialize_round_trip() {
    let store = ProcessStore::in_memory();
    let engine = Engine::new_with_store(store.clone());
    let handle = engine.create_process_instance(service_definition("round-trip"));
    let (instance_id, doc_before) = {
        let mut instance = handle.lock().await;
        instance
            .start(Some(HashMap::from([
                ("x".to_string(), json!(1)),
                ("nested".to_string(), json!({ "a": [1, 2, 3] })),
            ])))
            .await
            .unwrap();
        (instance.id(), instance.serialize())
    };

    let restarted = Engine::new_with_store(store);
    let handle = restarted
        .load_process_instance(instance_id)
        .await
        .unwrap()
        .expect("instance should be persisted");
    let doc_after = handle.lock().await.serialize();

    assert_eq!(doc_before, doc_after);
}

#[tokio::test]
async fn test_query_is_a_pass_through_to_the_store() {
    let engine = Engine::new();

    let waiting = engine.create_process_instance(service_definition("q-waiting"));
    waiting.lock().await.start(None).await.unwrap();

    let completed = engine.create_process_instance(linear_definition("q-completed"));
    completed.lock().await.start(None).await.unwrap();

    let all = engine.query_process_instances(json!({})).await.unwrap();
    assert_eq!(all.len(), 2);

    let waiting_docs = engine
        .query_process_instances(json!({ "status": "waiting" }))
        .await
        .unwrap();
    assert_eq!(waiting_docs.len(), 1);
    assert_eq!(waiting_docs[0].get("id"), Some(&json!(1)));
}

#[tokio::test]
async fn test_clear_pool_evicts_waiting_and_completed_only() {
    let engine = Engine::new();

    let waiting = engine.create_process_instance(service_definition("cp-waiting"));
    waiting.lock().await.start(None).await.unwrap();
    let waiting_id = waiting.lock().await.id();

    let completed = engine.create_process_instance(linear_definition("cp-completed"));
    completed.lock().await.start(None).await.unwrap();
    let completed_id = completed.lock().await.id();

    let running = engine.create_process_instance(stalling_definition("cp-running"));
    running.lock().await.start(None).await.unwrap();
    let running_id = running.lock().await.id();
    assert_eq!(running.lock().await.status(), InstanceStatus::Running);

    let failed = engine.create_process_instance(service_definition("cp-failed"));
    failed.lock().await.start(None).await.unwrap();
    let failed_id = failed.lock().await.id();
    engine
        .fail_task(failed_id, 1, "boom".to_string())
        .await
        .unwrap();

    assert_eq!(engine.pool_len(), 4);
    engine.clear_pool().await;

    assert!(!engine.is_pooled(waiting_id));
    assert!(!engine.is_pooled(completed_id));
    assert!(engine.is_pooled(running_id));
    assert!(engine.is_pooled(failed_id));

    // an evicted instance is reloadable from the store on demand
    let reloaded = engine.load_process_instance(waiting_id).await.unwrap();
    assert!(reloaded.is_some());
    assert!(engine.is_pooled(waiting_id));
}

#[tokio::test]
async fn test_unknown_task_kind_falls_back_to_pass_through() {
    let definition = DefinitionBuilder::new("fallback")
        .start("start")
        .task("mystery", "no-such-kind")
        .end("end")
        .connect("start", "mystery")
        .connect("mystery", "end")
        .build()
        .unwrap();

    let engine = Engine::new();
    let handle = engine.create_process_instance(definition);
    let mut instance = handle.lock().await;
    instance.start(None).await.unwrap();

    assert_eq!(instance.status(), InstanceStatus::Completed);
}

#[tokio::test]
async fn test_one_definition_document_serves_many_instances() {
    let store = ProcessStore::in_memory();
    let engine = Engine::new_with_store(store.clone());

    for _ in 0..3 {
        let handle = engine.create_process_instance(linear_definition("shared-def"));
        handle.lock().await.start(None).await.unwrap();
    }

    let definitions = store.definitions.find(json!({})).await.unwrap();
    assert_eq!(definitions.len(), 1);
}

#[tokio::test]
async fn test_new_instances_are_not_persisted_until_started() {
    let store = ProcessStore::in_memory();
    let engine = Engine::new_with_store(store.clone());
    let handle = engine.create_process_instance(linear_definition("unstarted"));

    assert_eq!(handle.lock().await.status(), InstanceStatus::New);
    let docs = store.instances.find(json!({})).await.unwrap();
    assert!(docs.is_empty());
}
