//! Worker integration: claim/dispatch/resume round trips, AST cache
//! hydration from persisted flows, and concurrent claiming across
//! workers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use weft_runtime::{
    Evaluator, ExecutionStatus, FlowRecord, MemoryStore, TaskState, Worker, WorkerConfig,
    WorkflowState, WorkflowStore,
};

use common::*;

fn harness() -> (Arc<Evaluator>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let evaluator = Arc::new(Evaluator::new(store.clone() as Arc<dyn WorkflowStore>));
    (evaluator, store)
}

/// Opt-in worker logs: `RUST_LOG=weft_runtime=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn register_greet_handler(worker: &Worker) {
    worker.register("Greet", |payload| async move {
        let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or("?");
        let mut result = Map::new();
        result.insert("message".to_string(), json!(format!("Hello, {name}!")));
        Ok(result)
    });
}

/// Persist the compiled program so workers hydrate their AST cache by
/// reparsing the stored source.
async fn persist_flow(store: &MemoryStore, workflow_id: &str) {
    let flow = FlowRecord {
        uuid: "flow-greet".to_string(),
        name: "greetings".to_string(),
        source: serde_json::to_string(&greet_program()).unwrap(),
    };
    store.save_flow(&flow).await.unwrap();

    let mut workflow = store.get_workflow(workflow_id).await.unwrap().unwrap();
    workflow.flow_id = flow.uuid.clone();
    store.save_workflow(&workflow).await.unwrap();
}

#[tokio::test]
async fn worker_completes_a_paused_workflow() {
    let (evaluator, store) = harness();
    let program = greet_program();

    let result = evaluator
        .execute(&greet_workflow(), Map::new(), Some(&program))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Paused);
    persist_flow(&store, &result.workflow_id).await;

    let worker = Worker::new(
        store.clone() as Arc<dyn WorkflowStore>,
        evaluator,
        WorkerConfig::new("greeter"),
    );
    register_greet_handler(&worker);

    assert_eq!(worker.poll_once().await, 1);

    // Task completed, workflow resumed to completion with the handler's
    // returns folded through the yield.
    let tasks = store.list_tasks(&result.workflow_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Completed);
    assert_eq!(tasks[0].runner_id, worker.server_id());

    let workflow = store.get_workflow(&result.workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.state, WorkflowState::Completed);
    assert_eq!(workflow.outputs.get("greeting"), Some(&json!("Hello, World!")));
}

#[tokio::test]
async fn worker_uses_precached_ast() {
    let (evaluator, store) = harness();
    let program = greet_program();

    let result = evaluator
        .execute(&greet_workflow(), Map::new(), Some(&program))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Paused);
    // No flow persisted: the cache seed is the only AST source.

    let worker = Worker::new(
        store.clone() as Arc<dyn WorkflowStore>,
        evaluator,
        WorkerConfig::new("greeter"),
    );
    register_greet_handler(&worker);
    worker.cache_workflow_ast(&result.workflow_id, greet_workflow(), Some(program));

    assert_eq!(worker.poll_once().await, 1);

    let workflow = store.get_workflow(&result.workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.state, WorkflowState::Completed);
}

#[tokio::test]
async fn failed_handler_fails_task_step_and_workflow() {
    let (evaluator, store) = harness();
    let program = greet_program();
    let workflow_ir = greet_workflow();

    let result = evaluator
        .execute(&workflow_ir, Map::new(), Some(&program))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Paused);
    persist_flow(&store, &result.workflow_id).await;

    let worker = Worker::new(
        store.clone() as Arc<dyn WorkflowStore>,
        evaluator.clone(),
        WorkerConfig::new("greeter"),
    );
    worker.register("Greet", |_payload| async move {
        Err("greeting backend unreachable".to_string())
    });

    assert_eq!(worker.poll_once().await, 1);

    let tasks = store.list_tasks(&result.workflow_id).await.unwrap();
    assert_eq!(tasks[0].state, TaskState::Failed);
    assert!(tasks[0]
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("greeting backend unreachable"));

    // The worker does not resume a failed step; the next resume reports
    // the propagated error.
    let result = evaluator
        .resume(&result.workflow_id, &workflow_ir, Some(&program), None)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result
        .error
        .unwrap()
        .message
        .contains("greeting backend unreachable"));
}

#[tokio::test]
async fn two_workers_claim_five_tasks_exactly_once() {
    init_tracing();
    let (evaluator, store) = harness();
    let program = greet_program();

    // Five paused workflows, five pending tasks in the queue.
    let mut workflow_ids = Vec::new();
    for _ in 0..5 {
        let result = evaluator
            .execute(&greet_workflow(), Map::new(), Some(&program))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Paused);
        persist_flow(&store, &result.workflow_id).await;
        workflow_ids.push(result.workflow_id);
    }
    assert_eq!(store.pending_task_count(), 5);

    let invocations = Arc::new(AtomicUsize::new(0));
    let make_worker = |name: &str| {
        let worker = Worker::new(
            store.clone() as Arc<dyn WorkflowStore>,
            evaluator.clone(),
            WorkerConfig::new(name)
                .with_poll_interval(Duration::from_millis(10))
                .with_max_concurrent(2),
        );
        let count = Arc::clone(&invocations);
        worker.register("Greet", move |payload| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                let mut result = Map::new();
                result.insert("message".to_string(), json!(format!("Hello, {name}!")));
                Ok(result)
            }
        });
        Arc::new(worker)
    };

    let worker_a = make_worker("worker-a");
    let worker_b = make_worker("worker-b");

    let run_a = {
        let w = Arc::clone(&worker_a);
        tokio::spawn(async move { w.start().await })
    };
    let run_b = {
        let w = Arc::clone(&worker_b);
        tokio::spawn(async move { w.start().await })
    };

    // Wait until every task reaches a terminal state.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut done = 0;
        for wf in &workflow_ids {
            let tasks = store.list_tasks(wf).await.unwrap();
            done += tasks
                .iter()
                .filter(|t| t.state == TaskState::Completed)
                .count();
        }
        if done == 5 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workers did not drain the queue"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    worker_a.stop();
    worker_b.stop();
    run_a.await.unwrap().unwrap();
    run_b.await.unwrap().unwrap();

    // Exactly five claims across both workers: at-most-once execution.
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
    assert_eq!(store.pending_task_count(), 0);

    for wf in &workflow_ids {
        let record = store.get_workflow(wf).await.unwrap().unwrap();
        assert_eq!(record.state, WorkflowState::Completed);
    }
}
