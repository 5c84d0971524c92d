//! End-to-end evaluator scenarios: dependency-driven evaluation,
//! pause/resume on event facets, foreach fan-out, and failure
//! propagation.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use weft_runtime::{
    DependencyGraph, Evaluator, ExecutionStatus, InMemoryDispatcher, MemoryStore, StepState,
    TaskState, Telemetry, WorkflowState, WorkflowStore,
};

use common::*;

fn harness() -> (Evaluator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let evaluator = Evaluator::new(store.clone() as Arc<dyn WorkflowStore>)
        .with_telemetry(Arc::new(Telemetry::new(true)));
    (evaluator, store)
}

#[tokio::test]
async fn sequential_linear_chain() {
    let (evaluator, _) = harness();

    let result = evaluator
        .execute(&test_one_workflow(), inputs(json!({"input": 1})), None)
        .await
        .unwrap();

    // input=1, s1=2, s2=3, output=4
    assert!(result.success());
    assert_eq!(result.outputs.get("output"), Some(&json!(4)));
}

#[tokio::test]
async fn linear_chain_uses_declared_default() {
    let (evaluator, _) = harness();

    let result = evaluator
        .execute(&test_one_workflow(), Map::new(), None)
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.outputs.get("output"), Some(&json!(4)));
}

#[tokio::test]
async fn parallel_fan_in() {
    let (evaluator, _) = harness();

    let result = evaluator
        .execute(&test_two_workflow(), inputs(json!({"input": 1})), None)
        .await
        .unwrap();

    // a=2, b=11, c=13
    assert!(result.success());
    assert_eq!(result.outputs.get("output"), Some(&json!(13)));
}

#[tokio::test]
async fn fan_in_reports_both_branches_ready_together() {
    let body = test_two_workflow()["body"].clone();
    let graph = DependencyGraph::from_block(&body).unwrap();

    let ready: HashSet<String> = graph
        .get_ready(&HashSet::new())
        .iter()
        .map(|s| s.id.clone())
        .collect();

    assert!(ready.contains("step-a"));
    assert!(ready.contains("step-b"));
    assert!(!ready.contains("step-c"));
}

#[tokio::test]
async fn event_facet_pauses_and_resumes() {
    let (evaluator, store) = harness();
    let program = greet_program();
    let workflow = greet_workflow();

    let result = evaluator
        .execute(&workflow, Map::new(), Some(&program))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Paused);

    // Exactly one pending task for the transmitting step.
    let tasks = store.list_tasks(&result.workflow_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.name, "Greet");
    assert_eq!(task.data.get("name"), Some(&json!("World")));

    let step = store.get_step(&task.step_id).await.unwrap().unwrap();
    assert_eq!(step.state(), StepState::EventTransmit);

    let workflow_record = store.get_workflow(&result.workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow_record.state, WorkflowState::Paused);

    // Handler returns arrive; the workflow resumes to completion.
    evaluator
        .continue_step(&task.step_id, &inputs(json!({"message": "Hello, World!"})))
        .await
        .unwrap();

    let result = evaluator
        .resume(&result.workflow_id, &workflow, Some(&program), None)
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.outputs.get("greeting"), Some(&json!("Hello, World!")));
}

#[tokio::test]
async fn inline_dispatch_skips_the_task_queue() {
    let (evaluator, store) = harness();
    let program = greet_program();

    let dispatcher = InMemoryDispatcher::new();
    dispatcher.register("Greet", |payload| async move {
        let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or("?");
        let mut result = Map::new();
        result.insert("message".to_string(), json!(format!("Hello, {name}!")));
        Ok(result)
    });

    let result = evaluator
        .execute_with_dispatcher(&greet_workflow(), Map::new(), Some(&program), Some(&dispatcher))
        .await
        .unwrap();

    // Completed in a single call: no pause, no task.
    assert!(result.success());
    assert_eq!(result.outputs.get("greeting"), Some(&json!("Hello, World!")));
    assert_eq!(store.task_count(), 0);
}

#[tokio::test]
async fn handler_failure_propagates_to_the_root() {
    let (evaluator, store) = harness();
    let program = greet_program();
    let workflow = greet_workflow();

    let result = evaluator
        .execute(&workflow, Map::new(), Some(&program))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Paused);

    let task = store.list_tasks(&result.workflow_id).await.unwrap().remove(0);
    evaluator
        .fail_step(&task.step_id, "greeting service is down")
        .await
        .unwrap();

    // The task carries the raised message.
    let failed_task = store.get_task(&task.uuid).await.unwrap().unwrap();
    assert_eq!(failed_task.state, TaskState::Failed);
    assert_eq!(failed_task.error.unwrap().message, "greeting service is down");

    // The step sits in the error sink.
    let step = store.get_step(&task.step_id).await.unwrap().unwrap();
    assert!(step.is_error());

    // Resumption propagates the failure through the containment tree.
    let result = evaluator
        .resume(&result.workflow_id, &workflow, Some(&program), None)
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Error);
    let error = result.error.unwrap();
    assert!(error.message.contains("greeting service is down"));
    assert_eq!(error.step_id, Some(task.step_id.clone()));

    let root = store.get_workflow_root(&result.workflow_id).await.unwrap().unwrap();
    assert!(root.is_error());

    let record = store.get_workflow(&result.workflow_id).await.unwrap().unwrap();
    assert_eq!(record.state, WorkflowState::Failed);
}

// =============================================================================
// Foreach fan-out
// =============================================================================

/// `SamplePipeline(samples: Json) => (...) andThen foreach sample in
/// $.samples { qc -> aligned -> called; yield ... }`.
fn sample_pipeline_workflow() -> Value {
    json!({
        "type": "WorkflowDecl",
        "name": "SamplePipeline",
        "params": [{"name": "samples", "type": "Json"}],
        "returns": [
            {"name": "gvcf_path", "type": "String"},
            {"name": "sample_id", "type": "String"},
        ],
        "body": {
            "type": "AndThenBlock",
            "foreach": {"type": "ForeachClause", "var": "sample", "in": input_ref(&["samples"])},
            "steps": [
                step_stmt("step-qc", "qc", "QcReads", vec![
                    arg("sample_id", input_ref(&["sample", "sample_id"])),
                    arg("r1_uri", input_ref(&["sample", "r1_uri"])),
                ]),
                step_stmt("step-align", "aligned", "AlignReads", vec![
                    arg("sample_id", step_ref(&["qc", "sample_id"])),
                    arg("clean_fastq_path", step_ref(&["qc", "clean_fastq_path"])),
                ]),
                step_stmt("step-call", "called", "CallVariants", vec![
                    arg("sample_id", step_ref(&["aligned", "sample_id"])),
                    arg("bam_path", step_ref(&["aligned", "bam_path"])),
                ]),
            ],
            "yield": yield_stmt("yield-1", "SamplePipeline", vec![
                arg("gvcf_path", step_ref(&["called", "gvcf_path"])),
                arg("sample_id", step_ref(&["called", "sample_id"])),
            ]),
        },
    })
}

fn sample_pipeline_program() -> Value {
    let event_facet = |name: &str| {
        json!({"type": "EventFacetDecl", "name": name})
    };
    json!({
        "type": "Program",
        "namespaces": [{
            "type": "Namespace",
            "name": "genomics.pipeline",
            "eventFacets": [
                event_facet("QcReads"),
                event_facet("AlignReads"),
                event_facet("CallVariants"),
            ],
            "workflows": [sample_pipeline_workflow()],
        }],
    })
}

/// Synthetic handler results keyed on the sample id.
fn mock_handler_result(facet_short: &str, payload: &Map<String, Value>) -> Map<String, Value> {
    let sample_id = payload
        .get("sample_id")
        .and_then(|v| v.as_str())
        .unwrap_or("?")
        .to_string();

    let result = match facet_short {
        "QcReads" => json!({
            "sample_id": sample_id,
            "clean_fastq_path": format!("/clean/{sample_id}.fastq"),
        }),
        "AlignReads" => json!({
            "sample_id": sample_id,
            "bam_path": format!("/bam/{sample_id}.bam"),
        }),
        "CallVariants" => json!({
            "sample_id": sample_id,
            "gvcf_path": format!("/gvcf/{sample_id}.g.vcf"),
        }),
        other => panic!("no mock handler for '{other}'"),
    };
    result.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn foreach_fans_out_one_sub_block_per_sample() {
    let (evaluator, store) = harness();
    let workflow = sample_pipeline_workflow();
    let program = sample_pipeline_program();

    let samples = json!([
        {"sample_id": "S1", "r1_uri": "s3://reads/S1_R1.fastq"},
        {"sample_id": "S2", "r1_uri": "s3://reads/S2_R1.fastq"},
        {"sample_id": "S3", "r1_uri": "s3://reads/S3_R1.fastq"},
        {"sample_id": "S4", "r1_uri": "s3://reads/S4_R1.fastq"},
    ]);

    let mut result = evaluator
        .execute(&workflow, inputs(json!({"samples": samples})), Some(&program))
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Paused);

    // Drive every pending event through a mock handler until no work is
    // left: four samples, three sequential facets each.
    let mut continued = 0;
    let mut samples_seen: HashSet<String> = HashSet::new();

    while result.status == ExecutionStatus::Paused {
        let pending: Vec<_> = store
            .list_tasks(&result.workflow_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.state == TaskState::Pending)
            .collect();
        assert!(!pending.is_empty(), "paused with no pending tasks");

        for task in pending {
            let claimed = store
                .claim_task(&[task.name.clone()], "default", "test-runner")
                .await
                .unwrap()
                .expect("pending task is claimable");

            let short = claimed.name.rsplit('.').next().unwrap_or(&claimed.name);
            if let Some(id) = claimed.data.get("sample_id").and_then(|v| v.as_str()) {
                samples_seen.insert(id.to_string());
            }

            let returns = mock_handler_result(short, &claimed.data);
            evaluator.continue_step(&claimed.step_id, &returns).await.unwrap();

            let mut done = claimed.clone();
            done.state = TaskState::Completed;
            store.save_task(&done).await.unwrap();
            continued += 1;
        }

        result = evaluator
            .resume(&result.workflow_id, &workflow, Some(&program), None)
            .await
            .unwrap();
    }

    assert!(result.success());
    assert_eq!(continued, 12);
    assert_eq!(samples_seen.len(), 4);

    // The yielded outputs hold one record per sample, in input order.
    let results = result.outputs.get("results").and_then(|v| v.as_array()).unwrap();
    assert_eq!(results.len(), 4);
    for (i, record) in results.iter().enumerate() {
        let expected_id = format!("S{}", i + 1);
        assert_eq!(record["sample_id"], json!(expected_id));
        assert_eq!(record["gvcf_path"], json!(format!("/gvcf/{expected_id}.g.vcf")));
    }
}

#[tokio::test]
async fn block_children_are_terminal_when_the_block_is() {
    let (evaluator, store) = harness();

    let result = evaluator
        .execute(&test_one_workflow(), inputs(json!({"input": 1})), None)
        .await
        .unwrap();
    assert!(result.success());

    // Every step of the finished workflow is terminal, and every block's
    // children completed with it.
    let steps = store.get_steps_by_workflow(&result.workflow_id).await.unwrap();
    assert!(!steps.is_empty());
    for step in &steps {
        assert!(step.is_terminal(), "step {} not terminal", step.id);
        if step.is_block() {
            for child in steps.iter().filter(|s| s.container_id == step.id && s.id != step.id) {
                assert!(child.is_terminal());
            }
        }
    }
}
