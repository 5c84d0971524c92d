//! Iterative evaluator.
//!
//! Drives a workflow instance from creation to a terminal or paused
//! state. Each pass over the live steps is an **iteration**: every step
//! advances by at most one state through its transition table, and the
//! resulting deltas — created steps, state transitions, attribute
//! updates, task creations — commit atomically through the persistence
//! contract.
//!
//! Restart safety: every iteration begins by reloading state from
//! persistence, and step creation is idempotent on the
//! `(statement_id, block_id, iteration_key)` key, so a retried iteration
//! never duplicates work. A `VersionMismatch` from the commit means a
//! concurrent writer won; the evaluator reloads and retries a bounded
//! number of times.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use weft_program::{find_facet, qualify_facet_name, Expr, FacetKind};

use crate::dispatch::HandlerDispatcher;
use crate::error::RuntimeError;
use crate::graph::{call_args, DependencyGraph, StatementDef};
use crate::ids;
use crate::persistence::{
    IterationChanges, StoreError, TaskError, TaskRecord, TaskState, WorkflowRecord, WorkflowState,
    WorkflowStore,
};
use crate::reduce::{reduce, EvalEnv};
use crate::states::{ObjectType, StepState};
use crate::step::{IterationKey, StepDefinition};
use crate::telemetry::Telemetry;

/// Evaluator configuration.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Hard ceiling on iterations per `execute`/`resume` call.
    pub max_iterations: u32,

    /// Bounded retries when a commit loses the compare-and-set race.
    pub version_retry_limit: u32,

    /// Task list stamped on created event tasks.
    pub task_list: String,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            version_retry_limit: 5,
            task_list: "default".to_string(),
        }
    }
}

/// Terminal classification of an `execute`/`resume` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    Paused,
    Error,
}

/// User-visible failure detail.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    pub kind: String,
    pub message: String,
    pub step_id: Option<String>,
}

/// Outcome of an `execute`/`resume` call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub workflow_id: String,
    pub outputs: Map<String, Value>,
    pub iterations: u32,
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// What one iteration did.
enum IterationOutcome {
    /// At least one step changed or was created.
    Advanced,
    /// Nothing changed; a step is waiting on an external event.
    BlockedOnEvent,
    /// Nothing changed and nothing is pending externally.
    Stuck,
}

/// The iterative evaluator. Cheap to clone behind `Arc`s; all state is
/// in the store.
pub struct Evaluator {
    store: Arc<dyn WorkflowStore>,
    telemetry: Arc<Telemetry>,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            telemetry: Arc::new(Telemetry::new(false)),
            config: EvaluatorConfig::default(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_config(mut self, config: EvaluatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    // =========================================================================
    // Public Surface
    // =========================================================================

    /// Execute a compiled workflow with the given inputs.
    ///
    /// Creates the workflow instance and its root step, then runs the
    /// iteration loop until the workflow completes, pauses on an external
    /// event, or fails.
    pub async fn execute(
        &self,
        workflow_ir: &Value,
        inputs: Map<String, Value>,
        program_ir: Option<&Value>,
    ) -> Result<ExecutionResult, RuntimeError> {
        self.execute_with_dispatcher(workflow_ir, inputs, program_ir, None)
            .await
    }

    /// [`execute`](Self::execute) with an inline dispatcher: event facets
    /// the dispatcher can handle are invoked during evaluation instead of
    /// pausing the workflow.
    pub async fn execute_with_dispatcher(
        &self,
        workflow_ir: &Value,
        inputs: Map<String, Value>,
        program_ir: Option<&Value>,
        dispatcher: Option<&dyn HandlerDispatcher>,
    ) -> Result<ExecutionResult, RuntimeError> {
        let name = workflow_name(workflow_ir)?;
        let workflow_id = ids::workflow_id();
        let inputs = apply_param_defaults(workflow_ir, inputs)?;

        let workflow = WorkflowRecord {
            uuid: workflow_id.clone(),
            name: name.to_string(),
            flow_id: String::new(),
            state: WorkflowState::Running,
            inputs: inputs.clone(),
            outputs: Map::new(),
            start_time: Utc::now(),
            end_time: None,
            iterations: 0,
        };
        self.store
            .save_workflow(&workflow)
            .await
            .map_err(store_err)?;

        let mut root = StepDefinition::create(&workflow_id, ObjectType::Workflow)
            .with_statement_id(statement_id_of(workflow_ir, name))
            .with_facet_name(name);
        for (k, v) in &inputs {
            root.set_param(k.clone(), v.clone());
        }
        self.store.save_step(&root).await.map_err(store_err)?;

        info!(%workflow_id, workflow = name, "executing workflow");
        self.emit(
            "workflow.start",
            json!({"workflow_id": workflow_id, "name": name}),
        );

        let ctx = ExecutionContext {
            workflow_id,
            workflow_ir,
            program_ir,
            dispatcher,
        };
        self.run_loop(ctx, workflow).await
    }

    /// Resume a paused workflow.
    ///
    /// Identical to [`execute`](Self::execute) except the root step is
    /// reloaded instead of created.
    pub async fn resume(
        &self,
        workflow_id: &str,
        workflow_ir: &Value,
        program_ir: Option<&Value>,
        dispatcher: Option<&dyn HandlerDispatcher>,
    ) -> Result<ExecutionResult, RuntimeError> {
        let mut workflow = self
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| RuntimeError::StepNotFound(format!("workflow {workflow_id}")))?;

        self.store
            .get_workflow_root(workflow_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| RuntimeError::StepNotFound(format!("root of {workflow_id}")))?;

        workflow.state = WorkflowState::Running;
        self.store
            .save_workflow(&workflow)
            .await
            .map_err(store_err)?;

        debug!(%workflow_id, "resuming workflow");
        self.emit("workflow.resume", json!({"workflow_id": workflow_id}));

        let ctx = ExecutionContext {
            workflow_id: workflow_id.to_string(),
            workflow_ir,
            program_ir,
            dispatcher,
        };
        self.run_loop(ctx, workflow).await
    }

    /// External completion of a paused step: populate its returns,
    /// advance it out of `EventTransmit`, and leave the workflow ready
    /// for [`resume`](Self::resume).
    pub async fn continue_step(
        &self,
        step_id: &str,
        returns: &Map<String, Value>,
    ) -> Result<(), RuntimeError> {
        let mut step = self
            .store
            .get_step(step_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| RuntimeError::StepNotFound(step_id.to_string()))?;
        step.reset_transition();

        if step.state() != StepState::EventTransmit {
            return Err(RuntimeError::InvalidStepState {
                step_id: step_id.to_string(),
                state: step.state(),
            });
        }

        step.attributes.set_returns_json(returns);
        step.change_state(StepState::StatementCaptureEnd)?;
        self.store.save_step(&step).await.map_err(store_err)?;

        debug!(%step_id, "step continued");
        self.emit(
            "step.transition",
            json!({"step_id": step_id, "state": step.state().to_string()}),
        );
        Ok(())
    }

    /// External failure of a paused step: drive it to the error sink and
    /// mark its task failed. The failure propagates to the root on the
    /// next iterations of [`resume`](Self::resume).
    pub async fn fail_step(&self, step_id: &str, message: &str) -> Result<(), RuntimeError> {
        let mut step = self
            .store
            .get_step(step_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| RuntimeError::StepNotFound(step_id.to_string()))?;
        step.reset_transition();

        step.mark_error(RuntimeError::Handler(message.to_string()));
        self.store.save_step(&step).await.map_err(store_err)?;

        if let Some(mut task) = self
            .store
            .get_task_by_step(step_id)
            .await
            .map_err(store_err)?
        {
            task.state = TaskState::Failed;
            task.error = Some(TaskError {
                message: message.to_string(),
            });
            task.updated = Utc::now();
            self.store.save_task(&task).await.map_err(store_err)?;
        }

        warn!(%step_id, message, "step failed");
        self.emit(
            "step.transition",
            json!({"step_id": step_id, "state": StepState::StatementError.to_string()}),
        );
        Ok(())
    }

    // =========================================================================
    // Iteration Loop
    // =========================================================================

    async fn run_loop(
        &self,
        ctx: ExecutionContext<'_>,
        mut workflow: WorkflowRecord,
    ) -> Result<ExecutionResult, RuntimeError> {
        let mut failure: Option<ExecutionError> = None;

        while workflow.iterations < self.config.max_iterations {
            workflow.iterations += 1;

            let outcome = match self.run_iteration_with_retries(&ctx, &mut failure).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = failure.take().unwrap_or(ExecutionError {
                        kind: e.kind_str().to_string(),
                        message: e.to_string(),
                        step_id: None,
                    });
                    return self.finish_failed(ctx, workflow, error).await;
                }
            };

            let root = self
                .store
                .get_workflow_root(&ctx.workflow_id)
                .await
                .map_err(store_err)?
                .ok_or_else(|| RuntimeError::StepNotFound(format!("root of {}", ctx.workflow_id)))?;

            if root.is_complete() {
                workflow.state = WorkflowState::Completed;
                workflow.outputs = root.attributes.returns_json();
                workflow.end_time = Some(Utc::now());
                self.store
                    .save_workflow(&workflow)
                    .await
                    .map_err(store_err)?;
                info!(workflow_id = %ctx.workflow_id, iterations = workflow.iterations, "workflow completed");
                self.emit(
                    "workflow.complete",
                    json!({"workflow_id": ctx.workflow_id, "iterations": workflow.iterations}),
                );
                return Ok(ExecutionResult {
                    status: ExecutionStatus::Completed,
                    workflow_id: ctx.workflow_id,
                    outputs: workflow.outputs,
                    iterations: workflow.iterations,
                    error: None,
                });
            }

            if root.is_error() {
                let error = failure.take().unwrap_or_else(|| ExecutionError {
                    kind: root
                        .error_kind
                        .clone()
                        .unwrap_or_else(|| "StatementError".to_string()),
                    message: root
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "workflow root reached the error sink".to_string()),
                    step_id: root.error_step_id.clone().or_else(|| Some(root.id.clone())),
                });
                return self.finish_failed(ctx, workflow, error).await;
            }

            match outcome {
                IterationOutcome::Advanced => continue,
                IterationOutcome::BlockedOnEvent => {
                    workflow.state = WorkflowState::Paused;
                    self.store
                        .save_workflow(&workflow)
                        .await
                        .map_err(store_err)?;
                    debug!(workflow_id = %ctx.workflow_id, "workflow paused on external event");
                    self.emit(
                        "workflow.pause",
                        json!({"workflow_id": ctx.workflow_id, "iterations": workflow.iterations}),
                    );
                    return Ok(ExecutionResult {
                        status: ExecutionStatus::Paused,
                        workflow_id: ctx.workflow_id,
                        outputs: Map::new(),
                        iterations: workflow.iterations,
                        error: None,
                    });
                }
                IterationOutcome::Stuck => {
                    let error = failure.unwrap_or_else(|| ExecutionError {
                        kind: "DependencyNotSatisfied".to_string(),
                        message: "no step advanced and no event is pending".to_string(),
                        step_id: None,
                    });
                    return self.finish_failed(ctx, workflow, error).await;
                }
            }
        }

        let error = ExecutionError {
            kind: "EvaluationError".to_string(),
            message: format!("exceeded {} iterations", self.config.max_iterations),
            step_id: None,
        };
        self.finish_failed(ctx, workflow, error).await
    }

    async fn finish_failed(
        &self,
        ctx: ExecutionContext<'_>,
        mut workflow: WorkflowRecord,
        error: ExecutionError,
    ) -> Result<ExecutionResult, RuntimeError> {
        workflow.state = WorkflowState::Failed;
        workflow.end_time = Some(Utc::now());
        self.store
            .save_workflow(&workflow)
            .await
            .map_err(store_err)?;
        warn!(workflow_id = %ctx.workflow_id, kind = %error.kind, message = %error.message, "workflow failed");
        self.emit(
            "workflow.error",
            json!({"workflow_id": ctx.workflow_id, "kind": error.kind, "message": error.message}),
        );
        Ok(ExecutionResult {
            status: ExecutionStatus::Error,
            workflow_id: ctx.workflow_id,
            outputs: Map::new(),
            iterations: workflow.iterations,
            error: Some(error),
        })
    }

    async fn run_iteration_with_retries(
        &self,
        ctx: &ExecutionContext<'_>,
        failure: &mut Option<ExecutionError>,
    ) -> Result<IterationOutcome, RuntimeError> {
        let mut attempts = 0;
        loop {
            match self.run_iteration(ctx, failure).await {
                Ok(outcome) => return Ok(outcome),
                Err(RuntimeError::VersionMismatch(step_id)) => {
                    attempts += 1;
                    if attempts > self.config.version_retry_limit {
                        return Err(RuntimeError::VersionMismatch(step_id));
                    }
                    debug!(%step_id, attempts, "commit conflict, reloading iteration");
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// One pass over the live steps. Returns what the pass accomplished;
    /// all effects are committed atomically before returning.
    async fn run_iteration(
        &self,
        ctx: &ExecutionContext<'_>,
        failure: &mut Option<ExecutionError>,
    ) -> Result<IterationOutcome, RuntimeError> {
        let mut steps: HashMap<String, StepDefinition> = self
            .store
            .get_steps_by_workflow(&ctx.workflow_id)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|mut s| {
                s.reset_transition();
                (s.id.clone(), s)
            })
            .collect();

        // Creation order: ids are time-ordered.
        let mut live_ids: Vec<String> = steps
            .values()
            .filter(|s| !s.is_terminal())
            .map(|s| s.id.clone())
            .collect();
        live_ids.sort();

        let mut changes = IterationChanges::new();
        let mut waiting_on_event = false;

        for id in live_ids {
            let Some(mut step) = steps.get(&id).cloned() else {
                continue;
            };

            if step.state() == StepState::EventTransmit {
                waiting_on_event = true;
                continue;
            }

            self.advance_step(ctx, &mut step, &steps, &mut changes, failure)
                .await?;

            if step.state() == StepState::EventTransmit {
                waiting_on_event = true;
            }
            if step.transition.changed {
                changes.add_updated_step(step.transition.original_state, step.clone());
                self.emit(
                    "step.transition",
                    json!({"step_id": step.id, "state": step.state().to_string()}),
                );
            }
            steps.insert(id, step);
        }

        let advanced =
            !changes.updated_steps.is_empty() || !changes.created_steps.is_empty();

        for created in &changes.created_steps {
            self.emit(
                "step.create",
                json!({"step_id": created.id, "statement_id": created.statement_id}),
            );
            steps.insert(created.id.clone(), created.clone());
        }
        for task in &changes.created_tasks {
            self.emit(
                "task.create",
                json!({"task_id": task.uuid, "name": task.name, "step_id": task.step_id}),
            );
        }

        if !changes.is_empty() {
            self.store.commit(changes).await.map_err(|e| match e {
                StoreError::VersionMismatch { step_id, .. } => {
                    RuntimeError::VersionMismatch(step_id)
                }
                other => store_err(other),
            })?;
        }

        if advanced {
            Ok(IterationOutcome::Advanced)
        } else if waiting_on_event {
            Ok(IterationOutcome::BlockedOnEvent)
        } else {
            Ok(IterationOutcome::Stuck)
        }
    }

    // =========================================================================
    // Per-Step Advancement
    // =========================================================================

    /// Advance one step by at most one state. Side effects (created
    /// children, tasks) accumulate into `changes`.
    async fn advance_step(
        &self,
        ctx: &ExecutionContext<'_>,
        step: &mut StepDefinition,
        steps: &HashMap<String, StepDefinition>,
        changes: &mut IterationChanges,
        failure: &mut Option<ExecutionError>,
    ) -> Result<(), RuntimeError> {
        let result = if step.is_block() {
            self.advance_block(ctx, step, steps, changes)
        } else {
            self.advance_statement(ctx, step, steps, changes).await
        };

        if let Err(error) = result {
            // Evaluator-internal failures park the step in the error
            // sink; the container picks it up on the next iteration.
            self.record_failure(failure, &error, &step.id);
            step.mark_error(error);
        }
        Ok(())
    }

    fn record_failure(
        &self,
        failure: &mut Option<ExecutionError>,
        error: &RuntimeError,
        step_id: &str,
    ) {
        if failure.is_none() {
            *failure = Some(ExecutionError {
                kind: error.kind_str().to_string(),
                message: error.to_string(),
                step_id: Some(step_id.to_string()),
            });
        }
    }

    /// Statement-shaped steps: `Workflow`, `VariableAssignment`,
    /// `YieldAssignment`.
    async fn advance_statement(
        &self,
        ctx: &ExecutionContext<'_>,
        step: &mut StepDefinition,
        steps: &HashMap<String, StepDefinition>,
        changes: &mut IterationChanges,
    ) -> Result<(), RuntimeError> {
        match step.state() {
            StepState::Created
            | StepState::FacetInitEnd
            | StepState::MixinBlocksBegin
            | StepState::MixinBlocksEnd
            | StepState::StatementBlocksEnd
            | StepState::StatementCaptureEnd => {
                self.advance_to_next(step)?;
            }

            StepState::FacetInitBegin => {
                if step.object_type == ObjectType::Workflow {
                    // Root params were populated at creation.
                    self.advance_to_next(step)?;
                } else if self.resolve_statement_params(ctx, step, steps)? {
                    self.advance_to_next(step)?;
                }
                // Unresolved sibling dependency: skip this iteration.
            }

            StepState::StatementBlocksBegin => {
                if step.object_type == ObjectType::Workflow {
                    self.expand_workflow_body(ctx, step, steps, changes)?;
                } else {
                    self.advance_to_next(step)?;
                }
            }

            StepState::StatementCaptureBegin => {
                self.capture_statement(ctx, step, steps, changes).await?;
            }

            StepState::EventTransmit => {
                // Held here until continue_step / fail_step.
            }

            other => {
                return Err(RuntimeError::InvalidStepState {
                    step_id: step.id.clone(),
                    state: other,
                });
            }
        }
        Ok(())
    }

    /// Block-shaped steps: `AndThen`, `Block`, `Foreach` (and the other
    /// block kinds sharing the table).
    fn advance_block(
        &self,
        ctx: &ExecutionContext<'_>,
        step: &mut StepDefinition,
        steps: &HashMap<String, StepDefinition>,
        changes: &mut IterationChanges,
    ) -> Result<(), RuntimeError> {
        match step.state() {
            StepState::Created | StepState::BlockInitEnd | StepState::BlockExecutionEnd => {
                self.advance_to_next(step)?;
            }

            StepState::BlockInitBegin => {
                if step.object_type == ObjectType::Foreach {
                    // Reduce the `in` expression once; the sequence is
                    // persisted so a restarted iteration sees the same
                    // fan-out.
                    let items = self.reduce_foreach_items(ctx, step)?;
                    step.set_param(FOREACH_ITEMS_PARAM, Value::Array(items));
                }
                self.advance_to_next(step)?;
            }

            StepState::BlockExecutionBegin => {
                if step.object_type == ObjectType::Foreach {
                    self.materialize_foreach_iterations(ctx, step, steps, changes)?;
                } else {
                    self.materialize_ready_statements(ctx, step, steps, changes)?;
                }
                self.advance_to_next(step)?;
            }

            StepState::BlockExecutionContinue => {
                if step.object_type == ObjectType::Foreach {
                    self.continue_foreach(step, steps)?;
                } else {
                    self.continue_block(ctx, step, steps, changes)?;
                }
            }

            other => {
                return Err(RuntimeError::InvalidStepState {
                    step_id: step.id.clone(),
                    state: other,
                });
            }
        }
        Ok(())
    }

    fn advance_to_next(&self, step: &mut StepDefinition) -> Result<(), RuntimeError> {
        let next = step.select_next_state().ok_or(RuntimeError::InvalidStepState {
            step_id: step.id.clone(),
            state: step.state(),
        })?;
        step.change_state(next)
    }

    // =========================================================================
    // Statement Side Effects
    // =========================================================================

    /// Reduce the statement's call arguments into its params. Returns
    /// `false` when a sibling dependency is not yet complete, which skips
    /// the step for this iteration.
    fn resolve_statement_params(
        &self,
        ctx: &ExecutionContext<'_>,
        step: &mut StepDefinition,
        steps: &HashMap<String, StepDefinition>,
    ) -> Result<bool, RuntimeError> {
        let container = steps
            .get(&step.container_id)
            .ok_or_else(|| RuntimeError::BlockNotFound(step.container_id.clone()))?;
        let graph = self.block_graph(ctx)?;
        let stmt = graph
            .statement(&step.statement_id)
            .ok_or_else(|| RuntimeError::DependencyNotSatisfied(step.statement_id.clone()))?;

        let inputs = container.attributes.params_json();
        let sibling_returns = sibling_returns(&graph, step, steps);
        let binding = container.iteration_key.as_ref();

        let env = EvalEnv {
            inputs: Some(&inputs),
            steps: Some(&sibling_returns),
            binding: binding.map(|k| (k.var.as_str(), &k.value)),
        };

        let mut resolved: Vec<(String, Value)> = Vec::new();
        for arg in call_args(&stmt.node) {
            let name = arg
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| RuntimeError::Evaluation("argument missing name".into()))?;
            let value_node = arg
                .get("value")
                .ok_or_else(|| RuntimeError::Evaluation("argument missing value".into()))?;
            let expr =
                Expr::from_ir(value_node).map_err(|e| RuntimeError::Evaluation(e.to_string()))?;

            match reduce(&expr, &env) {
                Ok(value) => resolved.push((name.to_string(), value)),
                Err(RuntimeError::Reference(reference)) => {
                    if references_pending_sibling(&graph, &reference, step, steps) {
                        return Ok(false);
                    }
                    return Err(RuntimeError::Reference(reference));
                }
                Err(other) => return Err(other),
            }
        }

        for (name, value) in resolved {
            step.set_param(name, value);
        }
        Ok(true)
    }

    /// Materialize the workflow body as a child block step, then hold
    /// until the body is terminal.
    fn expand_workflow_body(
        &self,
        ctx: &ExecutionContext<'_>,
        step: &mut StepDefinition,
        steps: &HashMap<String, StepDefinition>,
        changes: &mut IterationChanges,
    ) -> Result<(), RuntimeError> {
        let Some(body) = ctx.workflow_ir.get("body") else {
            // Bodiless workflow: nothing to expand.
            self.advance_to_next(step)?;
            return Ok(());
        };

        let body_stmt_id = body_statement_id(ctx.workflow_ir, body);
        let children: Vec<&StepDefinition> = steps
            .values()
            .filter(|s| s.container_id == step.id && s.id != step.id)
            .collect();
        let already_created = children
            .iter()
            .any(|c| c.statement_id == body_stmt_id)
            || changes
                .created_steps
                .iter()
                .any(|c| c.statement_id == body_stmt_id && c.container_id == step.id);

        if !already_created {
            let object_type = if body.get("foreach").is_some() {
                ObjectType::Foreach
            } else {
                ObjectType::AndThen
            };
            let mut block = StepDefinition::create(&step.workflow_id, object_type)
                .with_statement_id(&body_stmt_id)
                .with_block_id(&step.id)
                .with_container(&step.id, &step.root_id);
            // The body block carries the workflow inputs as its own
            // params: the reducer env of every child reads them there.
            block.attributes.params = step.attributes.params.clone();
            changes.add_created_step(block);
            return Ok(());
        }

        if let Some(errored) = children.iter().find(|c| c.is_error()) {
            step.propagate_error_from(errored);
            return Ok(());
        }
        if children.iter().all(|c| c.is_terminal()) && !children.is_empty() {
            self.advance_to_next(step)?;
        }
        Ok(())
    }

    /// Statement capture: the point where a statement's returns come into
    /// existence — an inline handler result, the identity of the params,
    /// or a task plus `EventTransmit` for an unhandled event facet.
    async fn capture_statement(
        &self,
        ctx: &ExecutionContext<'_>,
        step: &mut StepDefinition,
        steps: &HashMap<String, StepDefinition>,
        changes: &mut IterationChanges,
    ) -> Result<(), RuntimeError> {
        match step.object_type {
            ObjectType::Workflow => {
                // Copy the body block's returns as the workflow outputs.
                for child in steps.values() {
                    if child.container_id == step.id && child.id != step.id && child.is_complete() {
                        let returns = child.attributes.returns_json();
                        step.attributes.set_returns_json(&returns);
                    }
                }
                self.advance_to_next(step)?;
            }

            ObjectType::YieldAssignment => {
                // A yield's returns are the identity image of its params.
                let params = step.attributes.params_json();
                step.attributes.set_returns_json(&params);
                self.advance_to_next(step)?;
            }

            _ => {
                let facet_kind = ctx
                    .program_ir
                    .and_then(|p| find_facet(p, &step.facet_name))
                    .map(|(_, kind)| kind);

                let mut inline = None;
                if let Some(d) = ctx.dispatcher {
                    if d.can_dispatch(&step.facet_name).await {
                        inline = Some(d);
                    }
                }

                if let Some(dispatcher) = inline {
                    let payload = step.attributes.params_json();
                    let returns = dispatcher
                        .dispatch(&step.facet_name, payload)
                        .await
                        .map_err(RuntimeError::from)?;
                    step.attributes.set_returns_json(&returns);
                    self.advance_to_next(step)?;
                } else if facet_kind == Some(FacetKind::Event) {
                    // Await an external handler: record the task and hold
                    // in the transmit side-state.
                    let task = TaskRecord::pending(
                        &step.facet_name,
                        &step.id,
                        &step.workflow_id,
                        &self.config.task_list,
                        step.attributes.params_json(),
                    );
                    changes.add_created_task(task);
                    step.change_state(StepState::EventTransmit)?;
                } else {
                    // Plain facet with no handler: identity returns.
                    let params = step.attributes.params_json();
                    step.attributes.set_returns_json(&params);
                    self.advance_to_next(step)?;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Block Side Effects
    // =========================================================================

    fn block_graph(&self, ctx: &ExecutionContext<'_>) -> Result<DependencyGraph, RuntimeError> {
        let body = ctx
            .workflow_ir
            .get("body")
            .ok_or_else(|| RuntimeError::BlockNotFound("workflow has no body".into()))?;
        DependencyGraph::from_block(body)
    }

    /// Create steps for every statement whose dependencies are satisfied
    /// and whose idempotency key is absent.
    fn materialize_ready_statements(
        &self,
        ctx: &ExecutionContext<'_>,
        block: &StepDefinition,
        steps: &HashMap<String, StepDefinition>,
        changes: &mut IterationChanges,
    ) -> Result<(), RuntimeError> {
        let graph = self.block_graph(ctx)?;

        let children: Vec<&StepDefinition> = steps
            .values()
            .filter(|s| s.block_id == block.id)
            .collect();
        let materialized: HashSet<String> = children
            .iter()
            .map(|c| c.statement_id.clone())
            .chain(
                changes
                    .created_steps
                    .iter()
                    .filter(|c| c.block_id == block.id)
                    .map(|c| c.statement_id.clone()),
            )
            .collect();
        let completed: HashSet<String> = children
            .iter()
            .filter(|c| c.is_complete())
            .map(|c| c.statement_id.clone())
            .collect();

        for stmt in graph.get_ready(&completed) {
            if materialized.contains(&stmt.id) {
                continue;
            }
            changes.add_created_step(self.statement_step(ctx, block, stmt));
        }
        Ok(())
    }

    fn statement_step(
        &self,
        ctx: &ExecutionContext<'_>,
        block: &StepDefinition,
        stmt: &StatementDef,
    ) -> StepDefinition {
        let object_type = if stmt.is_yield {
            ObjectType::YieldAssignment
        } else {
            ObjectType::VariableAssignment
        };
        let facet_name = if stmt.is_yield {
            stmt.target.clone()
        } else {
            qualify_facet_name(ctx.program_ir, &stmt.target)
        };
        StepDefinition::create(&block.workflow_id, object_type)
            .with_statement_id(&stmt.id)
            .with_block_id(&block.id)
            .with_container(&block.id, &block.root_id)
            .with_facet_name(facet_name)
    }

    /// Fold completed children; advance once every statement is
    /// materialized and terminal.
    fn continue_block(
        &self,
        ctx: &ExecutionContext<'_>,
        block: &mut StepDefinition,
        steps: &HashMap<String, StepDefinition>,
        changes: &mut IterationChanges,
    ) -> Result<(), RuntimeError> {
        let graph = self.block_graph(ctx)?;

        let children: Vec<&StepDefinition> = steps
            .values()
            .filter(|s| s.block_id == block.id && s.id != block.id)
            .collect();

        if let Some(errored) = children.iter().find(|c| c.is_error()) {
            block.propagate_error_from(errored);
            return Ok(());
        }

        // Late materialization: statements become ready as siblings
        // complete.
        self.materialize_ready_statements(ctx, block, steps, changes)?;

        let all_materialized = graph
            .statements()
            .iter()
            .all(|stmt| children.iter().any(|c| c.statement_id == stmt.id))
            && !graph.statements().is_empty();
        let all_complete = children.iter().all(|c| c.is_complete());

        if all_materialized && all_complete {
            // The yield's returns become the block's returns.
            for child in &children {
                if child.object_type == ObjectType::YieldAssignment {
                    let returns = child.attributes.returns_json();
                    block.attributes.set_returns_json(&returns);
                }
            }
            self.advance_to_next(block)?;
        } else if graph.statements().is_empty() {
            self.advance_to_next(block)?;
        }
        Ok(())
    }

    // =========================================================================
    // Foreach
    // =========================================================================

    fn reduce_foreach_items(
        &self,
        ctx: &ExecutionContext<'_>,
        block: &StepDefinition,
    ) -> Result<Vec<Value>, RuntimeError> {
        let clause = foreach_clause(ctx.workflow_ir)?;
        let in_node = clause
            .get("in")
            .ok_or_else(|| RuntimeError::Evaluation("foreach clause missing 'in'".into()))?;
        let expr = Expr::from_ir(in_node).map_err(|e| RuntimeError::Evaluation(e.to_string()))?;

        let inputs = block.attributes.params_json();
        let env = EvalEnv {
            inputs: Some(&inputs),
            ..Default::default()
        };
        match reduce(&expr, &env)? {
            Value::Array(items) => Ok(items),
            other => Err(RuntimeError::Evaluation(format!(
                "foreach requires a sequence, got {}",
                match other {
                    Value::Object(_) => "map",
                    Value::String(_) => "string",
                    _ => "scalar",
                }
            ))),
        }
    }

    /// One sub-block per element, disambiguated by iteration key.
    fn materialize_foreach_iterations(
        &self,
        ctx: &ExecutionContext<'_>,
        block: &StepDefinition,
        steps: &HashMap<String, StepDefinition>,
        changes: &mut IterationChanges,
    ) -> Result<(), RuntimeError> {
        let clause = foreach_clause(ctx.workflow_ir)?;
        let var = clause
            .get("var")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RuntimeError::Evaluation("foreach clause missing 'var'".into()))?;

        let items = block
            .get_param(FOREACH_ITEMS_PARAM)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let existing: HashSet<u64> = steps
            .values()
            .filter(|s| s.block_id == block.id)
            .filter_map(|s| s.iteration_key.as_ref().map(|k| k.index))
            .collect();

        for (index, element) in items.into_iter().enumerate() {
            let index = index as u64;
            if existing.contains(&index) {
                continue;
            }
            let mut sub = StepDefinition::create(&block.workflow_id, ObjectType::Block)
                .with_statement_id(&block.statement_id)
                .with_block_id(&block.id)
                .with_container(&block.id, &block.root_id)
                .with_iteration_key(IterationKey {
                    index,
                    var: var.to_string(),
                    value: element,
                });
            // Same input environment as the foreach block itself; the
            // loop binding rides on the iteration key.
            sub.attributes.params = block.attributes.params.clone();
            sub.attributes.params.remove(FOREACH_ITEMS_PARAM);
            changes.add_created_step(sub);
        }
        Ok(())
    }

    /// Fold one returns record per completed iteration, in index order.
    fn continue_foreach(
        &self,
        block: &mut StepDefinition,
        steps: &HashMap<String, StepDefinition>,
    ) -> Result<(), RuntimeError> {
        let mut subs: Vec<&StepDefinition> = steps
            .values()
            .filter(|s| s.block_id == block.id && s.id != block.id)
            .collect();

        if let Some(errored) = subs.iter().find(|c| c.is_error()) {
            block.propagate_error_from(errored);
            return Ok(());
        }

        let expected = block
            .get_param(FOREACH_ITEMS_PARAM)
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        if subs.len() == expected && subs.iter().all(|s| s.is_complete()) {
            subs.sort_by_key(|s| s.iteration_key.as_ref().map(|k| k.index).unwrap_or_default());
            let results: Vec<Value> = subs
                .iter()
                .map(|s| Value::Object(s.attributes.returns_json()))
                .collect();
            block.set_return(FOREACH_RESULTS_RETURN, Value::Array(results));
            self.advance_to_next(block)?;
        }
        Ok(())
    }

    fn emit(&self, event_type: &str, fields: Value) {
        let fields = fields.as_object().cloned().unwrap_or_default();
        self.telemetry.emit(event_type, fields);
    }
}

/// Param name the foreach block persists its reduced sequence under.
const FOREACH_ITEMS_PARAM: &str = "__items";

/// Return name the foreach block folds its iteration records into.
const FOREACH_RESULTS_RETURN: &str = "results";

struct ExecutionContext<'a> {
    workflow_id: String,
    workflow_ir: &'a Value,
    program_ir: Option<&'a Value>,
    dispatcher: Option<&'a dyn HandlerDispatcher>,
}

fn workflow_name(workflow_ir: &Value) -> Result<&str, RuntimeError> {
    workflow_ir
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| RuntimeError::Evaluation("workflow declaration missing name".into()))
}

fn statement_id_of(workflow_ir: &Value, name: &str) -> String {
    workflow_ir
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("workflow:{name}"))
}

fn body_statement_id(workflow_ir: &Value, body: &Value) -> String {
    body.get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            let name = workflow_ir
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("workflow");
            format!("{name}:body")
        })
}

fn foreach_clause(workflow_ir: &Value) -> Result<&Value, RuntimeError> {
    workflow_ir
        .get("body")
        .and_then(|b| b.get("foreach"))
        .ok_or_else(|| RuntimeError::Evaluation("block has no foreach clause".into()))
}

/// Merge declared parameter defaults into the caller's inputs.
fn apply_param_defaults(
    workflow_ir: &Value,
    mut inputs: Map<String, Value>,
) -> Result<Map<String, Value>, RuntimeError> {
    let params = workflow_ir
        .get("params")
        .and_then(|p| p.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[]);

    for param in params {
        let Some(name) = param.get("name").and_then(|n| n.as_str()) else {
            continue;
        };
        if inputs.contains_key(name) {
            continue;
        }
        if let Some(default) = param.get("default") {
            let expr =
                Expr::from_ir(default).map_err(|e| RuntimeError::Evaluation(e.to_string()))?;
            let value = reduce(&expr, &EvalEnv::default())?;
            inputs.insert(name.to_string(), value);
        }
    }
    Ok(inputs)
}

/// Returns of completed siblings in the same block, keyed by statement
/// binding name.
fn sibling_returns(
    graph: &DependencyGraph,
    step: &StepDefinition,
    steps: &HashMap<String, StepDefinition>,
) -> HashMap<String, Map<String, Value>> {
    let mut by_name = HashMap::new();
    for sibling in steps.values() {
        if sibling.block_id != step.block_id || sibling.id == step.id || !sibling.is_complete() {
            continue;
        }
        if let Some(stmt) = graph.statement(&sibling.statement_id) {
            if !stmt.name.is_empty() {
                by_name.insert(stmt.name.clone(), sibling.attributes.returns_json());
            }
        }
    }
    by_name
}

/// Whether a failed reference names a sibling statement that merely
/// isn't complete yet. A reference into a *completed* sibling (or to
/// something the block never declares) is a genuine failure.
fn references_pending_sibling(
    graph: &DependencyGraph,
    reference: &str,
    step: &StepDefinition,
    steps: &HashMap<String, StepDefinition>,
) -> bool {
    let root = reference
        .split(['.', '['])
        .next()
        .unwrap_or(reference);
    let Some(stmt) = graph.statements().iter().find(|s| s.name == root) else {
        return false;
    };
    !steps
        .values()
        .any(|s| s.block_id == step.block_id && s.statement_id == stmt.id && s.is_complete())
}

fn store_err(e: StoreError) -> RuntimeError {
    RuntimeError::Store(e.to_string())
}
