//! Persistence contract.
//!
//! The [`WorkflowStore`] trait is the complete interface the engine
//! requires of a backing store. All coordination between evaluators and
//! workers flows through it: iteration deltas commit atomically with a
//! compare-and-set on each step's expected prior state, and
//! [`claim_task`](WorkflowStore::claim_task) is the single primitive that
//! makes multiple worker processes safe.
//!
//! Implementations must be thread-safe; every operation is atomic at the
//! granularity described on the method.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::states::StepState;
use crate::step::StepDefinition;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// A concurrent writer committed first: the step's stored state does
    /// not match the expected prior state.
    #[error("version mismatch on step {step_id}: expected {expected}, found {actual}")]
    VersionMismatch {
        step_id: String,
        expected: StepState,
        actual: StepState,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Error payload carried by a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
}

/// A queued unit of external work: the record for a paused step waiting
/// on a handler. `name` equals the qualified facet name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub uuid: String,
    pub name: String,
    pub step_id: String,
    pub workflow_id: String,
    /// Claimant identity, stamped by `claim_task`.
    pub runner_id: String,
    pub task_list: String,
    /// Handler payload: the step's params as plain JSON.
    pub data: Map<String, Value>,
    pub state: TaskState,
    pub error: Option<TaskError>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a pending task for a step awaiting an external event.
    pub fn pending(
        name: impl Into<String>,
        step_id: impl Into<String>,
        workflow_id: impl Into<String>,
        task_list: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: crate::ids::event_id(),
            name: name.into(),
            step_id: step_id.into(),
            workflow_id: workflow_id.into(),
            runner_id: String::new(),
            task_list: task_list.into(),
            data,
            state: TaskState::Pending,
            error: None,
            created: now,
            updated: now,
        }
    }
}

/// Workflow instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Paused,
    Completed,
    Failed,
}

/// One execution of a workflow; owns a tree of steps rooted at a root
/// step. Retained after completion for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub uuid: String,
    pub name: String,
    /// The compiled program this instance was launched from.
    pub flow_id: String,
    pub state: WorkflowState,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Evaluator passes taken so far.
    pub iterations: u32,
}

/// A persisted compiled program. `source` is the compiled JSON text,
/// reparsed when a worker hydrates its AST cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub uuid: String,
    pub name: String,
    pub source: String,
}

/// Worker liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Running,
    Shutdown,
}

/// Heartbeat and identity record for a running worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub uuid: String,
    pub server_group: String,
    pub service_name: String,
    pub server_name: String,
    pub server_ips: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub ping_time: DateTime<Utc>,
    pub topics: Vec<String>,
    pub handlers: Vec<String>,
    pub state: ServerState,
}

/// A persisted handler binding: facet name → loadable entrypoint.
/// Registering the same facet name again replaces the prior
/// registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerRegistration {
    pub facet_name: String,
    pub module_uri: String,
    pub entrypoint: String,
    pub version: String,
    /// Cache-invalidation checksum; part of the module memoization key.
    pub checksum: String,
    pub timeout_ms: u64,
    pub requirements: Vec<String>,
    pub metadata: Map<String, Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl HandlerRegistration {
    pub fn new(facet_name: impl Into<String>, module_uri: impl Into<String>, entrypoint: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            facet_name: facet_name.into(),
            module_uri: module_uri.into(),
            entrypoint: entrypoint.into(),
            version: "1.0.0".to_string(),
            checksum: String::new(),
            timeout_ms: 30_000,
            requirements: Vec::new(),
            metadata: Map::new(),
            created: now,
            updated: now,
        }
    }
}

/// An update of an existing step, compare-and-set on the state the
/// caller read.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub expected_state: StepState,
    pub step: StepDefinition,
}

/// The atomic batch of deltas produced by one evaluator iteration.
/// Either all of it becomes visible, or none of it.
#[derive(Debug, Clone, Default)]
pub struct IterationChanges {
    pub created_steps: Vec<StepDefinition>,
    pub updated_steps: Vec<StepUpdate>,
    pub created_tasks: Vec<TaskRecord>,
    pub workflow: Option<WorkflowRecord>,
}

impl IterationChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_created_step(&mut self, step: StepDefinition) {
        self.created_steps.push(step);
    }

    pub fn add_updated_step(&mut self, expected_state: StepState, step: StepDefinition) {
        self.updated_steps.push(StepUpdate {
            expected_state,
            step,
        });
    }

    pub fn add_created_task(&mut self, task: TaskRecord) {
        self.created_tasks.push(task);
    }

    pub fn set_workflow(&mut self, workflow: WorkflowRecord) {
        self.workflow = Some(workflow);
    }

    pub fn is_empty(&self) -> bool {
        self.created_steps.is_empty()
            && self.updated_steps.is_empty()
            && self.created_tasks.is_empty()
            && self.workflow.is_none()
    }
}

/// Store for workflow instances, steps, tasks, flows, servers and
/// handler registrations.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Step Operations
    // =========================================================================

    async fn save_step(&self, step: &StepDefinition) -> Result<(), StoreError>;

    async fn get_step(&self, id: &str) -> Result<Option<StepDefinition>, StoreError>;

    async fn get_steps_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError>;

    async fn get_steps_by_block(&self, block_id: &str) -> Result<Vec<StepDefinition>, StoreError>;

    /// Idempotency probe for the `(statement_id, block_id)` key.
    async fn step_exists(&self, statement_id: &str, block_id: &str) -> Result<bool, StoreError>;

    /// The root step of a workflow instance (the step that owns itself).
    async fn get_workflow_root(
        &self,
        workflow_id: &str,
    ) -> Result<Option<StepDefinition>, StoreError>;

    // =========================================================================
    // Workflow / Flow Operations
    // =========================================================================

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError>;

    async fn save_flow(&self, flow: &FlowRecord) -> Result<(), StoreError>;

    async fn get_flow(&self, id: &str) -> Result<Option<FlowRecord>, StoreError>;

    // =========================================================================
    // Iteration Commit
    // =========================================================================

    /// Apply one iteration's deltas atomically. Step updates are
    /// compare-and-set on `expected_state`; on conflict the whole batch
    /// is rejected with [`StoreError::VersionMismatch`] and the caller
    /// reloads and retries. Step creations whose
    /// `(statement_id, block_id, iteration_key)` already exists are
    /// no-ops.
    async fn commit(&self, changes: IterationChanges) -> Result<(), StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// The task created for a paused step, if any.
    async fn get_task_by_step(&self, step_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<TaskRecord>, StoreError>;

    /// Atomically select one `Pending` task whose `name` is in
    /// `task_names` and whose `task_list` matches, transition it to
    /// `Running`, stamp `runner_id` with `claimant`, and return it.
    /// Returns `None` without blocking when nothing is claimable.
    ///
    /// At-most-once across all callers: this is the coordination
    /// primitive that makes horizontal worker scaling safe. Claims are
    /// FIFO by creation time; ties must break deterministically within a
    /// store (this crate's stores use `(created, uuid)`).
    async fn claim_task(
        &self,
        task_names: &[String],
        task_list: &str,
        claimant: &str,
    ) -> Result<Option<TaskRecord>, StoreError>;

    // =========================================================================
    // Server Registry Operations
    // =========================================================================

    async fn save_server(&self, server: &ServerRecord) -> Result<(), StoreError>;

    async fn get_server(&self, id: &str) -> Result<Option<ServerRecord>, StoreError>;

    async fn update_server_ping(
        &self,
        id: &str,
        ping_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Handler Registration Operations
    // =========================================================================

    /// Save a registration, replacing any prior one for the same facet
    /// name.
    async fn save_handler_registration(
        &self,
        registration: &HandlerRegistration,
    ) -> Result<(), StoreError>;

    async fn get_handler_registration(
        &self,
        facet_name: &str,
    ) -> Result<Option<HandlerRegistration>, StoreError>;

    async fn list_handler_registrations(&self) -> Result<Vec<HandlerRegistration>, StoreError>;

    async fn delete_handler_registration(&self, facet_name: &str) -> Result<(), StoreError>;
}
