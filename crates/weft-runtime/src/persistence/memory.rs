//! In-memory implementation of the persistence contract.
//!
//! Reference store for tests and single-process setups. All data lives
//! under one `RwLock`, so `commit` and `claim_task` are trivially atomic;
//! every getter returns a deep copy so callers cannot mutate stored
//! records in place.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
    FlowRecord, HandlerRegistration, IterationChanges, ServerRecord, StoreError, TaskRecord,
    TaskState, WorkflowRecord, WorkflowStore,
};
use crate::step::StepDefinition;

#[derive(Default)]
struct Inner {
    steps: HashMap<String, StepDefinition>,
    workflows: HashMap<String, WorkflowRecord>,
    flows: HashMap<String, FlowRecord>,
    tasks: HashMap<String, TaskRecord>,
    servers: HashMap<String, ServerRecord>,
    registrations: HashMap<String, HandlerRegistration>,
}

impl Inner {
    fn step_key_taken(&self, step: &StepDefinition) -> bool {
        self.steps.values().any(|s| {
            !s.statement_id.is_empty()
                && s.statement_id == step.statement_id
                && s.block_id == step.block_id
                && iteration_index(s) == iteration_index(step)
        })
    }
}

fn iteration_index(step: &StepDefinition) -> Option<u64> {
    step.iteration_key.as_ref().map(|k| k.index)
}

/// In-memory [`WorkflowStore`].
///
/// # Example
///
/// ```
/// use weft_runtime::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored steps.
    pub fn step_count(&self) -> usize {
        self.inner.read().steps.len()
    }

    /// Number of tasks currently pending.
    pub fn pending_task_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .count()
    }

    /// Number of stored tasks in any state.
    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }

    /// Drop all data (for tests).
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = Inner::default();
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_step(&self, step: &StepDefinition) -> Result<(), StoreError> {
        self.inner
            .write()
            .steps
            .insert(step.id.clone(), step.clone());
        Ok(())
    }

    async fn get_step(&self, id: &str) -> Result<Option<StepDefinition>, StoreError> {
        Ok(self.inner.read().steps.get(id).cloned())
    }

    async fn get_steps_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn get_steps_by_block(&self, block_id: &str) -> Result<Vec<StepDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.block_id == block_id)
            .cloned()
            .collect())
    }

    async fn step_exists(&self, statement_id: &str, block_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .any(|s| s.statement_id == statement_id && s.block_id == block_id))
    }

    async fn get_workflow_root(
        &self,
        workflow_id: &str,
    ) -> Result<Option<StepDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .find(|s| s.workflow_id == workflow_id && s.container_id == s.id)
            .cloned())
    }

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .workflows
            .insert(workflow.uuid.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.inner.read().workflows.get(id).cloned())
    }

    async fn save_flow(&self, flow: &FlowRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .flows
            .insert(flow.uuid.clone(), flow.clone());
        Ok(())
    }

    async fn get_flow(&self, id: &str) -> Result<Option<FlowRecord>, StoreError> {
        Ok(self.inner.read().flows.get(id).cloned())
    }

    async fn commit(&self, changes: IterationChanges) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        // Validate every compare-and-set before applying anything so the
        // batch is all-or-nothing.
        for update in &changes.updated_steps {
            let stored = inner
                .steps
                .get(&update.step.id)
                .ok_or_else(|| StoreError::StepNotFound(update.step.id.clone()))?;
            if stored.state() != update.expected_state {
                return Err(StoreError::VersionMismatch {
                    step_id: update.step.id.clone(),
                    expected: update.expected_state,
                    actual: stored.state(),
                });
            }
        }

        for update in changes.updated_steps {
            inner.steps.insert(update.step.id.clone(), update.step);
        }

        for step in changes.created_steps {
            // Idempotency: re-creating an existing key is a no-op.
            if !step.statement_id.is_empty() && inner.step_key_taken(&step) {
                continue;
            }
            inner.steps.insert(step.id.clone(), step);
        }

        for task in changes.created_tasks {
            inner.tasks.insert(task.uuid.clone(), task);
        }

        if let Some(workflow) = changes.workflow {
            inner.workflows.insert(workflow.uuid.clone(), workflow);
        }

        Ok(())
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .tasks
            .insert(task.uuid.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.inner.read().tasks.get(id).cloned())
    }

    async fn get_task_by_step(&self, step_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .find(|t| t.step_id == step_id)
            .cloned())
    }

    async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn claim_task(
        &self,
        task_names: &[String],
        task_list: &str,
        claimant: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut inner = self.inner.write();

        // Oldest pending first; uuid breaks created-time ties
        // deterministically.
        let candidate = inner
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Pending
                    && t.task_list == task_list
                    && task_names.contains(&t.name)
            })
            .min_by(|a, b| a.created.cmp(&b.created).then(a.uuid.cmp(&b.uuid)))
            .map(|t| t.uuid.clone());

        let Some(uuid) = candidate else {
            return Ok(None);
        };

        let task = inner
            .tasks
            .get_mut(&uuid)
            .ok_or_else(|| StoreError::TaskNotFound(uuid.clone()))?;
        task.state = TaskState::Running;
        task.runner_id = claimant.to_string();
        task.updated = Utc::now();

        Ok(Some(task.clone()))
    }

    async fn save_server(&self, server: &ServerRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .servers
            .insert(server.uuid.clone(), server.clone());
        Ok(())
    }

    async fn get_server(&self, id: &str) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self.inner.read().servers.get(id).cloned())
    }

    async fn update_server_ping(
        &self,
        id: &str,
        ping_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let server = inner
            .servers
            .get_mut(id)
            .ok_or_else(|| StoreError::ServerNotFound(id.to_string()))?;
        server.ping_time = ping_time;
        Ok(())
    }

    async fn save_handler_registration(
        &self,
        registration: &HandlerRegistration,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .registrations
            .insert(registration.facet_name.clone(), registration.clone());
        Ok(())
    }

    async fn get_handler_registration(
        &self,
        facet_name: &str,
    ) -> Result<Option<HandlerRegistration>, StoreError> {
        Ok(self.inner.read().registrations.get(facet_name).cloned())
    }

    async fn list_handler_registrations(&self) -> Result<Vec<HandlerRegistration>, StoreError> {
        let mut registrations: Vec<_> = self.inner.read().registrations.values().cloned().collect();
        registrations.sort_by(|a, b| a.facet_name.cmp(&b.facet_name));
        Ok(registrations)
    }

    async fn delete_handler_registration(&self, facet_name: &str) -> Result<(), StoreError> {
        self.inner.write().registrations.remove(facet_name);
        Ok(())
    }
}
