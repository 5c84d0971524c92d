//! Step records.
//!
//! The step is the durable unit of execution. Every materialized
//! statement, block, and the workflow root itself is one step record;
//! steps form an ownership tree through `container_id` (the root owns
//! itself). `(statement_id, block_id, iteration_key)` uniquely identifies
//! a step under its container — re-creating the same triple is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuntimeError;
use crate::ids;
use crate::states::{self, ObjectType, StepState};
use crate::value::FacetAttributes;

/// Loop disambiguation for foreach children sharing a `statement_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationKey {
    /// Position in the reduced sequence.
    pub index: u64,
    /// Loop variable name.
    pub var: String,
    /// The element bound to the loop variable.
    pub value: Value,
}

/// Ephemeral control block tracking a step's in-flight transition.
///
/// Not durable across commits except through the persisted `state`
/// field; the evaluator uses it to know what changed in the current
/// iteration and what the prior committed state was.
#[derive(Debug, Clone)]
pub struct StepTransition {
    pub original_state: StepState,
    pub current_state: StepState,
    pub request_transition: bool,
    pub changed: bool,
    pub push_me: bool,
    pub error: Option<RuntimeError>,
}

impl StepTransition {
    /// Control block for a freshly created step.
    pub fn initial() -> Self {
        Self {
            original_state: StepState::Created,
            current_state: StepState::Created,
            request_transition: true,
            changed: false,
            push_me: false,
            error: None,
        }
    }

    /// Control block for a step reloaded from persistence.
    pub fn resumed(state: StepState) -> Self {
        Self {
            original_state: state,
            current_state: state,
            request_transition: false,
            changed: false,
            push_me: false,
            error: None,
        }
    }

    pub fn request_state_change(&mut self, request: bool) {
        self.request_transition = request;
        self.changed = true;
    }

    pub fn set_push_me(&mut self, push: bool) {
        self.push_me = push;
    }

    pub fn set_error(&mut self, error: RuntimeError) {
        self.error = Some(error);
        self.changed = true;
    }

    pub fn is_requesting_state_change(&self) -> bool {
        self.request_transition
    }

    pub fn is_requesting_push(&self) -> bool {
        self.push_me
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Fold the in-flight state into the committed baseline.
    pub fn commit(&mut self) {
        self.original_state = self.current_state;
        self.request_transition = false;
        self.changed = false;
        self.push_me = false;
    }
}

impl Default for StepTransition {
    fn default() -> Self {
        Self::initial()
    }
}

/// The durable step record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: ids::StepId,
    pub workflow_id: ids::WorkflowId,
    /// Root step of the owning workflow instance.
    pub root_id: ids::StepId,
    /// Immediate enclosing block/step; the root owns itself.
    pub container_id: ids::StepId,
    pub object_type: ObjectType,
    /// Stable IR node id this step materializes.
    pub statement_id: ids::StatementId,
    /// Block context this step was created under.
    pub block_id: ids::BlockId,
    state: StepState,
    /// Qualified facet name for statement steps.
    pub facet_name: String,
    pub attributes: FacetAttributes,
    pub iteration_key: Option<IterationKey>,
    /// Durable failure detail, set when the step reaches the error sink
    /// and copied upward as the failure propagates through containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// The step the failure originated at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step_id: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(skip, default)]
    pub transition: StepTransition,
}

impl StepDefinition {
    /// Construct a new step in `Created` state. The step initially owns
    /// itself; containment is set via [`with_container`](Self::with_container).
    pub fn create(workflow_id: impl Into<String>, object_type: ObjectType) -> Self {
        let id = ids::step_id();
        Self {
            id: id.clone(),
            workflow_id: workflow_id.into(),
            root_id: id.clone(),
            container_id: id,
            object_type,
            statement_id: String::new(),
            block_id: String::new(),
            state: StepState::Created,
            facet_name: String::new(),
            attributes: FacetAttributes::new(),
            iteration_key: None,
            error_kind: None,
            error_message: None,
            error_step_id: None,
            created: Utc::now(),
            transition: StepTransition::initial(),
        }
    }

    pub fn with_statement_id(mut self, statement_id: impl Into<String>) -> Self {
        self.statement_id = statement_id.into();
        self
    }

    pub fn with_block_id(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = block_id.into();
        self
    }

    pub fn with_container(mut self, container_id: impl Into<String>, root_id: impl Into<String>) -> Self {
        self.container_id = container_id.into();
        self.root_id = root_id.into();
        self
    }

    pub fn with_facet_name(mut self, facet_name: impl Into<String>) -> Self {
        self.facet_name = facet_name.into();
        self
    }

    pub fn with_iteration_key(mut self, key: IterationKey) -> Self {
        self.iteration_key = Some(key);
        self
    }

    /// Committed/current lifecycle state. All mutation goes through
    /// [`change_state`](Self::change_state), [`mark_completed`](Self::mark_completed)
    /// or [`mark_error`](Self::mark_error) so the transition block can
    /// track provenance for the atomic commit.
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Advance to `next`, validating against the step's transition table
    /// (plus the `EventTransmit` side edges), and flag a requested
    /// transition for the commit.
    pub fn change_state(&mut self, next: StepState) -> Result<(), RuntimeError> {
        if !states::is_valid_transition(self.object_type, self.state, next) {
            return Err(RuntimeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.transition.current_state = next;
        self.transition.request_state_change(true);
        Ok(())
    }

    /// Explicit terminal drive to `StatementComplete`.
    pub fn mark_completed(&mut self) {
        self.state = StepState::StatementComplete;
        self.transition.current_state = StepState::StatementComplete;
        self.transition.request_state_change(true);
    }

    /// Explicit terminal drive to `StatementError`.
    pub fn mark_error(&mut self, error: RuntimeError) {
        self.error_kind = Some(error.kind_str().to_string());
        self.error_message = Some(error.to_string());
        self.error_step_id = Some(self.id.clone());
        self.state = StepState::StatementError;
        self.transition.current_state = StepState::StatementError;
        self.transition.set_error(error);
        self.transition.request_state_change(true);
    }

    /// Drive this step to the error sink carrying a failed child's
    /// detail, preserving the originating step.
    pub fn propagate_error_from(&mut self, child: &StepDefinition) {
        self.error_kind = child
            .error_kind
            .clone()
            .or_else(|| Some("StatementError".to_string()));
        self.error_message = child
            .error_message
            .clone()
            .or_else(|| Some(format!("step {} failed", child.id)));
        self.error_step_id = child
            .error_step_id
            .clone()
            .or_else(|| Some(child.id.clone()));
        self.state = StepState::StatementError;
        self.transition.current_state = StepState::StatementError;
        self.transition.request_state_change(true);
    }

    /// Next state per this step's transition table, if any.
    pub fn select_next_state(&self) -> Option<StepState> {
        states::get_next_state(self.state, states::select_transitions(self.object_type))
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: Value) {
        self.attributes.set_param(name, value);
    }

    pub fn set_return(&mut self, name: impl Into<String>, value: Value) {
        self.attributes.set_return(name, value);
    }

    pub fn get_param(&self, name: &str) -> Option<&Value> {
        self.attributes.get_param(name)
    }

    pub fn get_return(&self, name: &str) -> Option<&Value> {
        self.attributes.get_return(name)
    }

    pub fn is_block(&self) -> bool {
        self.object_type.is_block()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn is_error(&self) -> bool {
        self.state.is_error()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Deep copy for a read-modify-write cycle against the store.
    pub fn clone_record(&self) -> Self {
        self.clone()
    }

    /// Rebuild the transition baseline after loading from persistence.
    pub fn reset_transition(&mut self) {
        self.transition = StepTransition::resumed(self.state);
    }
}
