//! Opaque identifiers.
//!
//! Every identifier is a globally unique string. Subtyping by intent
//! (step, block, workflow, statement, event, server) is tag-only: a short
//! prefix on the rendered form. Stores treat all of them as plain
//! strings. The uuid v7 payload is time-ordered, so ids sort by creation
//! time — the evaluator's deterministic iteration order relies on this.

use uuid::Uuid;

/// Identifier of a step record.
pub type StepId = String;
/// Identifier of a block context.
pub type BlockId = String;
/// Identifier of a workflow instance.
pub type WorkflowId = String;
/// Identifier of an IR statement node.
pub type StatementId = String;
/// Identifier of an event task.
pub type EventId = String;

/// Generate an untagged unique identifier.
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generate a step identifier.
pub fn step_id() -> StepId {
    format!("step-{}", Uuid::now_v7())
}

/// Generate a block identifier.
pub fn block_id() -> BlockId {
    format!("blk-{}", Uuid::now_v7())
}

/// Generate a workflow instance identifier.
pub fn workflow_id() -> WorkflowId {
    format!("wf-{}", Uuid::now_v7())
}

/// Generate an event task identifier.
pub fn event_id() -> EventId {
    format!("evt-{}", Uuid::now_v7())
}

/// Generate a server identifier.
pub fn server_id() -> String {
    format!("srv-{}", Uuid::now_v7())
}
