//! # Weft Runtime
//!
//! Durable, event-driven execution of compiled Weft workflows.
//!
//! A compiled workflow is materialized as a graph of persistent step
//! records and reduced iteratively: every pass advances each live step by
//! at most one state through a fixed transition table, resolves data
//! dependencies between sibling steps, and commits the resulting deltas
//! atomically. A workflow either runs to completion, or pauses on an
//! event facet — recording a task that a pool of workers claims, hands to
//! a handler, and feeds back to resume the workflow.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Evaluator                            │
//! │   (iterative reducer: one state per step per iteration,     │
//! │    dependency-gated step creation, atomic iteration commits)│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowStore                          │
//! │   (steps, workflows, flows, tasks, servers, registrations;  │
//! │    compare-and-set commit, atomic claim_task)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │   (claims event tasks, dispatches handlers, continues the   │
//! │    step, resumes the workflow; heartbeat + graceful stop)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The persistence contract is the entire concurrency model: multiple
//! worker processes coordinate only through the store's atomic
//! `claim_task` and compare-and-set `commit`.

pub mod dispatch;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod ids;
pub mod persistence;
pub mod reduce;
pub mod states;
pub mod step;
pub mod telemetry;
pub mod value;
pub mod worker;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::dispatch::{
        CompositeDispatcher, DispatchError, HandlerDispatcher, InMemoryDispatcher,
        RegistryDispatcher,
    };
    pub use crate::error::RuntimeError;
    pub use crate::evaluator::{Evaluator, EvaluatorConfig, ExecutionResult, ExecutionStatus};
    pub use crate::persistence::{
        FlowRecord, HandlerRegistration, IterationChanges, MemoryStore, ServerRecord,
        ServerState, StoreError, TaskRecord, TaskState, WorkflowRecord, WorkflowState,
        WorkflowStore,
    };
    pub use crate::states::{ObjectType, StepState};
    pub use crate::step::StepDefinition;
    pub use crate::telemetry::Telemetry;
    pub use crate::value::{AttributeValue, FacetAttributes};
    pub use crate::worker::{Worker, WorkerConfig};
}

pub use dispatch::{
    CompositeDispatcher, DispatchError, EntrypointTable, HandlerDispatcher, InMemoryDispatcher,
    RegistryDispatcher, SubprocessConfig, SubprocessDispatcher,
};
pub use error::RuntimeError;
pub use evaluator::{Evaluator, EvaluatorConfig, ExecutionResult, ExecutionStatus};
pub use graph::DependencyGraph;
pub use persistence::{
    FlowRecord, HandlerRegistration, IterationChanges, MemoryStore, ServerRecord, ServerState,
    StoreError, TaskRecord, TaskState, WorkflowRecord, WorkflowState, WorkflowStore,
};
pub use states::{ObjectType, StepState};
pub use step::{StepDefinition, StepTransition};
pub use telemetry::{Telemetry, TelemetryEvent};
pub use value::{AttributeValue, FacetAttributes};
pub use worker::{Worker, WorkerConfig};
